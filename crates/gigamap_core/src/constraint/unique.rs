//! Unique constraints.

use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexRegistry;
use crate::types::IndexId;

/// The indices whose keys may each be held by one entity at most.
#[derive(Debug, Default)]
pub struct UniqueConstraints {
    indices: Vec<(IndexId, String)>,
}

impl UniqueConstraints {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the index unique.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the index is already unique.
    pub fn add(&mut self, index: IndexId, name: &str) -> CoreResult<()> {
        if self.contains(index) {
            return Err(CoreError::duplicate_name("unique constraint", name));
        }
        self.indices.push((index, name.to_string()));
        Ok(())
    }

    /// Drops the constraint of an index. Returns whether one existed.
    pub fn remove(&mut self, index: IndexId) -> bool {
        let before = self.indices.len();
        self.indices.retain(|(id, _)| *id != index);
        before != self.indices.len()
    }

    /// Whether the index is unique.
    #[must_use]
    pub fn contains(&self, index: IndexId) -> bool {
        self.indices.iter().any(|(id, _)| *id == index)
    }

    /// Names of the unique indices, in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.indices.iter().map(|(_, name)| name.as_str()).collect()
    }

    /// Number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Checks if there are no constraints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Checks the pending plans of every unique index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConstraintViolation`] naming the first index
    /// whose planned key is held by another entity.
    pub fn check<E>(&self, registry: &IndexRegistry<E>, entity_id: EntityId) -> CoreResult<()> {
        for (index, name) in &self.indices {
            let Some(maintainer) = registry.get(*index) else {
                continue;
            };
            if let Some((holder, key)) = maintainer.conflicting_holder()? {
                tracing::debug!(constraint = %name, %entity_id, %holder, "unique constraint violated");
                return Err(CoreError::constraint_violation(
                    name.clone(),
                    entity_id,
                    format!("key {} is already held by entity {}", key, holder),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HashingFn, HashingIndex};
    use crate::state::ChangeSet;

    #[test]
    fn declaring_twice_fails() {
        let mut unique = UniqueConstraints::new();
        unique.add(IndexId::new(0), "email").unwrap();
        assert!(unique.add(IndexId::new(0), "email").is_err());
        assert_eq!(unique.names(), vec!["email"]);
        assert!(unique.remove(IndexId::new(0)));
        assert!(!unique.remove(IndexId::new(0)));
    }

    #[test]
    fn conflicting_plan_is_a_violation() {
        let mut registry: IndexRegistry<String> = IndexRegistry::new();
        let mut changes = ChangeSet::new();
        let index = HashingIndex::new(registry.next_id(), HashingFn::new("text", |s: &String| s.clone()), 2);
        registry.register(Box::new(index), &mut changes).unwrap();
        let mut unique = UniqueConstraints::new();
        unique.add(IndexId::new(0), "text").unwrap();

        let a = "a".to_string();
        registry.prepare_all(EntityId::new(0), None, Some(&a)).unwrap();
        unique.check(&registry, EntityId::new(0)).unwrap();
        registry.commit_all(&mut changes).unwrap();

        registry.prepare_all(EntityId::new(1), None, Some(&a)).unwrap();
        let err = unique.check(&registry, EntityId::new(1)).unwrap_err();
        registry.abort_all();
        match err {
            CoreError::ConstraintViolation { constraint, entity_id, .. } => {
                assert_eq!(constraint, "text");
                assert_eq!(entity_id, EntityId::new(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.get_by_name("text").map(|index| index.entry_count()), Some(1));
    }
}
