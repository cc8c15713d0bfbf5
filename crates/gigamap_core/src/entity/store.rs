//! The sharded entity store.
//!
//! Entities live in fixed-size Level1 segments. Level2 segments hold a
//! fixed number of lazy Level1 references; the growable Level3 table holds
//! lazy Level2 references. Segments are allocated on first write.

use super::id::{EntityAddress, EntityId};
use crate::config::GigaMapConfig;
use crate::error::{CoreError, CoreResult};
use crate::lazy::{Lazy, UsageMarker};
use crate::state::{ChangeSet, NodeId};
use std::sync::Arc;

/// A leaf segment of entity slots.
pub(crate) struct Level1<E> {
    pub(crate) slots: Vec<Option<Arc<E>>>,
}

impl<E> Level1<E> {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
        }
    }
}

/// A segment of lazy Level1 references.
pub(crate) struct Level2<E> {
    pub(crate) segments: Vec<Option<Lazy<Level1<E>>>>,
}

impl<E> Level2<E> {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            segments: (0..len).map(|_| None).collect(),
        }
    }
}

/// Maps entity IDs to entities.
pub struct EntityStore<E> {
    level3: Vec<Option<Lazy<Level2<E>>>>,
    config: GigaMapConfig,
    next_id: EntityId,
    size: u64,
}

impl<E> EntityStore<E> {
    /// Creates an empty store. The configuration must already be validated.
    pub fn new(config: GigaMapConfig) -> Self {
        let level3 = (0..config.level3_min_len()).map(|_| None).collect();
        Self {
            level3,
            config,
            next_id: EntityId::new(0),
            size: 0,
        }
    }

    /// The store's segment geometry.
    pub fn config(&self) -> &GigaMapConfig {
        &self.config
    }

    /// Number of stored entities.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The ID the next added entity receives.
    pub fn next_id(&self) -> EntityId {
        self.next_id
    }

    /// Current Level3 capacity.
    pub fn level3_capacity(&self) -> usize {
        self.level3.len()
    }

    /// Number of allocated Level2 segments.
    pub fn level2_segment_count(&self) -> usize {
        self.level3.iter().flatten().count()
    }

    /// Returns the entity stored under `id`.
    ///
    /// Removed and never issued IDs yield `None`.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn get(&self, id: EntityId) -> CoreResult<Option<Arc<E>>> {
        if id >= self.next_id {
            return Ok(None);
        }
        let address = id.address(&self.config);
        let Some(Some(level2_ref)) = self.level3.get(address.level3) else {
            return Ok(None);
        };
        let level2 = level2_ref.get()?;
        let Some(Some(level1_ref)) = level2.segments.get(address.level2) else {
            return Ok(None);
        };
        let level1 = level1_ref.get()?;
        Ok(level1.slots.get(address.level1).cloned().flatten())
    }

    /// Stores an entity under the next free ID.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CapacityExceeded`] once the configured maximum
    /// is reached, or propagates segment load errors.
    pub fn add(&mut self, entity: Arc<E>, changes: &mut ChangeSet) -> CoreResult<EntityId> {
        let id = self.next_id;
        if id.as_u64() >= self.config.max_entities() {
            return Err(CoreError::CapacityExceeded {
                entity_id: id,
                max_entities: self.config.max_entities(),
            });
        }

        let address = id.address(&self.config);
        self.ensure_level3_capacity(address.level3, changes);
        let level1 = self.level1_mut(address, true, changes)?.ok_or_else(|| {
            CoreError::segment_corruption(format!("no entity segment allocated for {}", id))
        })?;
        level1.slots[address.level1] = Some(entity);

        changes.touch_entity_slot(address.level3, address.level2);
        self.next_id = id.next();
        self.size += 1;
        Ok(id)
    }

    /// Replaces the entity under `id`, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if no entity is stored under `id`.
    pub fn replace(
        &mut self,
        id: EntityId,
        entity: Arc<E>,
        changes: &mut ChangeSet,
    ) -> CoreResult<Arc<E>> {
        let address = self.issued_address(id)?;
        let slot = self
            .level1_mut(address, false, changes)?
            .and_then(|level1| level1.slots.get_mut(address.level1))
            .filter(|slot| slot.is_some())
            .ok_or(CoreError::EntityNotFound { entity_id: id })?;
        let previous = slot.replace(entity);
        changes.touch_entity_slot(address.level3, address.level2);
        previous.ok_or(CoreError::EntityNotFound { entity_id: id })
    }

    /// Clears the slot of `id`. The ID is never issued again.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn remove(&mut self, id: EntityId, changes: &mut ChangeSet) -> CoreResult<Option<Arc<E>>> {
        let Ok(address) = self.issued_address(id) else {
            return Ok(None);
        };
        let removed = self
            .level1_mut(address, false, changes)?
            .and_then(|level1| level1.slots.get_mut(address.level1))
            .and_then(Option::take);
        if removed.is_some() {
            changes.touch_entity_slot(address.level3, address.level2);
            self.size -= 1;
        }
        Ok(removed)
    }

    /// Drops every entity and segment. IDs keep counting from where they were.
    pub fn remove_all(&mut self, changes: &mut ChangeSet) {
        for level2_ref in self.level3.drain(..).flatten() {
            if let Some(handle) = level2_ref.handle() {
                changes.release_handle(handle);
            }
            let Some(level2) = level2_ref.peek() else {
                continue;
            };
            for handle in level2.segments.iter().flatten().filter_map(Lazy::handle) {
                changes.release_handle(handle);
            }
        }
        self.level3 = (0..self.config.level3_min_len()).map(|_| None).collect();
        self.size = 0;

        changes.forget_where(|node| {
            matches!(node, NodeId::EntityLevel1 { .. } | NodeId::EntityLevel2 { .. })
        });
        changes.mark_changed(NodeId::EntityLevel3);
        changes.mark_children_changed(NodeId::Map);
    }

    /// Visits every stored entity in ID order.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors and errors returned by `visit`.
    pub fn for_each(
        &self,
        mut visit: impl FnMut(EntityId, &Arc<E>) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let level1_exponent = self.config.level1_exponent;
        let level2_shift = self.config.level1_exponent + self.config.level2_exponent;
        for (level3, level2_ref) in self.level3.iter().enumerate() {
            let Some(level2_ref) = level2_ref else { continue };
            let level2 = level2_ref.get()?;
            for (index2, level1_ref) in level2.segments.iter().enumerate() {
                let Some(level1_ref) = level1_ref else { continue };
                let level1 = level1_ref.get()?;
                let base = ((level3 as u64) << level2_shift) | ((index2 as u64) << level1_exponent);
                for (index1, slot) in level1.slots.iter().enumerate() {
                    if let Some(entity) = slot {
                        visit(EntityId::new(base | index1 as u64), entity)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn level2_refs_mut(&mut self) -> impl Iterator<Item = (usize, &mut Lazy<Level2<E>>)> {
        self.level3
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|level2| (index, level2)))
    }

    fn issued_address(&self, id: EntityId) -> CoreResult<EntityAddress> {
        if id >= self.next_id {
            return Err(CoreError::EntityNotFound { entity_id: id });
        }
        Ok(id.address(&self.config))
    }

    fn ensure_level3_capacity(&mut self, level3: usize, changes: &mut ChangeSet) {
        let current = self.level3.len();
        if level3 < current {
            return;
        }
        let max = self.config.level3_max_len();
        let mut capacity = current;
        while capacity <= level3 {
            capacity = (capacity + capacity / 10).max(capacity + 1);
        }
        let capacity = capacity.min(max);
        tracing::debug!(from = current, to = capacity, "growing entity level3 table");
        self.level3.resize_with(capacity, || None);
        changes.mark_changed(NodeId::EntityLevel3);
    }

    fn level1_mut(
        &mut self,
        address: EntityAddress,
        create: bool,
        changes: &mut ChangeSet,
    ) -> CoreResult<Option<&mut Level1<E>>> {
        let level1_len = self.config.level1_len();
        let level2_len = self.config.level2_len();

        let Some(level3_slot) = self.level3.get_mut(address.level3) else {
            return Ok(None);
        };
        if level3_slot.is_none() {
            if !create {
                return Ok(None);
            }
            changes.mark_new(NodeId::EntityLevel2 {
                level3: address.level3,
            });
            changes.mark_changed(NodeId::EntityLevel3);
        }
        let level2_ref = level3_slot.get_or_insert_with(|| Lazy::new(Level2::new(level2_len)));
        level2_ref.mark_used_for(UsageMarker::DIRTY);
        let level2 = level2_ref.get_mut()?;

        let level2_slot = &mut level2.segments[address.level2];
        if level2_slot.is_none() {
            if !create {
                return Ok(None);
            }
            changes.mark_new(NodeId::EntityLevel1 {
                level3: address.level3,
                level2: address.level2,
            });
            changes.mark_changed(NodeId::EntityLevel2 {
                level3: address.level3,
            });
        }
        let level1_ref = level2_slot.get_or_insert_with(|| Lazy::new(Level1::new(level1_len)));
        level1_ref.mark_used_for(UsageMarker::DIRTY);
        Ok(Some(level1_ref.get_mut()?))
    }
}

impl<E> std::fmt::Debug for EntityStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("size", &self.size)
            .field("next_id", &self.next_id)
            .field("level3_capacity", &self.level3.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntityStore<String> {
        EntityStore::new(GigaMapConfig::compact())
    }

    fn add(store: &mut EntityStore<String>, value: &str, changes: &mut ChangeSet) -> EntityId {
        store.add(Arc::new(value.to_string()), changes).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut store = store();
        let mut changes = ChangeSet::new();
        let ids: Vec<_> = (0..40)
            .map(|i| add(&mut store, &format!("e{i}"), &mut changes))
            .collect();

        assert_eq!(ids[0], EntityId::new(0));
        assert_eq!(ids[39], EntityId::new(39));
        assert_eq!(store.size(), 40);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*store.get(*id).unwrap().unwrap(), format!("e{i}"));
        }
        assert!(store.get(EntityId::new(40)).unwrap().is_none());
    }

    #[test]
    fn level3_grows_by_at_least_one() {
        let mut store = store(); // 16 IDs per Level2 segment
        let mut changes = ChangeSet::new();
        assert_eq!(store.level3_capacity(), 1);

        for i in 0..17 {
            add(&mut store, &i.to_string(), &mut changes);
        }
        assert_eq!(store.level3_capacity(), 2);
        assert_eq!(store.level2_segment_count(), 2);
    }

    #[test]
    fn level3_grows_geometrically() {
        let config = GigaMapConfig::compact().level3_exponents(5, 20);
        let mut store: EntityStore<u32> = EntityStore::new(config);
        let mut changes = ChangeSet::new();
        for i in 0..(32 * 16 + 1) {
            store.add(Arc::new(i), &mut changes).unwrap();
        }
        // 32 + 3
        assert_eq!(store.level3_capacity(), 35);
    }

    #[test]
    fn capacity_is_bounded() {
        let config = GigaMapConfig::compact().level3_exponents(0, 1); // 32 IDs
        let mut store: EntityStore<u32> = EntityStore::new(config);
        let mut changes = ChangeSet::new();
        for i in 0..32 {
            store.add(Arc::new(i), &mut changes).unwrap();
        }
        let err = store.add(Arc::new(32), &mut changes).unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded { max_entities: 32, .. }));
        assert_eq!(store.size(), 32);
    }

    #[test]
    fn replace_and_remove() {
        let mut store = store();
        let mut changes = ChangeSet::new();
        let id = add(&mut store, "old", &mut changes);

        let previous = store.replace(id, Arc::new("new".into()), &mut changes).unwrap();
        assert_eq!(*previous, "old");
        assert_eq!(*store.get(id).unwrap().unwrap(), "new");

        assert_eq!(*store.remove(id, &mut changes).unwrap().unwrap(), "new");
        assert!(store.get(id).unwrap().is_none());
        assert!(store.remove(id, &mut changes).unwrap().is_none());
        assert_eq!(store.size(), 0);

        assert!(matches!(
            store.replace(id, Arc::new("again".into()), &mut changes),
            Err(CoreError::EntityNotFound { .. })
        ));
        assert!(matches!(
            store.replace(EntityId::new(99), Arc::new("never".into()), &mut changes),
            Err(CoreError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn ids_are_not_reused_after_remove_all() {
        let mut store = store();
        let mut changes = ChangeSet::new();
        add(&mut store, "a", &mut changes);
        add(&mut store, "b", &mut changes);
        store.remove_all(&mut changes);

        assert_eq!(store.size(), 0);
        assert!(store.get(EntityId::new(0)).unwrap().is_none());
        assert_eq!(add(&mut store, "c", &mut changes), EntityId::new(2));
    }

    #[test]
    fn add_marks_the_address_chain() {
        let mut store = store();
        let mut changes = ChangeSet::new();
        for i in 0..6 {
            add(&mut store, &i.to_string(), &mut changes);
        }
        let level1 = NodeId::EntityLevel1 {
            level3: 0,
            level2: 1,
        };
        assert!(changes.is_instance_new_or_changed(&level1));
        assert!(!changes.is_changed_and_not_new(&level1));
        assert!(changes.is_instance_new_or_changed(&NodeId::EntityLevel2 { level3: 0 }));
        assert!(changes.is_children_changed(&NodeId::EntityLevel3));
    }

    #[test]
    fn for_each_visits_in_id_order() {
        let mut store = store();
        let mut changes = ChangeSet::new();
        for i in 0..20 {
            add(&mut store, &i.to_string(), &mut changes);
        }
        store.remove(EntityId::new(7), &mut changes).unwrap();

        let mut seen = Vec::new();
        store
            .for_each(|id, entity| {
                assert_eq!(**entity, id.as_u64().to_string());
                seen.push(id.as_u64());
                Ok(())
            })
            .unwrap();
        let expected: Vec<u64> = (0..20).filter(|i| *i != 7).collect();
        assert_eq!(seen, expected);
    }
}
