//! Custom constraints.

use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::index::default_name;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A validation rule run before every add and replace.
pub trait CustomConstraint<E>: Send + Sync + 'static {
    /// Name of the constraint, unique within a map.
    fn name(&self) -> String {
        default_name::<Self>()
    }

    /// Checks the prospective state of one entity.
    ///
    /// `replaced` is the entity currently stored under `id`, `None` for an
    /// add.
    ///
    /// # Errors
    ///
    /// Returns a description of the violation.
    fn check(&self, id: EntityId, replaced: Option<&E>, entity: &E) -> Result<(), String>;
}

/// A custom constraint built from a closure.
pub struct ConstraintFn<E, F> {
    name: String,
    check: F,
    _marker: PhantomData<fn(&E)>,
}

impl<E, F> ConstraintFn<E, F>
where
    F: Fn(EntityId, Option<&E>, &E) -> Result<(), String>,
{
    /// Creates a named constraint.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
            _marker: PhantomData,
        }
    }
}

impl<E, F> CustomConstraint<E> for ConstraintFn<E, F>
where
    E: 'static,
    F: Fn(EntityId, Option<&E>, &E) -> Result<(), String> + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn check(&self, id: EntityId, replaced: Option<&E>, entity: &E) -> Result<(), String> {
        (self.check)(id, replaced, entity)
    }
}

struct Registered<E> {
    name: String,
    constraint: Box<dyn CustomConstraint<E>>,
}

/// Named custom constraints in registration order.
pub struct CustomConstraints<E> {
    constraints: Vec<Registered<E>>,
}

impl<E> Default for CustomConstraints<E> {
    fn default() -> Self {
        Self {
            constraints: Vec::new(),
        }
    }
}

impl<E: 'static> CustomConstraints<E> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `name` is taken.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`].
    pub fn ensure_unused(&self, name: &str) -> CoreResult<()> {
        if self.constraints.iter().any(|c| c.name == name) {
            return Err(CoreError::duplicate_name("custom constraint", name));
        }
        Ok(())
    }

    /// Registers a constraint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn add(&mut self, constraint: Box<dyn CustomConstraint<E>>) -> CoreResult<()> {
        let name = constraint.name();
        self.ensure_unused(&name)?;
        self.constraints.push(Registered { name, constraint });
        Ok(())
    }

    /// Unregisters a constraint by name. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.constraints.len();
        self.constraints.retain(|c| c.name != name);
        before != self.constraints.len()
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.constraints.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Checks if there are no constraints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Runs every constraint against the prospective state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConstraintViolation`] for the first constraint
    /// that rejects the entity or panics.
    pub fn check(&self, id: EntityId, replaced: Option<&E>, entity: &E) -> CoreResult<()> {
        self.constraints
            .iter()
            .try_for_each(|registered| check_one(registered, id, replaced, entity))
    }

    /// Runs one constraint against the prospective state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConstraintViolation`] if the constraint rejects
    /// the entity or panics; [`CoreError::IndexNotFound`] if no constraint
    /// has the name.
    pub fn check_named(&self, name: &str, id: EntityId, replaced: Option<&E>, entity: &E) -> CoreResult<()> {
        let registered = self
            .constraints
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CoreError::index_not_found(name))?;
        check_one(registered, id, replaced, entity)
    }
}

fn check_one<E: 'static>(registered: &Registered<E>, id: EntityId, replaced: Option<&E>, entity: &E) -> CoreResult<()> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        registered.constraint.check(id, replaced, entity)
    }));
    let message = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(message)) => message,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "constraint panicked".to_string());
            format!("constraint logic failed: {}", reason)
        }
    };
    tracing::debug!(constraint = %registered.name, entity_id = %id, %message, "custom constraint violated");
    Err(CoreError::constraint_violation(
        registered.name.clone(),
        id,
        match replaced {
            Some(_) => format!("replacing entity {}: {}", id, message),
            None => message,
        },
    ))
}

impl<E: 'static> std::fmt::Debug for CustomConstraints<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomConstraints")
            .field("names", &self.names())
            .finish()
    }
}
