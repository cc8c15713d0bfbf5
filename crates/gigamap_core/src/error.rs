//! Error types for GigaMap core.

use crate::entity::EntityId;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A type-erased entity carried by a [`CoreError::ConstraintViolation`].
pub type AnyEntity = Arc<dyn Any + Send + Sync>;

/// Errors that can occur in GigaMap core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Segment store error.
    #[error("storage error: {0}")]
    Storage(#[from] gigamap_storage::StorageError),

    /// A unique or custom constraint rejected a mutation.
    ///
    /// The collection and all indices are unchanged.
    #[error("constraint '{constraint}' violated by entity {entity_id}: {message}")]
    ConstraintViolation {
        /// Name of the violated constraint.
        constraint: String,
        /// The ID the offending entity was (or would have been) stored under.
        entity_id: EntityId,
        /// What the constraint reported.
        message: String,
        /// The entity that was being replaced, for rejected replaces.
        replaced: Option<AnyEntity>,
        /// The rejected entity. Absent when a constraint is rejected while
        /// being registered against stored entities.
        offending: Option<AnyEntity>,
    },

    /// A configuration or declaration problem, raised at the call that introduced it.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },

    /// An entity payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A name is already taken by another index or constraint.
    #[error("duplicate {kind} name: {name}")]
    DuplicateName {
        /// What kind of object carries the name.
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// A segment failed its own layout check while loading.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// An operation the target does not support.
    #[error("unsupported operation: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// A parallel iteration worker did not complete its range.
    #[error("iteration worker failed: {message}")]
    WorkerFailed {
        /// Description of the failure.
        message: String,
    },

    /// No entity is stored under the ID.
    #[error("entity not found: {entity_id}")]
    EntityNotFound {
        /// The ID that was looked up.
        entity_id: EntityId,
    },

    /// No index with the name is registered.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// The entity store cannot address more entities.
    #[error("capacity exceeded: entity {entity_id} is beyond the configured maximum of {max_entities}")]
    CapacityExceeded {
        /// The ID that could not be addressed.
        entity_id: EntityId,
        /// Number of addressable IDs.
        max_entities: u64,
    },
}

impl CoreError {
    /// Creates a constraint violation error.
    pub fn constraint_violation(
        constraint: impl Into<String>,
        entity_id: EntityId,
        message: impl Into<String>,
    ) -> Self {
        Self::ConstraintViolation {
            constraint: constraint.into(),
            entity_id,
            message: message.into(),
            replaced: None,
            offending: None,
        }
    }

    /// Attaches the replaced and offending entities to a constraint
    /// violation. Other errors are returned as they are.
    #[must_use]
    pub fn with_entities(self, replaced: Option<AnyEntity>, offending: AnyEntity) -> Self {
        match self {
            Self::ConstraintViolation {
                constraint,
                entity_id,
                message,
                ..
            } => Self::ConstraintViolation {
                constraint,
                entity_id,
                message,
                replaced,
                offending: Some(offending),
            },
            other => other,
        }
    }

    /// The entity a constraint rejected, if this is a violation carrying
    /// an entity of type `E`.
    #[must_use]
    pub fn offending_entity<E: Send + Sync + 'static>(&self) -> Option<Arc<E>> {
        match self {
            Self::ConstraintViolation {
                offending: Some(entity),
                ..
            } => Arc::clone(entity).downcast::<E>().ok(),
            _ => None,
        }
    }

    /// The entity a rejected replace would have displaced.
    #[must_use]
    pub fn replaced_entity<E: Send + Sync + 'static>(&self) -> Option<Arc<E>> {
        match self {
            Self::ConstraintViolation {
                replaced: Some(entity),
                ..
            } => Arc::clone(entity).downcast::<E>().ok(),
            _ => None,
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a duplicate name error.
    pub fn duplicate_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }

    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates an index not found error.
    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::IndexNotFound { name: name.into() }
    }

    /// Returns true if this error is a constraint violation.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_message_names_constraint_and_id() {
        let err = CoreError::constraint_violation("unique:email", EntityId::new(7), "taken");
        let text = err.to_string();
        assert!(text.contains("unique:email"));
        assert!(text.contains('7'));
        assert!(err.is_constraint_violation());
        assert!(err.offending_entity::<String>().is_none());
    }

    #[test]
    fn violation_carries_typed_entities() {
        let offending: AnyEntity = Arc::new("new".to_string());
        let replaced: AnyEntity = Arc::new("old".to_string());
        let err = CoreError::constraint_violation("unique:name", EntityId::new(3), "taken")
            .with_entities(Some(replaced), offending);

        assert_eq!(err.offending_entity::<String>().as_deref().map(String::as_str), Some("new"));
        assert_eq!(err.replaced_entity::<String>().as_deref().map(String::as_str), Some("old"));
        assert!(err.offending_entity::<u32>().is_none());
    }

    #[test]
    fn only_violations_take_entities() {
        let err = CoreError::unsupported("search").with_entities(None, Arc::new(1u8));
        assert!(matches!(err, CoreError::Unsupported { .. }));
        assert!(err.offending_entity::<u8>().is_none());
    }

    #[test]
    fn storage_error_converts() {
        let handle = gigamap_storage::SegmentHandle::new(3).unwrap();
        let err: CoreError = gigamap_storage::StorageError::SegmentNotFound(handle).into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(!err.is_constraint_violation());
    }
}
