//! Bitmap indices.
//!
//! An index maps each entity to zero or more keys through an indexer and
//! keeps one bitmap of entity IDs per key. Four variants exist:
//!
//! - [`HashingIndex`]: one entry per distinct key, found through a hash table
//! - [`BinaryIndex`]: one entry per key bit, for high-cardinality integers
//! - [`CompositeIndex`]: one sub-index per key component
//! - [`BooleanIndex`]: one entry for `true`; `false` is its negation
//!
//! Registering an index returns a typed [`IndexHandle`] from which query
//! conditions are built.

mod binary;
mod boolean;
mod composite;
mod hash;
mod registry;
mod traits;
mod transition;

pub use binary::BinaryIndex;
pub use boolean::BooleanIndex;
pub use composite::CompositeIndex;
pub use hash::HashingIndex;
pub use registry::{IndexMaintainer, IndexRegistry};
pub use traits::{
    BinaryFn, BinaryIndexer, BinaryValue, BooleanFn, BooleanIndexer, CompositeIndexer, HashingFn,
    HashingIndexer, IndexKind, SubKind,
};
pub use transition::{EntryHandle, Transition};

pub(crate) use traits::default_name;

use crate::types::IndexId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed reference to a registered index.
///
/// Handles are cheap to clone and outlive the index: conditions built from
/// a removed index fail with [`crate::CoreError::IndexNotFound`] when
/// evaluated.
pub struct IndexHandle<X> {
    id: IndexId,
    name: Arc<str>,
    _marker: PhantomData<fn() -> X>,
}

impl<X> IndexHandle<X> {
    pub(crate) fn new(id: IndexId, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
            _marker: PhantomData,
        }
    }

    /// ID of the index.
    #[must_use]
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Name of the index.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }
}

impl<X> Clone for IndexHandle<X> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<X> fmt::Debug for IndexHandle<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
