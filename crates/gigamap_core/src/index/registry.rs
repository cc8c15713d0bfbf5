//! Index registry: the type-erased set of indices of one map.
//!
//! Every mutation drives all registered indices through the same two
//! phases. `prepare_all` plans the move in every index without touching a
//! bitmap; the caller then validates constraints and either calls
//! `commit_all` or `abort_all`.

use super::traits::IndexKind;
use crate::bitmap::BitmapEntry;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::state::{ChangeSet, NodeId};
use crate::types::IndexId;
use std::any::Any;

/// Object-safe maintenance interface shared by all index variants.
pub trait IndexMaintainer<E>: Send + Sync {
    /// ID of the index.
    fn id(&self) -> IndexId;

    /// Name of the index, unique within a map.
    fn name(&self) -> &str;

    /// Kind of the index.
    fn kind(&self) -> IndexKind;

    /// Plans moving `id` from the keys of `old` to the keys of `new`.
    ///
    /// `None` on the old side is a fresh add, on the new side a removal.
    /// Nothing is applied until [`Self::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for keys the index cannot
    /// store. No plan is kept in that case.
    fn prepare(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()>;

    /// Another entity already holding a key of the pending plan, with the
    /// key rendered for error messages.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    fn conflicting_holder(&self) -> CoreResult<Option<(EntityId, String)>>;

    /// Applies the pending plan: removals first, then insertions.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    fn commit(&mut self, changes: &mut ChangeSet) -> CoreResult<()>;

    /// Drops the pending plan.
    fn abort(&mut self);

    /// Removes every entity from every entry.
    fn remove_all(&mut self, changes: &mut ChangeSet);

    /// Number of materialized entries.
    fn entry_count(&self) -> usize;

    /// Every bitmap entry of the index.
    fn bitmaps_mut(&mut self) -> Vec<&mut BitmapEntry>;

    /// The concrete index, for typed queries.
    fn as_any(&self) -> &dyn Any;
}

/// Registered indices in registration order.
pub struct IndexRegistry<E> {
    indices: Vec<Box<dyn IndexMaintainer<E>>>,
    next_id: u32,
}

impl<E> Default for IndexRegistry<E> {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            next_id: 0,
        }
    }
}

impl<E> IndexRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The ID the next registered index receives.
    #[must_use]
    pub fn next_id(&self) -> IndexId {
        IndexId::new(self.next_id)
    }

    /// Fails if `name` is taken.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`].
    pub fn ensure_unused(&self, name: &str) -> CoreResult<()> {
        if self.get_by_name(name).is_some() {
            return Err(CoreError::duplicate_name("index", name));
        }
        Ok(())
    }

    /// Registers an index built with [`Self::next_id`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken, or
    /// [`CoreError::InvalidConfiguration`] if the index was not built with
    /// the reserved ID.
    pub fn register(&mut self, index: Box<dyn IndexMaintainer<E>>, changes: &mut ChangeSet) -> CoreResult<()> {
        self.ensure_unused(index.name())?;
        if index.id() != self.next_id() {
            return Err(CoreError::invalid_configuration(format!(
                "index '{}' was built for {} but the next ID is {}",
                index.name(),
                index.id(),
                self.next_id()
            )));
        }
        self.next_id += 1;
        changes.mark_new(NodeId::Index(index.id()));
        changes.mark_children_changed(NodeId::Map);
        tracing::debug!(index = %index.id(), name = index.name(), kind = ?index.kind(), "registered index");
        self.indices.push(index);
        Ok(())
    }

    /// Unregisters an index by name.
    pub fn remove(&mut self, name: &str, changes: &mut ChangeSet) -> Option<Box<dyn IndexMaintainer<E>>> {
        let position = self.indices.iter().position(|index| index.name() == name)?;
        let mut index = self.indices.remove(position);
        let id = index.id();
        index.remove_all(changes);
        changes.forget_where(|node| match node {
            NodeId::Index(index) => *index == id,
            NodeId::BitmapEntry(owner) | NodeId::BitmapSegment { owner, .. } => owner.index == id,
            _ => false,
        });
        changes.mark_changed(NodeId::Map);
        tracing::debug!(index = %id, name, "removed index");
        Some(index)
    }

    /// Looks up an index by ID.
    #[must_use]
    pub fn get(&self, id: IndexId) -> Option<&dyn IndexMaintainer<E>> {
        self.indices
            .iter()
            .find(|index| index.id() == id)
            .map(|index| index.as_ref())
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&dyn IndexMaintainer<E>> {
        self.indices
            .iter()
            .find(|index| index.name() == name)
            .map(|index| index.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: IndexId) -> Option<&mut (dyn IndexMaintainer<E> + 'static)> {
        self.indices
            .iter_mut()
            .find(|index| index.id() == id)
            .map(|index| index.as_mut())
    }

    /// Indices in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn IndexMaintainer<E>> {
        self.indices.iter().map(|index| index.as_ref())
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.indices.iter().map(|index| index.name().to_string()).collect()
    }

    /// Number of registered indices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Checks if no index is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Plans the move in every index. On failure nothing stays pending.
    ///
    /// # Errors
    ///
    /// Returns the first index error.
    pub fn prepare_all(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()> {
        for position in 0..self.indices.len() {
            if let Err(err) = self.indices[position].prepare(id, old, new) {
                self.abort_all();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Commits every pending plan.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors. Remaining plans are dropped.
    pub fn commit_all(&mut self, changes: &mut ChangeSet) -> CoreResult<()> {
        let mut result = Ok(());
        for index in &mut self.indices {
            if result.is_ok() {
                result = index.commit(changes);
            } else {
                index.abort();
            }
        }
        result
    }

    /// Drops every pending plan.
    pub fn abort_all(&mut self) {
        for index in &mut self.indices {
            index.abort();
        }
    }

    /// Empties every index.
    pub fn remove_all(&mut self, changes: &mut ChangeSet) {
        for index in &mut self.indices {
            index.remove_all(changes);
        }
    }

    /// Every bitmap entry of every index.
    pub(crate) fn bitmaps_mut(&mut self) -> Vec<&mut BitmapEntry> {
        self.indices
            .iter_mut()
            .flat_map(|index| index.bitmaps_mut())
            .collect()
    }
}

impl<E> std::fmt::Debug for IndexRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexRegistry")
            .field("indices", &self.names())
            .field("next_id", &self.next_id)
            .finish()
    }
}
