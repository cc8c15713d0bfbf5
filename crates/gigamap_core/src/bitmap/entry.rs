//! Bitmap entries: one key's bitmap.

use super::level3::BitmapLevel3;
use super::result::BitmapResult;
use crate::entity::EntityId;
use crate::error::CoreResult;
use crate::state::{ChangeSet, NodeId};
use crate::types::BitmapOwner;

/// The bitmap of one index key.
///
/// The key itself lives in the owning index's entry table; the entry only
/// knows its owner, whose `entry` field is the stable position used for
/// addressing and persistence.
#[derive(Debug)]
pub struct BitmapEntry {
    owner: BitmapOwner,
    bits: BitmapLevel3,
}

impl BitmapEntry {
    /// Creates an empty entry and records it as new.
    pub fn new(owner: BitmapOwner, block_exponent: u32, changes: &mut ChangeSet) -> Self {
        changes.mark_new(NodeId::BitmapEntry(owner));
        Self {
            owner,
            bits: BitmapLevel3::new(block_exponent),
        }
    }

    /// Owner of this entry.
    #[must_use]
    pub fn owner(&self) -> BitmapOwner {
        self.owner
    }

    /// Stable position within the owning (sub-)index.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.owner.entry
    }

    /// The underlying bit table.
    #[must_use]
    pub fn bits(&self) -> &BitmapLevel3 {
        &self.bits
    }

    pub(crate) fn bits_mut(&mut self) -> &mut BitmapLevel3 {
        &mut self.bits
    }

    /// Adds an entity ID. Returns whether it was absent.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn add(&mut self, id: EntityId, changes: &mut ChangeSet) -> CoreResult<bool> {
        self.bits.add(id.as_u64(), self.owner, changes)
    }

    /// Removes an entity ID. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn remove(&mut self, id: EntityId, changes: &mut ChangeSet) -> CoreResult<bool> {
        self.bits.remove(id.as_u64(), self.owner, changes)
    }

    /// Removes every entity ID.
    pub fn remove_all(&mut self, changes: &mut ChangeSet) {
        self.bits.remove_all(self.owner, changes);
    }

    /// Checks if the entity ID is set.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn contains(&self, id: EntityId) -> CoreResult<bool> {
        self.bits.contains(id.as_u64())
    }

    /// Number of entity IDs set.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn count(&self) -> CoreResult<u64> {
        self.bits.bit_count()
    }

    /// Checks if no entity ID is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The entry as a query result leaf.
    #[must_use]
    pub fn result(&self) -> BitmapResult<'_> {
        BitmapResult::Bitmap(&self.bits)
    }

    /// Forgets all pending changes of this entry and its blocks.
    pub(crate) fn forget_changes(&self, changes: &mut ChangeSet) {
        let owner = self.owner;
        changes.forget_where(|node| match node {
            NodeId::BitmapEntry(o) | NodeId::BitmapSegment { owner: o, .. } => *o == owner,
            _ => false,
        });
    }
}
