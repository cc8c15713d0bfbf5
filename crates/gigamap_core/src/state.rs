//! State-change tracking.
//!
//! Mutations record which storage nodes they touched in a [`ChangeSet`]
//! instead of flipping flags on the nodes themselves. The persistence
//! collaborator consults the change-set once per store cycle and clears it
//! after a successful store.

use crate::types::{BitmapOwner, IndexId};
use gigamap_storage::SegmentHandle;
use std::collections::HashMap;

/// A persistent node of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    /// The map root.
    Map,
    /// The entity store's Level3 table.
    EntityLevel3,
    /// One entity Level2 segment.
    EntityLevel2 {
        /// Position within Level3.
        level3: usize,
    },
    /// One entity Level1 segment.
    EntityLevel1 {
        /// Position of the parent within Level3.
        level3: usize,
        /// Position within the parent Level2 segment.
        level2: usize,
    },
    /// An index (its entry table).
    Index(IndexId),
    /// One bitmap entry (its Level3 bit segment table).
    BitmapEntry(BitmapOwner),
    /// One bitmap Level2 segment.
    BitmapSegment {
        /// Owning bitmap.
        owner: BitmapOwner,
        /// Block position within the owning Level3 bit segment.
        block: usize,
    },
}

/// Per-node state-change flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags(u8);

impl StateFlags {
    /// No change recorded.
    pub const NONE: Self = Self(0);
    /// The node was created since the last store cycle.
    pub const NEW: Self = Self(0x01);
    /// The node's own fields changed.
    pub const CHANGED: Self = Self(0x02);
    /// One of the node's children changed.
    pub const CHILDREN_CHANGED: Self = Self(0x04);

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks if all flags of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Checks if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// The set of nodes touched since the last store cycle.
#[derive(Debug, Default)]
pub struct ChangeSet {
    nodes: HashMap<NodeId, StateFlags>,
    released: Vec<SegmentHandle>,
}

impl ChangeSet {
    /// Creates an empty change-set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, node: NodeId, flags: StateFlags) {
        let entry = self.nodes.entry(node).or_default();
        *entry = entry.with(flags);
    }

    /// Records a freshly created node.
    pub fn mark_new(&mut self, node: NodeId) {
        self.set(node, StateFlags::NEW);
    }

    /// Records a change of the node's own fields.
    pub fn mark_changed(&mut self, node: NodeId) {
        self.set(node, StateFlags::CHANGED);
    }

    /// Records a change below the node.
    pub fn mark_children_changed(&mut self, node: NodeId) {
        self.set(node, StateFlags::CHILDREN_CHANGED);
    }

    /// Returns the flags recorded for the node.
    #[must_use]
    pub fn flags(&self, node: &NodeId) -> StateFlags {
        self.nodes.get(node).copied().unwrap_or(StateFlags::NONE)
    }

    /// Whether the node is new or its own fields changed.
    #[must_use]
    pub fn is_instance_new_or_changed(&self, node: &NodeId) -> bool {
        let flags = self.flags(node);
        flags.contains(StateFlags::NEW) || flags.contains(StateFlags::CHANGED)
    }

    /// Whether the node changed but existed before the last store cycle.
    ///
    /// Such nodes are stored incrementally; new nodes are stored in full once.
    #[must_use]
    pub fn is_changed_and_not_new(&self, node: &NodeId) -> bool {
        let flags = self.flags(node);
        flags.contains(StateFlags::CHANGED) && !flags.contains(StateFlags::NEW)
    }

    /// Whether a child of the node changed.
    #[must_use]
    pub fn is_children_changed(&self, node: &NodeId) -> bool {
        self.flags(node).contains(StateFlags::CHILDREN_CHANGED)
    }

    /// Whether anything about the node is pending.
    #[must_use]
    pub fn is_dirty(&self, node: &NodeId) -> bool {
        !self.flags(node).is_empty()
    }

    /// Number of nodes with pending changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the dirty nodes in a deterministic order.
    #[must_use]
    pub fn dirty_nodes(&self) -> Vec<(NodeId, StateFlags)> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|(n, f)| (*n, *f)).collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }

    /// Drops the pending changes of one node that no longer exists.
    pub fn forget(&mut self, node: &NodeId) {
        self.nodes.remove(node);
    }

    /// Drops pending changes of nodes that no longer exist.
    pub fn forget_where(&mut self, mut predicate: impl FnMut(&NodeId) -> bool) {
        self.nodes.retain(|node, _| !predicate(node));
    }

    /// Resets all flags of all nodes and returns the nodes that were dirty.
    pub fn clear_state_change_markers(&mut self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.nodes.drain().map(|(n, _)| n).collect();
        nodes.sort();
        nodes
    }

    /// Records a stored segment whose node no longer exists.
    ///
    /// The next store cycle removes it from the segment store.
    pub fn release_handle(&mut self, handle: SegmentHandle) {
        self.released.push(handle);
    }

    /// Stored segments released since the last store cycle.
    #[must_use]
    pub fn released_handles(&self) -> &[SegmentHandle] {
        &self.released
    }

    pub(crate) fn take_released_handles(&mut self) -> Vec<SegmentHandle> {
        std::mem::take(&mut self.released)
    }

    /// Marks an entity Level1 segment changed and its ancestors children-changed.
    pub(crate) fn touch_entity_slot(&mut self, level3: usize, level2: usize) {
        self.mark_changed(NodeId::EntityLevel1 { level3, level2 });
        self.mark_children_changed(NodeId::EntityLevel2 { level3 });
        self.mark_children_changed(NodeId::EntityLevel3);
        self.mark_children_changed(NodeId::Map);
    }

    /// Marks a bitmap segment changed and its ancestors children-changed.
    pub(crate) fn touch_bitmap_block(&mut self, owner: BitmapOwner, block: usize) {
        self.mark_changed(NodeId::BitmapSegment { owner, block });
        self.mark_children_changed(NodeId::BitmapEntry(owner));
        if owner.index != IndexId::LIVE {
            self.mark_children_changed(NodeId::Index(owner.index));
        }
        self.mark_children_changed(NodeId::Map);
    }

    /// Marks a bitmap entry's segment table changed.
    pub(crate) fn touch_bitmap_entry(&mut self, owner: BitmapOwner) {
        self.mark_changed(NodeId::BitmapEntry(owner));
        if owner.index != IndexId::LIVE {
            self.mark_children_changed(NodeId::Index(owner.index));
        }
        self.mark_children_changed(NodeId::Map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_not_changed_and_not_new() {
        let mut changes = ChangeSet::new();
        let node = NodeId::EntityLevel3;
        changes.mark_new(node);
        changes.mark_changed(node);

        assert!(changes.is_instance_new_or_changed(&node));
        assert!(!changes.is_changed_and_not_new(&node));
    }

    #[test]
    fn changed_existing_node_is_incremental() {
        let mut changes = ChangeSet::new();
        let node = NodeId::EntityLevel2 { level3: 1 };
        changes.mark_changed(node);

        assert!(changes.is_instance_new_or_changed(&node));
        assert!(changes.is_changed_and_not_new(&node));
        assert!(!changes.is_children_changed(&node));
    }

    #[test]
    fn touching_a_slot_propagates_upward() {
        let mut changes = ChangeSet::new();
        changes.touch_entity_slot(2, 3);

        assert!(changes.is_changed_and_not_new(&NodeId::EntityLevel1 {
            level3: 2,
            level2: 3
        }));
        assert!(changes.is_children_changed(&NodeId::EntityLevel2 { level3: 2 }));
        assert!(!changes.is_instance_new_or_changed(&NodeId::EntityLevel2 { level3: 2 }));
        assert!(changes.is_children_changed(&NodeId::EntityLevel3));
        assert!(changes.is_children_changed(&NodeId::Map));
    }

    #[test]
    fn live_bitmap_has_no_index_node() {
        let mut changes = ChangeSet::new();
        changes.touch_bitmap_block(BitmapOwner::live(), 0);
        assert!(!changes.is_dirty(&NodeId::Index(IndexId::LIVE)));
        assert!(changes.is_children_changed(&NodeId::BitmapEntry(BitmapOwner::live())));
    }

    #[test]
    fn clear_resets_everything() {
        let mut changes = ChangeSet::new();
        changes.touch_entity_slot(0, 0);
        let cleared = changes.clear_state_change_markers();

        assert_eq!(cleared.len(), 4);
        assert!(changes.is_empty());
        assert!(!changes.is_dirty(&NodeId::Map));
    }

    #[test]
    fn released_handles_are_taken_once() {
        let mut changes = ChangeSet::new();
        let handle = SegmentHandle::new(5).unwrap();
        changes.release_handle(handle);
        assert_eq!(changes.released_handles(), &[handle]);
        assert_eq!(changes.take_released_handles(), vec![handle]);
        assert!(changes.released_handles().is_empty());
    }

    #[test]
    fn forget_drops_matching_nodes() {
        let mut changes = ChangeSet::new();
        changes.touch_entity_slot(0, 0);
        changes.forget_where(|node| matches!(node, NodeId::EntityLevel1 { .. }));
        assert_eq!(changes.len(), 3);
    }
}
