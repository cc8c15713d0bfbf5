//! Bitmap Level3 segments: the sparse table of Level2 blocks for one key.

use super::level2::BitmapLevel2;
use crate::config::WORD_BITS_EXPONENT;
use crate::error::CoreResult;
use crate::lazy::{Lazy, UsageMarker};
use crate::state::{ChangeSet, NodeId};
use crate::types::BitmapOwner;

/// Presence bits of one bitmap, split into lazily loaded blocks.
///
/// A block pointer exists only while its block has at least one bit set,
/// and the table never ends in an empty slot.
#[derive(Debug)]
pub struct BitmapLevel3 {
    blocks: Vec<Option<Lazy<BitmapLevel2>>>,
    exponent: u32,
    segment_count: usize,
}

impl BitmapLevel3 {
    /// Creates an empty bit table whose blocks hold `2^exponent` words.
    #[must_use]
    pub fn new(exponent: u32) -> Self {
        Self {
            blocks: Vec::new(),
            exponent,
            segment_count: 0,
        }
    }

    /// Words per block, as a power of two.
    #[must_use]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// Words per block.
    #[must_use]
    pub fn block_words(&self) -> usize {
        1 << self.exponent
    }

    /// IDs covered by one block.
    #[must_use]
    pub fn block_ids(&self) -> u64 {
        1u64 << (self.exponent + WORD_BITS_EXPONENT)
    }

    /// Length of the block table, including empty slots.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether a segment is allocated for the block.
    #[must_use]
    pub fn has_block(&self, block: usize) -> bool {
        matches!(self.blocks.get(block), Some(Some(_)))
    }

    /// Number of allocated Level2 segments.
    #[must_use]
    pub fn total_segment_count(&self) -> usize {
        self.segment_count
    }

    /// Checks if no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segment_count == 0
    }

    fn locate(&self, id: u64) -> (usize, usize, u32) {
        let block = (id >> (self.exponent + WORD_BITS_EXPONENT)) as usize;
        let word = ((id >> WORD_BITS_EXPONENT) & ((1u64 << self.exponent) - 1)) as usize;
        let bit = (id & 63) as u32;
        (block, word, bit)
    }

    /// Sets the bit for `id`, allocating its block if needed.
    ///
    /// Returns whether the bit changed.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn add(&mut self, id: u64, owner: BitmapOwner, changes: &mut ChangeSet) -> CoreResult<bool> {
        let (block, word, bit) = self.locate(id);
        if self.blocks.len() <= block {
            self.blocks.resize_with(block + 1, || None);
        }

        let exponent = self.exponent;
        let slot = &mut self.blocks[block];
        if slot.is_none() {
            self.segment_count += 1;
            changes.mark_new(NodeId::BitmapSegment { owner, block });
            changes.touch_bitmap_entry(owner);
        }
        let segment = slot.get_or_insert_with(|| Lazy::new(BitmapLevel2::new(exponent)));

        let changed = segment.get_mut()?.set(word, bit);
        if changed {
            segment.mark_used_for(UsageMarker::DIRTY);
            changes.touch_bitmap_block(owner, block);
        }
        Ok(changed)
    }

    /// Clears the bit for `id`. A block that becomes empty is released.
    ///
    /// Returns whether the bit changed.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn remove(
        &mut self,
        id: u64,
        owner: BitmapOwner,
        changes: &mut ChangeSet,
    ) -> CoreResult<bool> {
        let (block, word, bit) = self.locate(id);
        let Some(Some(segment)) = self.blocks.get_mut(block) else {
            return Ok(false);
        };

        let level2 = segment.get_mut()?;
        if !level2.clear(word, bit) {
            return Ok(false);
        }
        if level2.is_empty() {
            self.release_block(block, owner, changes);
        } else {
            segment.mark_used_for(UsageMarker::DIRTY);
            changes.touch_bitmap_block(owner, block);
        }
        Ok(true)
    }

    fn release_block(&mut self, block: usize, owner: BitmapOwner, changes: &mut ChangeSet) {
        if let Some(segment) = self.blocks[block].take() {
            if let Some(handle) = segment.handle() {
                changes.release_handle(handle);
            }
            self.segment_count -= 1;
            changes.forget(&NodeId::BitmapSegment { owner, block });
            changes.touch_bitmap_entry(owner);
        }
        while matches!(self.blocks.last(), Some(None)) {
            self.blocks.pop();
        }
    }

    /// Clears every bit and drops every block.
    pub fn remove_all(&mut self, owner: BitmapOwner, changes: &mut ChangeSet) {
        if self.blocks.is_empty() {
            return;
        }
        for (block, segment) in self.blocks.drain(..).enumerate() {
            if let Some(segment) = segment {
                if let Some(handle) = segment.handle() {
                    changes.release_handle(handle);
                }
                changes.forget(&NodeId::BitmapSegment { owner, block });
            }
        }
        self.segment_count = 0;
        changes.touch_bitmap_entry(owner);
    }

    /// Tests the bit for `id`.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn contains(&self, id: u64) -> CoreResult<bool> {
        let (block, word, bit) = self.locate(id);
        match self.blocks.get(block) {
            Some(Some(segment)) => Ok(segment.get()?.contains(word, bit)),
            _ => Ok(false),
        }
    }

    /// Reads the word at a bitmap-wide word index.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn word(&self, word_index: u64) -> CoreResult<u64> {
        let block = (word_index >> self.exponent) as usize;
        let word = (word_index & ((1u64 << self.exponent) - 1)) as usize;
        match self.blocks.get(block) {
            Some(Some(segment)) => Ok(segment.get()?.word(word)),
            _ => Ok(0),
        }
    }

    /// Copies the words of one block into `out`; zeros if it is absent.
    ///
    /// Returns whether the block is allocated.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn load_block(&self, block: usize, out: &mut [u64]) -> CoreResult<bool> {
        match self.blocks.get(block) {
            Some(Some(segment)) => {
                segment.get()?.copy_words(out);
                Ok(true)
            }
            _ => {
                out.fill(0);
                Ok(false)
            }
        }
    }

    /// Number of set bits.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn bit_count(&self) -> CoreResult<u64> {
        let mut count = 0;
        for segment in self.blocks.iter().flatten() {
            count += segment.get()?.bit_count();
        }
        Ok(count)
    }

    /// Returns the lowest set ID other than `except`.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn first_other_than(&self, except: Option<u64>) -> CoreResult<Option<u64>> {
        for (block, segment) in self.blocks.iter().enumerate() {
            let Some(segment) = segment else { continue };
            let segment = segment.get()?;
            let base = block as u64 * self.block_ids();
            for word_index in 0..segment.word_count() {
                let word_base = base + ((word_index as u64) << WORD_BITS_EXPONENT);
                let mut word = segment.word(word_index);
                if let Some(except) = except {
                    if except >= word_base && except < word_base + 64 {
                        word &= !(1u64 << (except - word_base));
                    }
                }
                if word != 0 {
                    return Ok(Some(word_base + u64::from(word.trailing_zeros())));
                }
            }
        }
        Ok(None)
    }

    /// Compresses every resident block. Evicted blocks are already stored
    /// in encoded form and stay untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if a resident block cannot be borrowed for writing.
    pub fn ensure_compressed(&mut self) -> CoreResult<()> {
        for segment in self.blocks.iter_mut().flatten() {
            if segment.is_resident() {
                segment.get_mut()?.ensure_compressed();
            }
        }
        Ok(())
    }

    /// Loads and decompresses every block.
    ///
    /// # Errors
    ///
    /// Propagates load errors of an evicted block.
    pub fn ensure_decompressed(&mut self) -> CoreResult<()> {
        for segment in self.blocks.iter_mut().flatten() {
            segment.get_mut()?.ensure_decompressed();
        }
        Ok(())
    }

    /// Allocated blocks with their positions.
    pub(crate) fn blocks_mut(&mut self) -> impl Iterator<Item = (usize, &mut Lazy<BitmapLevel2>)> {
        self.blocks
            .iter_mut()
            .enumerate()
            .filter_map(|(block, segment)| segment.as_mut().map(|segment| (block, segment)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexId;
    use gigamap_storage::SegmentHandle;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn owner() -> BitmapOwner {
        BitmapOwner::new(IndexId::new(1), 0, 0)
    }

    #[test]
    fn add_allocates_blocks_lazily() {
        let mut bits = BitmapLevel3::new(2); // 256 IDs per block
        let mut changes = ChangeSet::new();

        assert!(bits.add(3, owner(), &mut changes).unwrap());
        assert!(!bits.add(3, owner(), &mut changes).unwrap());
        assert!(bits.add(1000, owner(), &mut changes).unwrap());

        assert_eq!(bits.block_count(), 4);
        assert_eq!(bits.total_segment_count(), 2);
        assert!(bits.has_block(0));
        assert!(!bits.has_block(1));
        assert!(bits.contains(1000).unwrap());
        assert!(!bits.contains(999).unwrap());
        assert!(!bits.contains(1_000_000).unwrap());
        assert_eq!(bits.bit_count().unwrap(), 2);
    }

    #[test]
    fn emptied_blocks_are_released_and_trimmed() {
        let mut bits = BitmapLevel3::new(2);
        let mut changes = ChangeSet::new();
        bits.add(3, owner(), &mut changes).unwrap();
        bits.add(1000, owner(), &mut changes).unwrap();

        assert!(bits.remove(1000, owner(), &mut changes).unwrap());
        assert_eq!(bits.block_count(), 1);
        assert_eq!(bits.total_segment_count(), 1);
        assert!(!changes.is_dirty(&NodeId::BitmapSegment {
            owner: owner(),
            block: 3
        }));

        assert!(!bits.remove(1000, owner(), &mut changes).unwrap());
        assert!(bits.remove(3, owner(), &mut changes).unwrap());
        assert!(bits.is_empty());
        assert_eq!(bits.block_count(), 0);
    }

    #[test]
    fn releasing_a_stored_block_reports_its_handle() {
        let mut bits = BitmapLevel3::new(2);
        let mut changes = ChangeSet::new();
        bits.add(5, owner(), &mut changes).unwrap();
        let handle = SegmentHandle::new(11).unwrap();
        for (_, segment) in bits.blocks_mut() {
            segment.set_handle(handle);
        }

        bits.remove(5, owner(), &mut changes).unwrap();
        assert_eq!(changes.released_handles(), &[handle]);
    }

    #[test]
    fn remove_all_clears_everything() {
        let mut bits = BitmapLevel3::new(2);
        let mut changes = ChangeSet::new();
        for id in [1, 300, 700] {
            bits.add(id, owner(), &mut changes).unwrap();
        }
        bits.remove_all(owner(), &mut changes);
        assert!(bits.is_empty());
        assert_eq!(bits.block_count(), 0);
        assert!(changes.is_instance_new_or_changed(&NodeId::BitmapEntry(owner())));
    }

    #[test]
    fn mutation_pins_and_marks_blocks() {
        let mut bits = BitmapLevel3::new(2);
        let mut changes = ChangeSet::new();
        bits.add(70, owner(), &mut changes).unwrap();

        let node = NodeId::BitmapSegment {
            owner: owner(),
            block: 0,
        };
        assert!(changes.is_instance_new_or_changed(&node));
        assert!(changes.is_children_changed(&NodeId::Index(IndexId::new(1))));
        assert!(bits.blocks_mut().all(|(_, s)| s.is_used_by(UsageMarker::DIRTY)));
    }

    #[test]
    fn first_other_than_skips_the_excluded_id() {
        let mut bits = BitmapLevel3::new(2);
        let mut changes = ChangeSet::new();
        bits.add(10, owner(), &mut changes).unwrap();
        assert_eq!(bits.first_other_than(Some(10)).unwrap(), None);
        assert_eq!(bits.first_other_than(None).unwrap(), Some(10));

        bits.add(600, owner(), &mut changes).unwrap();
        assert_eq!(bits.first_other_than(Some(10)).unwrap(), Some(600));
    }

    #[test]
    fn word_reads_across_blocks() {
        let mut bits = BitmapLevel3::new(1); // 2 words per block
        let mut changes = ChangeSet::new();
        bits.add(64 * 3 + 5, owner(), &mut changes).unwrap();
        assert_eq!(bits.word(3).unwrap(), 1 << 5);
        assert_eq!(bits.word(2).unwrap(), 0);
        assert_eq!(bits.word(99).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn matches_a_set_model(ops in prop::collection::vec((any::<bool>(), 0u64..5000), 1..300)) {
            let mut bits = BitmapLevel3::new(2);
            let mut changes = ChangeSet::new();
            let mut model = BTreeSet::new();

            for (insert, id) in ops {
                if insert {
                    prop_assert_eq!(bits.add(id, owner(), &mut changes).unwrap(), model.insert(id));
                } else {
                    prop_assert_eq!(bits.remove(id, owner(), &mut changes).unwrap(), model.remove(&id));
                }
            }

            prop_assert_eq!(bits.bit_count().unwrap(), model.len() as u64);
            let expected_blocks: BTreeSet<u64> = model.iter().map(|id| id / 256).collect();
            prop_assert_eq!(bits.total_segment_count(), expected_blocks.len());
            prop_assert_eq!(bits.block_count() as u64, expected_blocks.iter().next_back().map_or(0, |b| b + 1));

            bits.ensure_compressed().unwrap();
            for id in 0..5000 {
                prop_assert_eq!(bits.contains(id).unwrap(), model.contains(&id));
            }
            bits.ensure_decompressed().unwrap();
            for id in &model {
                prop_assert!(bits.contains(*id).unwrap());
            }
        }
    }
}
