//! Resolving bitmap results to entities.

use crate::bitmap::BitmapResult;
use crate::entity::{EntityId, EntityStore};
use crate::error::CoreResult;
use std::ops::{ControlFlow, Range};
use std::sync::Arc;

/// Visits the entities of `result` within `blocks`, in ID order.
///
/// IDs without a stored entity are skipped, so negated results over
/// ranges with removed IDs stay correct. The visitor stops the scan early
/// by returning [`ControlFlow::Break`].
///
/// # Errors
///
/// Propagates segment load errors.
pub fn scan<E>(
    result: &BitmapResult<'_>,
    store: &EntityStore<E>,
    blocks: Range<usize>,
    mut visit: impl FnMut(EntityId, &Arc<E>) -> ControlFlow<()>,
) -> CoreResult<ControlFlow<()>> {
    for id in result.cursor_range(blocks.start, blocks.end) {
        let id = id?;
        let Some(entity) = store.get(id)? else {
            continue;
        };
        if visit(id, &entity).is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Splits `0..blocks` into at most `parts` contiguous, non-empty ranges.
#[must_use]
pub fn partition(blocks: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, blocks.max(1));
    let base = blocks / parts;
    let extra = blocks % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = base + usize::from(part < extra);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapLevel3;
    use crate::config::GigaMapConfig;
    use crate::state::ChangeSet;
    use crate::types::BitmapOwner;

    #[test]
    fn partition_covers_every_block_once() {
        assert_eq!(partition(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition(2, 8), vec![0..1, 1..2]);
        assert!(partition(0, 4).is_empty());
        assert_eq!(partition(5, 0), vec![0..5]);
    }

    #[test]
    fn removed_ids_are_skipped_and_break_stops() {
        let mut changes = ChangeSet::new();
        let mut store = EntityStore::new(GigaMapConfig::compact());
        let mut bits = BitmapLevel3::new(2);
        for value in 0..6u32 {
            let id = store.add(Arc::new(value), &mut changes).unwrap();
            bits.add(id.as_u64(), BitmapOwner::live(), &mut changes).unwrap();
        }
        store.remove(EntityId::new(2), &mut changes).unwrap();
        let result = BitmapResult::Bitmap(&bits);

        let mut seen = Vec::new();
        let flow = scan(&result, &store, 0..result.block_count(), |id, value| {
            seen.push((id.as_u64(), **value));
            ControlFlow::Continue(())
        })
        .unwrap();
        assert!(flow.is_continue());
        assert_eq!(seen, vec![(0, 0), (1, 1), (3, 3), (4, 4), (5, 5)]);

        let mut first = None;
        let flow = scan(&result, &store, 0..result.block_count(), |id, _| {
            first = Some(id);
            ControlFlow::Break(())
        })
        .unwrap();
        assert!(flow.is_break());
        assert_eq!(first, Some(EntityId::new(0)));
    }
}
