//! Store and eviction cycles against a segment store.
//!
//! A store cycle writes every segment the [`ChangeSet`] reports as new or
//! changed, plus every segment that was never stored, then clears the
//! change-set and releases the dirty pins. Eviction afterwards drops clean
//! segments from memory; reads reload them through the loaders below.
//!
//! Entity segment layouts (little-endian, CRC-32 over everything before the
//! trailer):
//!
//! ```text
//! Level1: magic "GML1" | slots u32 | per slot: len u32 (u32::MAX = empty), payload | crc u32
//! Level2: magic "GML2" | slots u32 | per slot: handle u64 (0 = none)               | crc u32
//! ```
//!
//! Bitmap segments use the block layout of [`crate::bitmap::layout`].

use crate::bitmap::layout::compute_crc32;
use crate::bitmap::{BitmapEntry, BitmapLevel2};
use crate::config::GigaMapConfig;
use crate::entity::store::{Level1, Level2};
use crate::entity::{EntityCodec, EntityStore};
use crate::error::{CoreError, CoreResult};
use crate::lazy::{Lazy, SegmentLoader, UsageMarker};
use crate::state::{ChangeSet, NodeId};
use crate::stats::GigaMapStats;
use gigamap_storage::{SegmentHandle, SegmentStore};
use std::marker::PhantomData;
use std::sync::Arc;

const LEVEL1_MAGIC: [u8; 4] = *b"GML1";
const LEVEL2_MAGIC: [u8; 4] = *b"GML2";
const EMPTY_SLOT: u32 = u32::MAX;
const CRC_SIZE: usize = 4;
/// Magic plus slot count.
const PREFIX_SIZE: usize = 8;

/// Outcome of one store cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Entity Level1 and Level2 segments written.
    pub entity_segments: u64,
    /// Bitmap Level2 segments written.
    pub bitmap_segments: u64,
    /// Stored segments removed because their node no longer exists.
    pub released: usize,
    /// Dirty nodes cleared from the change-set.
    pub cleared_nodes: usize,
}

impl StoreReport {
    /// All segments written.
    #[must_use]
    pub fn segments_written(&self) -> u64 {
        self.entity_segments + self.bitmap_segments
    }
}

/// Encodes an entity Level1 segment.
pub(crate) fn encode_level1<E: EntityCodec>(level1: &Level1<E>) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(PREFIX_SIZE + level1.slots.len() * 4 + CRC_SIZE);
    buf.extend_from_slice(&LEVEL1_MAGIC);
    buf.extend_from_slice(&(level1.slots.len() as u32).to_le_bytes());
    for slot in &level1.slots {
        match slot {
            Some(entity) => {
                let payload = entity.encode_entity()?;
                let len = u32::try_from(payload.len())
                    .ok()
                    .filter(|len| *len != EMPTY_SLOT)
                    .ok_or_else(|| {
                        CoreError::codec(format!("entity payload of {} bytes is too large", payload.len()))
                    })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(&payload);
            }
            None => buf.extend_from_slice(&EMPTY_SLOT.to_le_bytes()),
        }
    }
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes an entity Level1 segment of `slots` slots.
pub(crate) fn decode_level1<E: EntityCodec>(data: &[u8], slots: usize) -> CoreResult<Level1<E>> {
    let mut reader = SegmentReader::open(data, LEVEL1_MAGIC, slots, "entity level1")?;
    let mut level1 = Level1::new(slots);
    for slot in &mut level1.slots {
        let len = reader.u32()?;
        if len == EMPTY_SLOT {
            continue;
        }
        let payload = reader.take(len as usize)?;
        *slot = Some(Arc::new(E::decode_entity(payload)?));
    }
    reader.finish()?;
    Ok(level1)
}

/// Encodes an entity Level2 segment. Every child must have been stored.
pub(crate) fn encode_level2<E>(level2: &Level2<E>) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(PREFIX_SIZE + level2.segments.len() * 8 + CRC_SIZE);
    buf.extend_from_slice(&LEVEL2_MAGIC);
    buf.extend_from_slice(&(level2.segments.len() as u32).to_le_bytes());
    for (position, segment) in level2.segments.iter().enumerate() {
        let raw = match segment {
            Some(level1_ref) => level1_ref.handle().map(SegmentHandle::as_u64).ok_or_else(|| {
                CoreError::segment_corruption(format!(
                    "entity level1 segment {} was not stored before its parent",
                    position
                ))
            })?,
            None => 0,
        };
        buf.extend_from_slice(&raw.to_le_bytes());
    }
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes an entity Level2 segment; its children start out evicted.
pub(crate) fn decode_level2<E>(
    data: &[u8],
    slots: usize,
    level1: &Arc<dyn SegmentLoader<Level1<E>>>,
) -> CoreResult<Level2<E>> {
    let mut reader = SegmentReader::open(data, LEVEL2_MAGIC, slots, "entity level2")?;
    let mut level2 = Level2::new(slots);
    for segment in &mut level2.segments {
        if let Some(handle) = SegmentHandle::new(reader.u64()?) {
            *segment = Some(Lazy::evicted(handle, Arc::clone(level1)));
        }
    }
    reader.finish()?;
    Ok(level2)
}

struct SegmentReader<'a> {
    body: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> SegmentReader<'a> {
    fn open(data: &'a [u8], magic: [u8; 4], slots: usize, what: &'static str) -> CoreResult<Self> {
        if data.len() < PREFIX_SIZE + CRC_SIZE {
            return Err(CoreError::segment_corruption(format!("{} segment too short", what)));
        }
        let (body, trailer) = data.split_at(data.len() - CRC_SIZE);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = compute_crc32(body);
        if stored != computed {
            return Err(CoreError::segment_corruption(format!(
                "{} checksum mismatch: stored {:#010x}, computed {:#010x}",
                what, stored, computed
            )));
        }

        let mut reader = Self { body, pos: 0, what };
        if reader.take(4)? != magic {
            return Err(CoreError::segment_corruption(format!("{} bad magic", what)));
        }
        let count = reader.u32()? as usize;
        if count != slots {
            return Err(CoreError::segment_corruption(format!(
                "{} has {} slots, expected {}",
                what, count, slots
            )));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| CoreError::segment_corruption(format!("{} truncated", self.what)))?;
        let bytes = &self.body[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn finish(self) -> CoreResult<()> {
        if self.pos != self.body.len() {
            return Err(CoreError::segment_corruption(format!(
                "{} has {} trailing bytes",
                self.what,
                self.body.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Reloads entity Level1 segments.
pub(crate) struct Level1Loader<E> {
    source: Arc<dyn SegmentStore>,
    stats: Arc<GigaMapStats>,
    slots: usize,
    _marker: PhantomData<fn() -> E>,
}

impl<E: EntityCodec + Send + Sync + 'static> SegmentLoader<Level1<E>> for Level1Loader<E> {
    fn load(&self, handle: SegmentHandle) -> CoreResult<Level1<E>> {
        let bytes = self.source.read(handle)?;
        let level1 = decode_level1(&bytes, self.slots)?;
        self.stats.record_segment_loaded();
        Ok(level1)
    }
}

/// Reloads entity Level2 segments with evicted children.
pub(crate) struct Level2Loader<E> {
    source: Arc<dyn SegmentStore>,
    stats: Arc<GigaMapStats>,
    slots: usize,
    level1: Arc<dyn SegmentLoader<Level1<E>>>,
}

impl<E: EntityCodec + Send + Sync + 'static> SegmentLoader<Level2<E>> for Level2Loader<E> {
    fn load(&self, handle: SegmentHandle) -> CoreResult<Level2<E>> {
        let bytes = self.source.read(handle)?;
        let level2 = decode_level2(&bytes, self.slots, &self.level1)?;
        self.stats.record_segment_loaded();
        Ok(level2)
    }
}

/// Reloads bitmap Level2 segments, validating the block layout.
pub(crate) struct BitmapLoader {
    source: Arc<dyn SegmentStore>,
    stats: Arc<GigaMapStats>,
    exponent: u32,
}

impl SegmentLoader<BitmapLevel2> for BitmapLoader {
    fn load(&self, handle: SegmentHandle) -> CoreResult<BitmapLevel2> {
        let bytes = self.source.read(handle)?;
        let block = BitmapLevel2::from_bytes(bytes, self.exponent)?;
        self.stats.record_segment_loaded();
        Ok(block)
    }
}

/// The loaders evicted segments of one map hand back to.
pub(crate) struct Loaders<E> {
    level1: Arc<dyn SegmentLoader<Level1<E>>>,
    level2: Arc<dyn SegmentLoader<Level2<E>>>,
    bitmap: Arc<dyn SegmentLoader<BitmapLevel2>>,
}

impl<E: EntityCodec + Send + Sync + 'static> Loaders<E> {
    pub(crate) fn new(
        source: Arc<dyn SegmentStore>,
        stats: Arc<GigaMapStats>,
        config: &GigaMapConfig,
    ) -> Self {
        let level1: Arc<dyn SegmentLoader<Level1<E>>> = Arc::new(Level1Loader {
            source: Arc::clone(&source),
            stats: Arc::clone(&stats),
            slots: config.level1_len(),
            _marker: PhantomData,
        });
        let level2: Arc<dyn SegmentLoader<Level2<E>>> = Arc::new(Level2Loader {
            source: Arc::clone(&source),
            stats: Arc::clone(&stats),
            slots: config.level2_len(),
            level1: Arc::clone(&level1),
        });
        let bitmap: Arc<dyn SegmentLoader<BitmapLevel2>> = Arc::new(BitmapLoader {
            source,
            stats,
            exponent: config.bitmap_block_exponent,
        });
        Self {
            level1,
            level2,
            bitmap,
        }
    }
}

fn write_segment(
    target: &dyn SegmentStore,
    handle: Option<SegmentHandle>,
    bytes: &[u8],
) -> CoreResult<(SegmentHandle, bool)> {
    let (handle, fresh) = match handle {
        Some(handle) => (handle, false),
        None => (target.allocate(), true),
    };
    target.write(handle, bytes)?;
    Ok((handle, fresh))
}

/// Runs one store cycle.
///
/// On error the change-set is left as it was (minus released handles that
/// were already removed), so the next cycle writes the same nodes again.
pub(crate) fn store<E: EntityCodec>(
    entities: &mut EntityStore<E>,
    mut bitmaps: Vec<&mut BitmapEntry>,
    changes: &mut ChangeSet,
    target: &dyn SegmentStore,
    compress: bool,
) -> CoreResult<StoreReport> {
    let mut report = StoreReport {
        entity_segments: store_entities(entities, changes, target)?,
        ..StoreReport::default()
    };
    for entry in &mut bitmaps {
        report.bitmap_segments += store_bitmap(entry, changes, target, compress)?;
    }

    let released = changes.take_released_handles();
    for handle in &released {
        target.remove(*handle)?;
    }
    report.released = released.len();
    target.flush()?;

    report.cleared_nodes = changes.clear_state_change_markers().len();
    unpin_entities(entities)?;
    for entry in &mut bitmaps {
        for (_, segment) in entry.bits_mut().blocks_mut() {
            segment.unmark_used_for(UsageMarker::DIRTY);
        }
    }

    tracing::debug!(
        entity_segments = report.entity_segments,
        bitmap_segments = report.bitmap_segments,
        released = report.released,
        cleared = report.cleared_nodes,
        "store cycle complete"
    );
    Ok(report)
}

fn store_entities<E: EntityCodec>(
    entities: &mut EntityStore<E>,
    changes: &ChangeSet,
    target: &dyn SegmentStore,
) -> CoreResult<u64> {
    let mut written = 0;
    for (level3, level2_ref) in entities.level2_refs_mut() {
        // Evicted segments were stored and have not changed since.
        if !level2_ref.is_resident() {
            continue;
        }
        let mut table_changed = level2_ref.handle().is_none()
            || changes.is_instance_new_or_changed(&NodeId::EntityLevel2 { level3 });

        let level2 = level2_ref.get_mut()?;
        for (position, segment) in level2.segments.iter_mut().enumerate() {
            let Some(level1_ref) = segment else { continue };
            let node = NodeId::EntityLevel1 {
                level3,
                level2: position,
            };
            if level1_ref.handle().is_some() && !changes.is_instance_new_or_changed(&node) {
                continue;
            }
            let bytes = encode_level1(&*level1_ref.get()?)?;
            let (handle, fresh) = write_segment(target, level1_ref.handle(), &bytes)?;
            level1_ref.set_handle(handle);
            table_changed |= fresh;
            written += 1;
        }

        if table_changed {
            let bytes = encode_level2(&*level2_ref.get()?)?;
            let (handle, _) = write_segment(target, level2_ref.handle(), &bytes)?;
            level2_ref.set_handle(handle);
            written += 1;
        }
    }
    Ok(written)
}

fn store_bitmap(
    entry: &mut BitmapEntry,
    changes: &ChangeSet,
    target: &dyn SegmentStore,
    compress: bool,
) -> CoreResult<u64> {
    let owner = entry.owner();
    let bits = entry.bits_mut();
    if compress {
        bits.ensure_compressed()?;
    }
    let mut written = 0;
    for (block, segment) in bits.blocks_mut() {
        if segment.handle().is_some()
            && !changes.is_instance_new_or_changed(&NodeId::BitmapSegment { owner, block })
        {
            continue;
        }
        let bytes = {
            let level2 = segment.get()?;
            if compress {
                level2.to_bytes()
            } else {
                level2.to_dense_bytes()
            }
        };
        let (handle, _) = write_segment(target, segment.handle(), &bytes)?;
        segment.set_handle(handle);
        written += 1;
    }
    Ok(written)
}

fn unpin_entities<E>(entities: &mut EntityStore<E>) -> CoreResult<()> {
    for (_, level2_ref) in entities.level2_refs_mut() {
        level2_ref.unmark_used_for(UsageMarker::DIRTY);
        if !level2_ref.is_resident() {
            continue;
        }
        for level1_ref in level2_ref.get_mut()?.segments.iter_mut().flatten() {
            level1_ref.unmark_used_for(UsageMarker::DIRTY);
        }
    }
    Ok(())
}

/// Evicts every stored, unpinned segment. Returns how many were evicted.
///
/// A Level2 segment is only evicted once all of its children are stored
/// and clean, since reloading it recreates them from their handles.
pub(crate) fn evict<E: EntityCodec + Send + Sync + 'static>(
    entities: &mut EntityStore<E>,
    bitmaps: Vec<&mut BitmapEntry>,
    loaders: &Loaders<E>,
) -> CoreResult<u64> {
    let mut evicted = 0;
    for (_, level2_ref) in entities.level2_refs_mut() {
        if !level2_ref.is_resident() {
            continue;
        }
        let mut children_clean = true;
        for level1_ref in level2_ref.get_mut()?.segments.iter_mut().flatten() {
            if level1_ref.evict(Arc::clone(&loaders.level1)) {
                evicted += 1;
            } else if level1_ref.is_resident() {
                children_clean = false;
            }
        }
        if children_clean && level2_ref.evict(Arc::clone(&loaders.level2)) {
            evicted += 1;
        }
    }

    for entry in bitmaps {
        for (_, segment) in entry.bits_mut().blocks_mut() {
            if segment.evict(Arc::clone(&loaders.bitmap)) {
                evicted += 1;
            }
        }
    }
    tracing::debug!(evicted, "evicted unused segments");
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use crate::types::BitmapOwner;
    use gigamap_storage::InMemorySegmentStore;

    fn config() -> GigaMapConfig {
        GigaMapConfig::compact()
    }

    fn filled_store(count: usize, changes: &mut ChangeSet) -> EntityStore<String> {
        let mut store = EntityStore::new(config());
        for i in 0..count {
            store.add(Arc::new(format!("e{i}")), changes).unwrap();
        }
        store
    }

    #[test]
    fn level1_encoding_keeps_empty_slots() {
        let mut level1: Level1<String> = Level1::new(4);
        level1.slots[1] = Some(Arc::new("one".into()));
        level1.slots[3] = Some(Arc::new(String::new()));

        let decoded: Level1<String> = decode_level1(&encode_level1(&level1).unwrap(), 4).unwrap();
        assert!(decoded.slots[0].is_none());
        assert_eq!(decoded.slots[1].as_deref().map(String::as_str), Some("one"));
        assert!(decoded.slots[2].is_none());
        assert_eq!(decoded.slots[3].as_deref().map(String::as_str), Some(""));
    }

    #[test]
    fn damaged_level1_is_rejected() {
        let mut level1: Level1<String> = Level1::new(2);
        level1.slots[0] = Some(Arc::new("payload".into()));
        let mut bytes = encode_level1(&level1).unwrap();
        bytes[10] ^= 0xFF;

        let err = decode_level1::<String>(&bytes, 2).err().unwrap();
        assert!(matches!(err, CoreError::SegmentCorruption { .. }));
        let err = decode_level1::<String>(&encode_level1(&level1).unwrap(), 4)
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::SegmentCorruption { .. }));
        assert!(decode_level1::<String>(&bytes[..6], 2).is_err());
    }

    #[test]
    fn level2_refuses_unstored_children() {
        let mut level2: Level2<String> = Level2::new(2);
        level2.segments[0] = Some(Lazy::new(Level1::new(2)));
        assert!(matches!(
            encode_level2(&level2),
            Err(CoreError::SegmentCorruption { .. })
        ));
    }

    #[test]
    fn store_cycle_writes_once_and_clears_changes() {
        let target = InMemorySegmentStore::new();
        let mut changes = ChangeSet::new();
        let mut store = filled_store(10, &mut changes);

        let report = super::store(&mut store, Vec::new(), &mut changes, &target, true).unwrap();
        // 10 entities: three Level1 segments of four plus one Level2 segment
        assert_eq!(report.entity_segments, 4);
        assert!(changes.is_empty());
        assert_eq!(target.segment_count(), 4);

        let report = super::store(&mut store, Vec::new(), &mut changes, &target, true).unwrap();
        assert_eq!(report.segments_written(), 0);

        store
            .replace(EntityId::new(5), Arc::new("changed".into()), &mut changes)
            .unwrap();
        let report = super::store(&mut store, Vec::new(), &mut changes, &target, true).unwrap();
        // only the touched Level1 segment; its handle did not change
        assert_eq!(report.entity_segments, 1);
        assert_eq!(target.segment_count(), 4);
    }

    #[test]
    fn evicted_entities_reload_transparently() {
        let target: Arc<InMemorySegmentStore> = Arc::new(InMemorySegmentStore::new());
        let stats = Arc::new(GigaMapStats::new());
        let loaders = Loaders::new(target.clone(), Arc::clone(&stats), &config());
        let mut changes = ChangeSet::new();
        let mut store = filled_store(40, &mut changes);

        // Dirty segments are pinned.
        assert_eq!(evict(&mut store, Vec::new(), &loaders).unwrap(), 0);

        super::store(&mut store, Vec::new(), &mut changes, target.as_ref(), true).unwrap();
        let evicted = evict(&mut store, Vec::new(), &loaders).unwrap();
        // ten Level1 segments and three Level2 segments
        assert_eq!(evicted, 13);

        assert_eq!(*store.get(EntityId::new(17)).unwrap().unwrap(), "e17");
        assert_eq!(stats.segments_loaded(), 2);

        store
            .replace(EntityId::new(17), Arc::new("again".into()), &mut changes)
            .unwrap();
        assert_eq!(*store.get(EntityId::new(17)).unwrap().unwrap(), "again");
        let mut seen = 0;
        store
            .for_each(|_, _| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 40);
    }

    #[test]
    fn corrupt_bitmap_block_fails_on_reload() {
        let target: Arc<InMemorySegmentStore> = Arc::new(InMemorySegmentStore::new());
        let stats = Arc::new(GigaMapStats::new());
        let loaders: Loaders<String> = Loaders::new(target.clone(), stats, &config());
        let mut changes = ChangeSet::new();
        let mut store: EntityStore<String> = EntityStore::new(config());
        let mut entry = BitmapEntry::new(BitmapOwner::live(), config().bitmap_block_exponent, &mut changes);
        for id in [1u64, 5, 300] {
            entry.add(EntityId::new(id), &mut changes).unwrap();
        }

        let report =
            super::store(&mut store, vec![&mut entry], &mut changes, target.as_ref(), true).unwrap();
        assert!(report.bitmap_segments >= 1);
        assert!(evict(&mut store, vec![&mut entry], &loaders).unwrap() >= 1);
        assert!(entry.contains(EntityId::new(5)).unwrap());

        evict(&mut store, vec![&mut entry], &loaders).unwrap();
        for raw in 1..=target.segment_count() as u64 {
            target.corrupt(SegmentHandle::new(raw).unwrap(), vec![0xAB; 7]);
        }
        assert!(matches!(
            entry.contains(EntityId::new(5)),
            Err(CoreError::SegmentCorruption { .. })
        ));
    }

    #[test]
    fn released_segments_are_removed() {
        let target = InMemorySegmentStore::new();
        let mut changes = ChangeSet::new();
        let mut store = filled_store(10, &mut changes);
        super::store(&mut store, Vec::new(), &mut changes, &target, false).unwrap();
        assert_eq!(target.segment_count(), 4);

        store.remove_all(&mut changes);
        let report = super::store(&mut store, Vec::new(), &mut changes, &target, false).unwrap();
        assert_eq!(report.released, 4);
        assert_eq!(target.segment_count(), 0);
    }
}
