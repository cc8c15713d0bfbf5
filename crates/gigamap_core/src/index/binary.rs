//! Binary indices: one bitmap per key bit.
//!
//! An entity with key `k` is set in the bitmap of every bit of `k`. A
//! lookup intersects the bitmaps of `k`'s set bits and subtracts the
//! bitmaps of every other materialized bit. Keys are never zero (see
//! [`BinaryValue`]), so every indexed entity sits in at least one bitmap.

use super::registry::IndexMaintainer;
use super::traits::{BinaryIndexer, BinaryValue, IndexKind};
use super::transition::{EntryHandle, Transition};
use super::IndexHandle;
use crate::bitmap::{BitmapEntry, BitmapLevel3, BitmapResult};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::query::{Condition, ConditionLeaf, QueryContext};
use crate::state::{ChangeSet, NodeId};
use crate::types::{BitmapOwner, IndexId};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

const KEY_BITS: usize = 64;

pub(crate) fn bits_of(key: Option<u64>) -> Vec<u32> {
    let Some(key) = key else {
        return Vec::new();
    };
    (0..KEY_BITS as u32).filter(|bit| key & (1u64 << bit) != 0).collect()
}

/// The 64 bit-position bitmaps of one binary (sub-)index.
pub(crate) struct BitSlices {
    slices: Vec<Option<BitmapEntry>>,
    index: IndexId,
    sub: u32,
    exponent: u32,
}

impl BitSlices {
    pub(crate) fn new(index: IndexId, sub: u32, exponent: u32) -> Self {
        Self {
            slices: (0..KEY_BITS).map(|_| None).collect(),
            index,
            sub,
            exponent,
        }
    }

    pub(crate) fn plan(&self, id: EntityId, old: Option<u64>, new: Option<u64>) -> Transition<u32> {
        Transition::plan(id, &bits_of(old), &bits_of(new), |bit| {
            self.slices[*bit as usize].as_ref().map(|_| *bit as usize)
        })
    }

    pub(crate) fn commit(&mut self, plan: Transition<u32>, changes: &mut ChangeSet) -> CoreResult<()> {
        let id = plan.id;
        for handle in plan.removals {
            match handle {
                EntryHandle::Null => {}
                EntryHandle::Existing(bit) => {
                    if let Some(slice) = &mut self.slices[bit] {
                        slice.remove(id, changes)?;
                    }
                }
                EntryHandle::Pending(bit) => {
                    return Err(CoreError::unsupported(format!(
                        "cannot remove entity {} from unmaterialized bit {}",
                        id, bit
                    )));
                }
            }
        }
        for handle in plan.targets {
            let bit = match handle {
                EntryHandle::Null => continue,
                EntryHandle::Existing(bit) => bit,
                EntryHandle::Pending(bit) => bit as usize,
            };
            let (index, sub, exponent) = (self.index, self.sub, self.exponent);
            let slice = self.slices[bit].get_or_insert_with(|| {
                changes.mark_changed(NodeId::Index(index));
                BitmapEntry::new(BitmapOwner::new(index, sub, bit as u32), exponent, changes)
            });
            slice.add(id, changes)?;
        }
        Ok(())
    }

    /// Entities whose key is exactly `key`.
    pub(crate) fn query(&self, key: u64) -> BitmapResult<'_> {
        let set = bits_of(Some(key));
        let mut positives = Vec::with_capacity(set.len());
        for bit in &set {
            match &self.slices[*bit as usize] {
                Some(slice) => positives.push(slice.bits()),
                None => return BitmapResult::Empty,
            }
        }
        let Some(first) = positives.first().copied() else {
            return BitmapResult::Empty;
        };

        let negatives: Vec<_> = self
            .slices
            .iter()
            .enumerate()
            .filter(|(bit, _)| key & (1u64 << bit) == 0)
            .filter_map(|(_, slice)| slice.as_ref().map(BitmapEntry::result))
            .collect();

        let mut terms: Vec<_> = positives.into_iter().map(BitmapResult::Bitmap).collect();
        if !negatives.is_empty() {
            terms.push(BitmapResult::not(BitmapResult::or(negatives), first));
        }
        BitmapResult::and(terms)
    }

    /// Live entities not set in any bit, i.e. with a null key.
    pub(crate) fn query_null<'a>(&'a self, live: &'a BitmapLevel3) -> BitmapResult<'a> {
        BitmapResult::not(self.any(), live)
    }

    /// Entities with any non-null key.
    pub(crate) fn any(&self) -> BitmapResult<'_> {
        BitmapResult::or(
            self.slices
                .iter()
                .flatten()
                .map(BitmapEntry::result)
                .collect(),
        )
    }

    pub(crate) fn conflicting_holder(&self, id: EntityId, key: Option<u64>) -> CoreResult<Option<EntityId>> {
        let Some(key) = key else {
            return Ok(None);
        };
        for holder in self.query(key).cursor() {
            let holder = holder?;
            if holder != id {
                return Ok(Some(holder));
            }
        }
        Ok(None)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.slices.iter().flatten().count()
    }

    pub(crate) fn remove_all(&mut self, changes: &mut ChangeSet) {
        for slice in self.slices.iter_mut() {
            if let Some(mut entry) = slice.take() {
                entry.remove_all(changes);
                entry.forget_changes(changes);
            }
        }
        changes.mark_changed(NodeId::Index(self.index));
    }

    pub(crate) fn bitmaps_mut(&mut self) -> impl Iterator<Item = &mut BitmapEntry> {
        self.slices.iter_mut().flatten()
    }
}

struct PendingKey {
    plan: Transition<u32>,
    key: Option<u64>,
}

/// An index over integer keys without a hash table.
pub struct BinaryIndex<E, I: BinaryIndexer<E>> {
    id: IndexId,
    name: String,
    indexer: I,
    slices: BitSlices,
    pending: Option<PendingKey>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: BinaryIndexer<E>> BinaryIndex<E, I> {
    pub(crate) fn new(id: IndexId, indexer: I, exponent: u32) -> Self {
        Self {
            id,
            name: indexer.name(),
            indexer,
            slices: BitSlices::new(id, 0, exponent),
            pending: None,
            _marker: PhantomData,
        }
    }

    /// The indexer.
    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    /// Entities whose key equals `value`.
    ///
    /// Values that can never be indexed yield the empty result.
    pub fn query(&self, value: I::Value) -> BitmapResult<'_> {
        match value.to_key() {
            Ok(key) => self.slices.query(key),
            Err(_) => BitmapResult::Empty,
        }
    }

    /// Entities whose key is any of `values`.
    pub fn in_set(&self, values: &[I::Value]) -> BitmapResult<'_> {
        BitmapResult::or(values.iter().map(|value| self.query(*value)).collect())
    }

    /// Entities with a null key.
    pub fn query_null<'a>(&'a self, live: &'a BitmapLevel3) -> BitmapResult<'a> {
        self.slices.query_null(live)
    }

    /// Number of materialized bit bitmaps.
    pub fn entry_count(&self) -> usize {
        self.slices.entry_count()
    }

    fn key_of(&self, entity: Option<&E>, checked: bool) -> CoreResult<Option<u64>> {
        let Some(entity) = entity else {
            return Ok(None);
        };
        match self.indexer.index(entity) {
            Some(value) => value.to_key().map(Some).map_err(|err| match err {
                CoreError::InvalidConfiguration { message } => {
                    CoreError::invalid_configuration(format!("index '{}': {}", self.name, message))
                }
                other => other,
            }),
            None if checked && !self.indexer.allows_null() => Err(CoreError::invalid_configuration(
                format!("index '{}' does not allow null keys", self.name),
            )),
            None => Ok(None),
        }
    }
}

impl<E: 'static, I: BinaryIndexer<E>> IndexMaintainer<E> for BinaryIndex<E, I> {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Binary
    }

    fn prepare(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()> {
        let old_key = self.key_of(old, false)?;
        let new_key = self.key_of(new, true)?;
        self.pending = Some(PendingKey {
            plan: self.slices.plan(id, old_key, new_key),
            key: new_key,
        });
        Ok(())
    }

    fn conflicting_holder(&self) -> CoreResult<Option<(EntityId, String)>> {
        let Some(pending) = &self.pending else {
            return Ok(None);
        };
        let (Some(key), id) = (pending.key, pending.plan.id) else {
            return Ok(None);
        };
        let holder = self.slices.conflicting_holder(id, Some(key))?;
        Ok(holder.map(|other| (other, format!("{:?}", I::Value::from_key(key)))))
    }

    fn commit(&mut self, changes: &mut ChangeSet) -> CoreResult<()> {
        match self.pending.take() {
            Some(pending) => self.slices.commit(pending.plan, changes),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        self.pending = None;
    }

    fn remove_all(&mut self, changes: &mut ChangeSet) {
        self.slices.remove_all(changes);
    }

    fn entry_count(&self) -> usize {
        self.slices.entry_count()
    }

    fn bitmaps_mut(&mut self) -> Vec<&mut BitmapEntry> {
        self.slices.bitmaps_mut().collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct BinaryIs<E, I: BinaryIndexer<E>> {
    index: IndexId,
    name: Arc<str>,
    values: Vec<Option<I::Value>>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: BinaryIndexer<E>> ConditionLeaf<E> for BinaryIs<E, I> {
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        let index = ctx.index::<BinaryIndex<E, I>>(self.index, &self.name)?;
        Ok(BitmapResult::or(
            self.values
                .iter()
                .map(|value| match value {
                    Some(value) => index.query(*value),
                    None => index.query_null(ctx.live()),
                })
                .collect(),
        ))
    }

    fn describe(&self) -> String {
        format!("{} in {:?}", self.name, self.values)
    }
}

struct BinarySearch {
    name: Arc<str>,
}

impl<E: 'static> ConditionLeaf<E> for BinarySearch {
    fn evaluate<'a>(&self, _ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        Err(CoreError::unsupported(format!(
            "binary index '{}' supports only equality and set lookups",
            self.name
        )))
    }

    fn describe(&self) -> String {
        format!("{} matches <predicate>", self.name)
    }
}

impl<E: 'static, I: BinaryIndexer<E>> IndexHandle<BinaryIndex<E, I>> {
    /// Entities whose key equals `value`.
    pub fn is(&self, value: I::Value) -> Condition<E> {
        self.in_set([value])
    }

    /// Entities whose key is any of `values`.
    pub fn in_set(&self, values: impl IntoIterator<Item = I::Value>) -> Condition<E> {
        self.leaf(values.into_iter().map(Some).collect())
    }

    /// Entities with a null key.
    pub fn is_null(&self) -> Condition<E> {
        self.leaf(vec![None])
    }

    /// Predicate search. Binary indices do not support it; evaluating the
    /// condition fails with [`CoreError::Unsupported`].
    pub fn search(&self, predicate: impl Fn(&I::Value) -> bool + Send + Sync + 'static) -> Condition<E> {
        drop(predicate);
        Condition::leaf(BinarySearch {
            name: self.shared_name(),
        })
    }

    fn leaf(&self, values: Vec<Option<I::Value>>) -> Condition<E> {
        Condition::leaf(BinaryIs::<E, I> {
            index: self.id(),
            name: self.shared_name(),
            values,
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::traits::BinaryFn;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn ids(result: BitmapResult<'_>) -> Vec<u64> {
        result.cursor().map(|id| id.unwrap().as_u64()).collect()
    }

    fn index<V: BinaryValue>() -> BinaryIndex<Option<V>, impl BinaryIndexer<Option<V>, Value = V>> {
        BinaryIndex::new(IndexId::new(0), BinaryFn::new("value", |v: &Option<V>| *v), 2)
    }

    fn put<I: BinaryIndexer<Option<V>>, V: BinaryValue>(
        index: &mut BinaryIndex<Option<V>, I>,
        id: u64,
        old: Option<Option<V>>,
        new: Option<Option<V>>,
        changes: &mut ChangeSet,
    ) -> CoreResult<()> {
        index.prepare(EntityId::new(id), old.as_ref(), new.as_ref())?;
        index.commit(changes)
    }

    #[test]
    fn exact_key_excludes_supersets() {
        let mut index = index::<u32>();
        let mut changes = ChangeSet::new();
        put(&mut index, 0, None, Some(Some(1)), &mut changes).unwrap();
        put(&mut index, 1, None, Some(Some(3)), &mut changes).unwrap();
        put(&mut index, 2, None, Some(Some(2)), &mut changes).unwrap();

        assert_eq!(ids(index.query(1)), vec![0]);
        assert_eq!(ids(index.query(3)), vec![1]);
        assert_eq!(ids(index.query(2)), vec![2]);
        assert!(ids(index.query(7)).is_empty());
        assert_eq!(ids(index.in_set(&[1, 2])), vec![0, 2]);
    }

    #[test]
    fn zero_and_max_do_not_collide() {
        let mut index = index::<u8>();
        let mut changes = ChangeSet::new();
        put(&mut index, 0, None, Some(Some(0)), &mut changes).unwrap();
        put(&mut index, 1, None, Some(Some(u8::MAX)), &mut changes).unwrap();

        assert_eq!(ids(index.query(0)), vec![0]);
        assert_eq!(ids(index.query(u8::MAX)), vec![1]);
    }

    #[test]
    fn wide_max_is_rejected_and_zero_round_trips() {
        let mut index = index::<i64>();
        let mut changes = ChangeSet::new();
        let err = put(&mut index, 0, None, Some(Some(i64::MAX)), &mut changes).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration { .. }));
        assert_eq!(index.entry_count(), 0);

        put(&mut index, 0, None, Some(Some(0)), &mut changes).unwrap();
        put(&mut index, 1, None, Some(Some(-1)), &mut changes).unwrap();
        assert_eq!(ids(index.query(0)), vec![0]);
        assert_eq!(ids(index.query(-1)), vec![1]);
        assert!(index.query(i64::MAX).is_empty_sentinel());
    }

    #[test]
    fn null_keys_are_optional() {
        let mut changes = ChangeSet::new();
        let mut strict = BinaryIndex::new(
            IndexId::new(0),
            BinaryFn::new("value", |v: &Option<u16>| *v).forbid_null(),
            2,
        );
        let err = put(&mut strict, 0, None, Some(None), &mut changes).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration { .. }));

        let mut lenient = index::<u16>();
        put(&mut lenient, 0, None, Some(None), &mut changes).unwrap();
        put(&mut lenient, 1, None, Some(Some(4)), &mut changes).unwrap();

        let mut live = BitmapLevel3::new(2);
        for id in [0, 1] {
            live.add(id, BitmapOwner::live(), &mut changes).unwrap();
        }
        assert_eq!(ids(lenient.query_null(&live)), vec![0]);
    }

    #[test]
    fn replace_moves_bits() {
        let mut index = index::<u32>();
        let mut changes = ChangeSet::new();
        put(&mut index, 0, None, Some(Some(6)), &mut changes).unwrap();
        put(&mut index, 0, Some(Some(6)), Some(Some(5)), &mut changes).unwrap();
        assert!(ids(index.query(6)).is_empty());
        assert_eq!(ids(index.query(5)), vec![0]);

        put(&mut index, 0, Some(Some(5)), None, &mut changes).unwrap();
        assert!(ids(index.query(5)).is_empty());
    }

    #[test]
    fn unique_conflicts_are_found() {
        let mut index = index::<u32>();
        let mut changes = ChangeSet::new();
        put(&mut index, 0, None, Some(Some(3)), &mut changes).unwrap();

        index
            .prepare(EntityId::new(1), None, Some(&Some(3)))
            .unwrap();
        let (other, value) = index.conflicting_holder().unwrap().unwrap();
        assert_eq!(other, EntityId::new(0));
        assert_eq!(value, "3");
        index.abort();

        index
            .prepare(EntityId::new(0), Some(&Some(3)), Some(&Some(3)))
            .unwrap();
        assert!(index.conflicting_holder().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn queries_match_a_model(values in prop::collection::vec(any::<i16>(), 1..80)) {
            let mut index = index::<i16>();
            let mut changes = ChangeSet::new();
            let mut model: BTreeMap<i16, Vec<u64>> = BTreeMap::new();
            for (id, value) in values.iter().enumerate() {
                put(&mut index, id as u64, None, Some(Some(*value)), &mut changes).unwrap();
                model.entry(*value).or_default().push(id as u64);
            }
            for (value, expected) in &model {
                prop_assert_eq!(&ids(index.query(*value)), expected);
            }
        }
    }
}
