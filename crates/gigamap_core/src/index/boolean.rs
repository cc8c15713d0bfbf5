//! Boolean indices.
//!
//! Only `true` is materialized; `false` is the negation of `true` against
//! the live IDs, so every live entity is in exactly one of the two.

use super::hash::KeyTable;
use super::registry::IndexMaintainer;
use super::traits::{BooleanIndexer, IndexKind};
use super::transition::Transition;
use super::IndexHandle;
use crate::bitmap::{BitmapEntry, BitmapLevel3, BitmapResult};
use crate::entity::EntityId;
use crate::error::CoreResult;
use crate::query::{Condition, ConditionLeaf, QueryContext};
use crate::state::ChangeSet;
use crate::types::IndexId;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

/// An index over a flag.
pub struct BooleanIndex<E, I: BooleanIndexer<E>> {
    id: IndexId,
    name: String,
    indexer: I,
    table: KeyTable<()>,
    pending: Option<Transition<()>>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: BooleanIndexer<E>> BooleanIndex<E, I> {
    pub(crate) fn new(id: IndexId, indexer: I, exponent: u32) -> Self {
        Self {
            id,
            name: indexer.name(),
            indexer,
            table: KeyTable::new(id, 0, exponent),
            pending: None,
            _marker: PhantomData,
        }
    }

    /// The indexer.
    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    /// Entities whose flag is set.
    pub fn query_true(&self) -> BitmapResult<'_> {
        self.table.query(&())
    }

    /// Live entities whose flag is clear.
    pub fn query_false<'a>(&'a self, live: &'a BitmapLevel3) -> BitmapResult<'a> {
        BitmapResult::not(self.query_true(), live)
    }

    /// The `true` entry, once an entity with the flag set was indexed.
    pub fn entry(&self) -> Option<&BitmapEntry> {
        self.table.entries().next().map(|(_, entry)| entry)
    }

    fn key_of(&self, entity: Option<&E>) -> Vec<()> {
        match entity {
            Some(entity) if self.indexer.index(entity) => vec![()],
            _ => Vec::new(),
        }
    }
}

impl<E: 'static, I: BooleanIndexer<E>> IndexMaintainer<E> for BooleanIndex<E, I> {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Boolean
    }

    fn prepare(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()> {
        let old = self.key_of(old);
        let new = self.key_of(new);
        self.pending = Some(self.table.plan(id, &old, &new));
        Ok(())
    }

    fn conflicting_holder(&self) -> CoreResult<Option<(EntityId, String)>> {
        let Some(plan) = &self.pending else {
            return Ok(None);
        };
        Ok(self
            .table
            .conflicting_holder(plan)?
            .map(|(other, _)| (other, "true".to_string())))
    }

    fn commit(&mut self, changes: &mut ChangeSet) -> CoreResult<()> {
        match self.pending.take() {
            Some(plan) => self.table.commit(plan, changes),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        self.pending = None;
    }

    fn remove_all(&mut self, changes: &mut ChangeSet) {
        self.table.remove_all(changes);
    }

    fn entry_count(&self) -> usize {
        self.table.entry_count()
    }

    fn bitmaps_mut(&mut self) -> Vec<&mut BitmapEntry> {
        self.table.bitmaps_mut().collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct BooleanIs<E, I: BooleanIndexer<E>> {
    index: IndexId,
    name: Arc<str>,
    value: bool,
    _marker: PhantomData<fn(&E) -> I>,
}

impl<E: 'static, I: BooleanIndexer<E>> ConditionLeaf<E> for BooleanIs<E, I> {
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        let index = ctx.index::<BooleanIndex<E, I>>(self.index, &self.name)?;
        Ok(if self.value {
            index.query_true()
        } else {
            index.query_false(ctx.live())
        })
    }

    fn describe(&self) -> String {
        format!("{} is {}", self.name, self.value)
    }
}

impl<E: 'static, I: BooleanIndexer<E>> IndexHandle<BooleanIndex<E, I>> {
    /// Entities whose flag equals `value`.
    pub fn is(&self, value: bool) -> Condition<E> {
        Condition::leaf(BooleanIs::<E, I> {
            index: self.id(),
            name: self.shared_name(),
            value,
            _marker: PhantomData,
        })
    }

    /// Entities whose flag is set.
    pub fn is_true(&self) -> Condition<E> {
        self.is(true)
    }

    /// Entities whose flag is clear.
    pub fn is_false(&self) -> Condition<E> {
        self.is(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::traits::BooleanFn;
    use crate::types::BitmapOwner;

    fn ids(result: BitmapResult<'_>) -> Vec<u64> {
        result.cursor().map(|id| id.unwrap().as_u64()).collect()
    }

    #[test]
    fn true_and_false_partition_live_ids() {
        let mut index = BooleanIndex::new(IndexId::new(0), BooleanFn::new("even", |v: &u32| v % 2 == 0), 2);
        let mut changes = ChangeSet::new();
        let mut live = BitmapLevel3::new(2);
        for id in 0..10u32 {
            index.prepare(EntityId::new(u64::from(id)), None, Some(&id)).unwrap();
            index.commit(&mut changes).unwrap();
            live.add(u64::from(id), BitmapOwner::live(), &mut changes).unwrap();
        }

        assert_eq!(ids(index.query_true()), vec![0, 2, 4, 6, 8]);
        assert_eq!(ids(index.query_false(&live)), vec![1, 3, 5, 7, 9]);
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn false_is_never_materialized() {
        let mut index = BooleanIndex::new(IndexId::new(0), BooleanFn::new("never", |_: &u32| false), 2);
        let mut changes = ChangeSet::new();
        let mut live = BitmapLevel3::new(2);
        index.prepare(EntityId::new(0), None, Some(&0)).unwrap();
        index.commit(&mut changes).unwrap();
        live.add(0, BitmapOwner::live(), &mut changes).unwrap();

        assert_eq!(index.entry_count(), 0);
        assert!(index.entry().is_none());
        assert!(index.query_true().is_empty_sentinel());
        assert_eq!(ids(index.query_false(&live)), vec![0]);
    }

    #[test]
    fn flipping_moves_between_branches() {
        let mut index = BooleanIndex::new(IndexId::new(0), BooleanFn::new("odd", |v: &u32| v % 2 == 1), 2);
        let mut changes = ChangeSet::new();
        index.prepare(EntityId::new(0), None, Some(&1)).unwrap();
        index.commit(&mut changes).unwrap();
        index.prepare(EntityId::new(0), Some(&1), Some(&2)).unwrap();
        index.commit(&mut changes).unwrap();

        assert!(ids(index.query_true()).is_empty());
        assert_eq!(index.entry_count(), 1);
    }
}
