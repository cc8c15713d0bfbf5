//! Composite indices: one sub-index per key component.
//!
//! Position `i` of every key is answered by sub-index `i`. Sub-indices are
//! created as wider keys are observed and are never dropped; a component
//! slot left `None` is simply not indexed at that position.

use super::binary::{bits_of, BitSlices};
use super::hash::KeyTable;
use super::registry::IndexMaintainer;
use super::traits::{BinaryValue, CompositeIndexer, IndexKind, SubKind};
use super::transition::Transition;
use super::IndexHandle;
use crate::bitmap::{BitmapEntry, BitmapLevel3, BitmapResult};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::query::{Condition, ConditionLeaf, QueryContext};
use crate::state::ChangeSet;
use crate::types::IndexId;
use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

enum Sub<C> {
    Hashing(KeyTable<C>),
    Binary(BitSlices),
}

impl<C: Eq + Hash + Clone + Debug> Sub<C> {
    fn entry_count(&self) -> usize {
        match self {
            Sub::Hashing(table) => table.entry_count(),
            Sub::Binary(slices) => slices.entry_count(),
        }
    }

    fn any(&self) -> BitmapResult<'_> {
        match self {
            Sub::Hashing(table) => table.any(),
            Sub::Binary(slices) => slices.any(),
        }
    }

    fn remove_all(&mut self, changes: &mut ChangeSet) {
        match self {
            Sub::Hashing(table) => table.remove_all(changes),
            Sub::Binary(slices) => slices.remove_all(changes),
        }
    }

    fn bitmaps_mut(&mut self) -> Box<dyn Iterator<Item = &mut BitmapEntry> + '_> {
        match self {
            Sub::Hashing(table) => Box::new(table.bitmaps_mut()),
            Sub::Binary(slices) => Box::new(slices.bitmaps_mut()),
        }
    }
}

/// A bit table every ID of `result` is set in.
fn anchor<'a>(result: &BitmapResult<'a>) -> Option<&'a BitmapLevel3> {
    match result {
        BitmapResult::Bitmap(bits) => Some(*bits),
        BitmapResult::And(children) => children.iter().find_map(anchor),
        _ => None,
    }
}

enum SubPlan<C> {
    Hashing(Transition<C>),
    Binary(Transition<u32>),
}

struct CompositePlan<C> {
    id: EntityId,
    subs: Vec<SubPlan<C>>,
    key: Vec<Option<C>>,
}

/// An index over multi-component keys.
pub struct CompositeIndex<E, I: CompositeIndexer<E>> {
    id: IndexId,
    name: String,
    indexer: I,
    sub_kind: SubKind,
    exponent: u32,
    subs: Vec<Sub<I::Component>>,
    pending: Option<CompositePlan<I::Component>>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: CompositeIndexer<E>> CompositeIndex<E, I> {
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if the indexer declares
    /// a maximum width of zero.
    pub(crate) fn new(id: IndexId, indexer: I, exponent: u32) -> CoreResult<Self> {
        let name = indexer.name();
        if indexer.max_width() == 0 {
            return Err(CoreError::invalid_configuration(format!(
                "composite index '{}' must declare at least one component",
                name
            )));
        }
        Ok(Self {
            id,
            name,
            sub_kind: indexer.sub_kind(),
            indexer,
            exponent,
            subs: Vec::new(),
            pending: None,
            _marker: PhantomData,
        })
    }

    /// The indexer.
    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    /// Number of sub-indices created so far.
    pub fn width(&self) -> usize {
        self.subs.len()
    }

    /// Number of entries across all sub-indices.
    pub fn entry_count(&self) -> usize {
        self.subs.iter().map(Sub::entry_count).sum()
    }

    /// Entries of the sub-index at `position`.
    pub fn sub_entry_count(&self, position: usize) -> usize {
        self.subs.get(position).map_or(0, Sub::entry_count)
    }

    /// Entities matching every present component of `sample`.
    ///
    /// `None` components match anything. A sample without any present
    /// component matches every live entity.
    pub fn query<'a>(&'a self, sample: &[Option<I::Component>], live: &'a BitmapLevel3) -> BitmapResult<'a> {
        let terms = self.positives(sample);
        if terms.is_empty() {
            return BitmapResult::Bitmap(live);
        }
        BitmapResult::and(terms)
    }

    fn positives(&self, sample: &[Option<I::Component>]) -> Vec<BitmapResult<'_>> {
        sample
            .iter()
            .enumerate()
            .filter_map(|(position, component)| {
                component.as_ref().map(|c| self.query_at(position, c))
            })
            .collect()
    }

    fn query_at(&self, position: usize, component: &I::Component) -> BitmapResult<'_> {
        match self.subs.get(position) {
            Some(Sub::Hashing(table)) => table.query(component),
            Some(Sub::Binary(slices)) => match self.binary_key(component) {
                Ok(key) => slices.query(key),
                Err(_) => BitmapResult::Empty,
            },
            None => BitmapResult::Empty,
        }
    }

    /// Entities whose key equals `key` at every position, absent positions included.
    fn exact(&self, key: &[Option<I::Component>]) -> BitmapResult<'_> {
        let positives = self.positives(key);
        let Some(universe) = positives.iter().find_map(anchor) else {
            return BitmapResult::and(positives);
        };
        let negatives: Vec<_> = self
            .subs
            .iter()
            .enumerate()
            .filter(|(position, _)| key.get(*position).map_or(true, Option::is_none))
            .map(|(_, sub)| sub.any())
            .collect();
        let mut terms = positives;
        if !negatives.is_empty() {
            terms.push(BitmapResult::not(BitmapResult::or(negatives), universe));
        }
        BitmapResult::and(terms)
    }

    fn binary_key(&self, component: &I::Component) -> CoreResult<u64> {
        self.indexer
            .to_binary(component)?
            .to_key()
            .map_err(|_| {
                CoreError::invalid_configuration(format!(
                    "composite index '{}' mapped component {:?} to u64::MAX, the reserved zero sentinel",
                    self.name, component
                ))
            })
    }

    fn key_of(&self, entity: Option<&E>) -> CoreResult<Vec<Option<I::Component>>> {
        let mut carrier = Vec::new();
        let Some(entity) = entity else {
            return Ok(carrier);
        };
        self.indexer.index(entity, &mut carrier);
        while matches!(carrier.last(), Some(None)) {
            carrier.pop();
        }
        if carrier.len() > self.indexer.max_width() {
            return Err(CoreError::invalid_configuration(format!(
                "composite index '{}' accepts {} components, key has {}",
                self.name,
                self.indexer.max_width(),
                carrier.len()
            )));
        }
        Ok(carrier)
    }

    fn plan_at(
        &self,
        position: usize,
        id: EntityId,
        old: Option<&I::Component>,
        new: Option<&I::Component>,
    ) -> CoreResult<SubPlan<I::Component>> {
        match self.sub_kind {
            SubKind::Hashing => {
                let old: Vec<_> = old.into_iter().cloned().collect();
                let new: Vec<_> = new.into_iter().cloned().collect();
                Ok(SubPlan::Hashing(match self.subs.get(position) {
                    Some(Sub::Hashing(table)) => table.plan(id, &old, &new),
                    _ => Transition::plan(id, &old, &new, |_| None),
                }))
            }
            SubKind::Binary => {
                let old = old.map(|c| self.binary_key(c)).transpose()?;
                let new = new.map(|c| self.binary_key(c)).transpose()?;
                Ok(SubPlan::Binary(match self.subs.get(position) {
                    Some(Sub::Binary(slices)) => slices.plan(id, old, new),
                    _ => Transition::plan(id, &bits_of(old), &bits_of(new), |_| None),
                }))
            }
        }
    }

    fn grow_to(&mut self, width: usize) {
        while self.subs.len() < width {
            let position = self.subs.len() as u32;
            let sub = match self.sub_kind {
                SubKind::Hashing => Sub::Hashing(KeyTable::new(self.id, position, self.exponent)),
                SubKind::Binary => Sub::Binary(BitSlices::new(self.id, position, self.exponent)),
            };
            self.subs.push(sub);
        }
    }
}

impl<E: 'static, I: CompositeIndexer<E>> IndexMaintainer<E> for CompositeIndex<E, I> {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Composite
    }

    fn prepare(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()> {
        let old_key = self.key_of(old)?;
        let new_key = self.key_of(new)?;
        let width = old_key.len().max(new_key.len());
        let mut subs = Vec::with_capacity(width);
        for position in 0..width {
            let old = old_key.get(position).and_then(Option::as_ref);
            let new = new_key.get(position).and_then(Option::as_ref);
            subs.push(self.plan_at(position, id, old, new)?);
        }
        self.pending = Some(CompositePlan {
            id,
            subs,
            key: new_key,
        });
        Ok(())
    }

    fn conflicting_holder(&self) -> CoreResult<Option<(EntityId, String)>> {
        let Some(plan) = &self.pending else {
            return Ok(None);
        };
        if plan.key.iter().all(Option::is_none) {
            return Ok(None);
        }
        for holder in self.exact(&plan.key).cursor() {
            let holder = holder?;
            if holder != plan.id {
                return Ok(Some((holder, format!("{:?}", plan.key))));
            }
        }
        Ok(None)
    }

    fn commit(&mut self, changes: &mut ChangeSet) -> CoreResult<()> {
        let Some(plan) = self.pending.take() else {
            return Ok(());
        };
        self.grow_to(plan.subs.len());
        for (sub, sub_plan) in self.subs.iter_mut().zip(plan.subs) {
            match (sub, sub_plan) {
                (Sub::Hashing(table), SubPlan::Hashing(plan)) => table.commit(plan, changes)?,
                (Sub::Binary(slices), SubPlan::Binary(plan)) => slices.commit(plan, changes)?,
                _ => {
                    return Err(CoreError::unsupported(format!(
                        "composite index '{}' mixes sub-index kinds",
                        self.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.pending = None;
    }

    fn remove_all(&mut self, changes: &mut ChangeSet) {
        for sub in &mut self.subs {
            sub.remove_all(changes);
        }
    }

    fn entry_count(&self) -> usize {
        self.subs.iter().map(Sub::entry_count).sum()
    }

    fn bitmaps_mut(&mut self) -> Vec<&mut BitmapEntry> {
        self.subs.iter_mut().flat_map(Sub::bitmaps_mut).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CompositeIs<E, I: CompositeIndexer<E>> {
    index: IndexId,
    name: Arc<str>,
    sample: Vec<Option<I::Component>>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: CompositeIndexer<E>> ConditionLeaf<E> for CompositeIs<E, I> {
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        let index = ctx.index::<CompositeIndex<E, I>>(self.index, &self.name)?;
        Ok(index.query(&self.sample, ctx.live()))
    }

    fn describe(&self) -> String {
        format!("{} is {:?}", self.name, self.sample)
    }
}

impl<E: 'static, I: CompositeIndexer<E>> IndexHandle<CompositeIndex<E, I>> {
    /// Entities matching every present component of `sample`.
    pub fn is(&self, sample: impl IntoIterator<Item = Option<I::Component>>) -> Condition<E> {
        Condition::leaf(CompositeIs::<E, I> {
            index: self.id(),
            name: self.shared_name(),
            sample: sample.into_iter().collect(),
            _marker: PhantomData,
        })
    }
}
