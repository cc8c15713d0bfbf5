//! Hashing indices: one bitmap entry per distinct key.

use super::registry::IndexMaintainer;
use super::traits::{HashingIndexer, IndexKind};
use super::transition::{EntryHandle, Transition};
use super::IndexHandle;
use crate::bitmap::{BitmapEntry, BitmapResult};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::query::{Condition, ConditionLeaf, QueryContext};
use crate::state::{ChangeSet, NodeId};
use crate::types::{BitmapOwner, IndexId};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Key → bitmap entry table in insertion order.
///
/// Entry positions are stable for the lifetime of the table, so they double
/// as the `entry` part of each bitmap's owner.
pub(crate) struct KeyTable<K> {
    entries: Vec<(K, BitmapEntry)>,
    lookup: HashMap<K, usize>,
    index: IndexId,
    sub: u32,
    exponent: u32,
}

impl<K: Eq + Hash + Clone + Debug> KeyTable<K> {
    pub(crate) fn new(index: IndexId, sub: u32, exponent: u32) -> Self {
        Self {
            entries: Vec::new(),
            lookup: HashMap::new(),
            index,
            sub,
            exponent,
        }
    }

    pub(crate) fn position(&self, key: &K) -> Option<usize> {
        self.lookup.get(key).copied()
    }

    pub(crate) fn plan(&self, id: EntityId, old: &[K], new: &[K]) -> Transition<K> {
        Transition::plan(id, old, new, |key| self.position(key))
    }

    /// Applies a plan: removals strictly before insertions.
    pub(crate) fn commit(&mut self, plan: Transition<K>, changes: &mut ChangeSet) -> CoreResult<()> {
        let id = plan.id;
        for handle in plan.removals {
            match handle {
                EntryHandle::Null => {}
                EntryHandle::Existing(position) => {
                    self.entries[position].1.remove(id, changes)?;
                }
                EntryHandle::Pending(key) => {
                    return Err(CoreError::unsupported(format!(
                        "cannot remove entity {} through key {:?}, which has no entry yet",
                        id, key
                    )));
                }
            }
        }
        for handle in plan.targets {
            let position = match handle {
                EntryHandle::Null => continue,
                EntryHandle::Existing(position) => position,
                EntryHandle::Pending(key) => self.materialize(key, changes),
            };
            self.entries[position].1.add(id, changes)?;
        }
        Ok(())
    }

    fn materialize(&mut self, key: K, changes: &mut ChangeSet) -> usize {
        if let Some(position) = self.position(&key) {
            return position;
        }
        let position = self.entries.len();
        let owner = BitmapOwner::new(self.index, self.sub, position as u32);
        let entry = BitmapEntry::new(owner, self.exponent, changes);
        changes.mark_changed(NodeId::Index(self.index));
        self.lookup.insert(key.clone(), position);
        self.entries.push((key, entry));
        position
    }

    /// Finds an entity other than the planned one holding a planned key.
    pub(crate) fn conflicting_holder(&self, plan: &Transition<K>) -> CoreResult<Option<(EntityId, K)>> {
        for position in plan.targets.iter().filter_map(EntryHandle::position) {
            let (key, entry) = &self.entries[position];
            if let Some(other) = entry.bits().first_other_than(Some(plan.id.as_u64()))? {
                return Ok(Some((EntityId::new(other), key.clone())));
            }
        }
        Ok(None)
    }

    pub(crate) fn query(&self, key: &K) -> BitmapResult<'_> {
        match self.position(key) {
            Some(position) => self.entries[position].1.result(),
            None => BitmapResult::Empty,
        }
    }

    pub(crate) fn search(&self, predicate: impl Fn(&K) -> bool) -> BitmapResult<'_> {
        BitmapResult::or(
            self.entries
                .iter()
                .filter(|(key, _)| predicate(key))
                .map(|(_, entry)| entry.result())
                .collect(),
        )
    }

    /// Union of every entry.
    pub(crate) fn any(&self) -> BitmapResult<'_> {
        BitmapResult::or(self.entries.iter().map(|(_, entry)| entry.result()).collect())
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&K, &BitmapEntry)> {
        self.entries.iter().map(|(key, entry)| (key, entry))
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn remove_all(&mut self, changes: &mut ChangeSet) {
        for (_, entry) in &mut self.entries {
            entry.remove_all(changes);
            entry.forget_changes(changes);
        }
        self.entries.clear();
        self.lookup.clear();
        changes.mark_changed(NodeId::Index(self.index));
    }

    pub(crate) fn bitmaps_mut(&mut self) -> impl Iterator<Item = &mut BitmapEntry> {
        self.entries.iter_mut().map(|(_, entry)| entry)
    }
}

/// An index with one bitmap per distinct key.
pub struct HashingIndex<E, I: HashingIndexer<E>> {
    id: IndexId,
    name: String,
    indexer: I,
    table: KeyTable<I::Key>,
    pending: Option<Transition<I::Key>>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: HashingIndexer<E>> HashingIndex<E, I> {
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

    /// Entities indexed under `key`.
    pub fn query(&self, key: &I::Key) -> BitmapResult<'_> {
        self.table.query(key)
    }

    /// Union of all entries whose key matches the predicate.
    pub fn search(&self, predicate: impl Fn(&I::Key) -> bool) -> BitmapResult<'_> {
        self.table.search(predicate)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<I::Key> {
        self.table.keys().cloned().collect()
    }

    /// Keys with their entries, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&I::Key, &BitmapEntry)> {
        self.table.entries()
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.table.entry_count()
    }

    fn keys_of(&self, entity: Option<&E>) -> Vec<I::Key> {
        let mut keys = Vec::new();
        if let Some(entity) = entity {
            self.indexer.index_multi(entity, &mut keys);
        }
        keys
    }
}

impl<E: 'static, I: HashingIndexer<E>> IndexMaintainer<E> for HashingIndex<E, I> {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hashing
    }

    fn prepare(&mut self, id: EntityId, old: Option<&E>, new: Option<&E>) -> CoreResult<()> {
        let old = self.keys_of(old);
        let new = self.keys_of(new);
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
            .map(|(other, key)| (other, format!("{:?}", key))))
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

struct HashingIs<E, I: HashingIndexer<E>> {
    index: IndexId,
    name: Arc<str>,
    keys: Vec<I::Key>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: HashingIndexer<E>> ConditionLeaf<E> for HashingIs<E, I> {
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        let index = ctx.index::<HashingIndex<E, I>>(self.index, &self.name)?;
        Ok(BitmapResult::or(
            self.keys.iter().map(|key| index.query(key)).collect(),
        ))
    }

    fn describe(&self) -> String {
        format!("{} in {:?}", self.name, self.keys)
    }
}

type KeyPredicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

struct HashingSearch<E, I: HashingIndexer<E>> {
    index: IndexId,
    name: Arc<str>,
    predicate: KeyPredicate<I::Key>,
    _marker: PhantomData<fn(&E)>,
}

impl<E: 'static, I: HashingIndexer<E>> ConditionLeaf<E> for HashingSearch<E, I> {
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        let index = ctx.index::<HashingIndex<E, I>>(self.index, &self.name)?;
        Ok(index.search(|key| (self.predicate)(key)))
    }

    fn describe(&self) -> String {
        format!("{} matches <predicate>", self.name)
    }
}

impl<E: 'static, I: HashingIndexer<E>> IndexHandle<HashingIndex<E, I>> {
    /// Entities whose key equals `key`.
    pub fn is(&self, key: I::Key) -> Condition<E> {
        self.is_any([key])
    }

    /// Entities whose key is any of `keys`.
    pub fn is_any(&self, keys: impl IntoIterator<Item = I::Key>) -> Condition<E> {
        Condition::leaf(HashingIs::<E, I> {
            index: self.id(),
            name: self.shared_name(),
            keys: keys.into_iter().collect(),
            _marker: PhantomData,
        })
    }

    /// Entities whose key satisfies the predicate.
    ///
    /// Evaluated by scanning every key of the index once.
    pub fn search(&self, predicate: impl Fn(&I::Key) -> bool + Send + Sync + 'static) -> Condition<E> {
        Condition::leaf(HashingSearch::<E, I> {
            index: self.id(),
            name: self.shared_name(),
            predicate: Arc::new(predicate),
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::traits::HashingFn;

    fn index() -> HashingIndex<String, impl HashingIndexer<String, Key = usize>> {
        HashingIndex::new(IndexId::new(0), HashingFn::new("len", |s: &String| s.len()), 2)
    }

    fn apply<X: IndexMaintainer<String>>(
        index: &mut X,
        id: u64,
        old: Option<&str>,
        new: Option<&str>,
        changes: &mut ChangeSet,
    ) {
        let old = old.map(str::to_string);
        let new = new.map(str::to_string);
        index
            .prepare(EntityId::new(id), old.as_ref(), new.as_ref())
            .unwrap();
        index.commit(changes).unwrap();
    }

    fn ids(result: BitmapResult<'_>) -> Vec<u64> {
        result.cursor().map(|id| id.unwrap().as_u64()).collect()
    }

    #[test]
    fn entries_are_created_on_commit() {
        let mut index = index();
        let mut changes = ChangeSet::new();
        index
            .prepare(EntityId::new(0), None, Some(&"abc".to_string()))
            .unwrap();
        assert_eq!(index.entry_count(), 0);
        index.abort();
        index.commit(&mut changes).unwrap();
        assert_eq!(index.entry_count(), 0);

        apply(&mut index, 0, None, Some("abc"), &mut changes);
        apply(&mut index, 1, None, Some("xy"), &mut changes);
        apply(&mut index, 2, None, Some("def"), &mut changes);
        assert_eq!(index.keys(), vec![3, 2]);
        assert_eq!(ids(index.query(&3)), vec![0, 2]);
        assert!(index.query(&9).is_empty_sentinel());
        assert!(changes.is_instance_new_or_changed(&NodeId::Index(IndexId::new(0))));
    }

    #[test]
    fn replace_moves_between_entries() {
        let mut index = index();
        let mut changes = ChangeSet::new();
        apply(&mut index, 0, None, Some("abc"), &mut changes);
        apply(&mut index, 0, Some("abc"), Some("a"), &mut changes);
        assert!(ids(index.query(&3)).is_empty());
        assert_eq!(ids(index.query(&1)), vec![0]);

        apply(&mut index, 0, Some("a"), None, &mut changes);
        assert!(ids(index.query(&1)).is_empty());
    }

    #[test]
    fn conflicting_holder_ignores_the_entity_itself() {
        let mut index = index();
        let mut changes = ChangeSet::new();
        apply(&mut index, 0, None, Some("abc"), &mut changes);

        index
            .prepare(EntityId::new(0), Some(&"abc".into()), Some(&"xyz".into()))
            .unwrap();
        assert!(index.conflicting_holder().unwrap().is_none());
        index.abort();

        index
            .prepare(EntityId::new(1), None, Some(&"xyz".into()))
            .unwrap();
        let (other, key) = index.conflicting_holder().unwrap().unwrap();
        assert_eq!(other, EntityId::new(0));
        assert_eq!(key, "3");
    }

    #[test]
    fn search_ors_matching_entries() {
        let mut index = index();
        let mut changes = ChangeSet::new();
        for (id, value) in ["a", "bb", "ccc", "dddd"].iter().enumerate() {
            apply(&mut index, id as u64, None, Some(*value), &mut changes);
        }
        assert_eq!(ids(index.search(|len| len % 2 == 0)), vec![1, 3]);
        assert!(index.search(|len| *len > 10).is_empty_sentinel());
    }

    #[test]
    fn multi_value_keys_are_removed_once() {
        struct Chars;
        impl HashingIndexer<String> for Chars {
            type Key = char;
            fn index(&self, entity: &String) -> char {
                entity.chars().next().unwrap_or(' ')
            }
            fn index_multi(&self, entity: &String, keys: &mut Vec<char>) {
                keys.extend(entity.chars());
            }
        }

        let mut index = HashingIndex::new(IndexId::new(1), Chars, 2);
        let mut changes = ChangeSet::new();
        apply(&mut index, 5, None, Some("aab"), &mut changes);
        assert_eq!(ids(index.query(&'a')), vec![5]);

        apply(&mut index, 5, Some("aab"), Some("ac"), &mut changes);
        assert_eq!(ids(index.query(&'a')), vec![5]);
        assert!(ids(index.query(&'b')).is_empty());
        assert_eq!(ids(index.query(&'c')), vec![5]);
    }

    #[test]
    fn remove_all_drops_entries() {
        let mut index = index();
        let mut changes = ChangeSet::new();
        apply(&mut index, 0, None, Some("abc"), &mut changes);
        IndexMaintainer::remove_all(&mut index, &mut changes);
        assert_eq!(index.entry_count(), 0);
        assert!(index.query(&3).is_empty_sentinel());
    }
}
