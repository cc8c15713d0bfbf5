//! The map facade.

use crate::bitmap::{BitmapEntry, BitmapResult};
use crate::config::GigaMapConfig;
use crate::constraint::{CustomConstraint, CustomConstraints, UniqueConstraints};
use crate::entity::{EntityCodec, EntityId, EntityStore};
use crate::error::{AnyEntity, CoreError, CoreResult};
use crate::index::{
    BinaryIndex, BinaryIndexer, BooleanIndex, BooleanIndexer, CompositeIndex, CompositeIndexer,
    HashingIndex, HashingIndexer, IndexHandle, IndexMaintainer, IndexRegistry,
};
use crate::persistence::{self, Loaders, StoreReport};
use crate::query::{partition, scan, Condition, IterationThreadProvider, QueryContext, Task};
use crate::state::{ChangeSet, NodeId, StateFlags};
use crate::stats::GigaMapStats;
use crate::types::{BitmapOwner, IndexId};
use gigamap_storage::SegmentStore;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Everything guarded by the collection lock.
struct MapState<E> {
    store: EntityStore<E>,
    live: BitmapEntry,
    indices: IndexRegistry<E>,
    unique: UniqueConstraints,
    custom: CustomConstraints<E>,
    changes: ChangeSet,
}

impl<E: Send + Sync + 'static> MapState<E> {
    /// Plans a move in every index and validates the constraints.
    ///
    /// On success every index holds a pending plan; on failure none does.
    fn prepare(
        &mut self,
        id: EntityId,
        old: Option<&E>,
        new: Option<&E>,
        stats: &GigaMapStats,
    ) -> CoreResult<()> {
        self.indices.prepare_all(id, old, new)?;
        let Some(entity) = new else {
            return Ok(());
        };
        let checked = self
            .unique
            .check(&self.indices, id)
            .and_then(|()| self.custom.check(id, old, entity));
        if let Err(err) = checked {
            self.indices.abort_all();
            if err.is_constraint_violation() {
                stats.record_constraint_violation();
            }
            return Err(err);
        }
        Ok(())
    }

    fn context(&self) -> QueryContext<'_, E> {
        QueryContext::new(&self.indices, self.live.bits())
    }

    fn evaluate<'a>(&'a self, condition: &Condition<E>) -> CoreResult<BitmapResult<'a>> {
        condition.evaluate(&self.context())
    }
}

struct Shared<E> {
    state: RwLock<MapState<E>>,
    config: GigaMapConfig,
    stats: Arc<GigaMapStats>,
}

/// An indexed collection of entities.
///
/// Entities are stored under sequential [`EntityId`]s that are never
/// reused. Registered indices are kept up to date on every mutation, and
/// constraints are checked before anything changes: a rejected mutation
/// leaves the collection and every index as they were.
///
/// All structural access goes through one reader/writer lock. Mutations
/// take it exclusively; reads share it. Hold a [`MapReader`] to run several
/// reads against one consistent state.
///
/// `GigaMap` is a cheap handle: clones share the same collection.
///
/// # Example
///
/// ```rust
/// use gigamap_core::{GigaMap, HashingFn};
///
/// let map = GigaMap::new();
/// let by_len = map
///     .add_hashing_index(HashingFn::new("len", |s: &String| s.len()))
///     .unwrap();
///
/// map.add("one".to_string()).unwrap();
/// map.add("three".to_string()).unwrap();
/// map.add("two".to_string()).unwrap();
///
/// assert_eq!(map.query(by_len.is(3)).count().unwrap(), 2);
/// ```
pub struct GigaMap<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for GigaMap<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Send + Sync + 'static> Default for GigaMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + 'static> GigaMap<E> {
    /// Creates an empty map with the default geometry.
    #[must_use]
    pub fn new() -> Self {
        Self::build(GigaMapConfig::default())
    }

    /// Creates an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if the geometry is invalid.
    pub fn with_config(config: GigaMapConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: GigaMapConfig) -> Self {
        let mut changes = ChangeSet::new();
        changes.mark_new(NodeId::Map);
        changes.mark_new(NodeId::EntityLevel3);
        let live = BitmapEntry::new(BitmapOwner::live(), config.bitmap_block_exponent, &mut changes);
        let state = MapState {
            store: EntityStore::new(config.clone()),
            live,
            indices: IndexRegistry::new(),
            unique: UniqueConstraints::new(),
            custom: CustomConstraints::new(),
            changes,
        };
        tracing::debug!(
            level1 = config.level1_len(),
            level2 = config.level2_len(),
            max_entities = config.max_entities(),
            "created map"
        );
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                config,
                stats: Arc::new(GigaMapStats::new()),
            }),
        }
    }

    /// The map's geometry.
    #[must_use]
    pub fn config(&self) -> &GigaMapConfig {
        &self.shared.config
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> &GigaMapStats {
        &self.shared.stats
    }

    /// Number of stored entities.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.state.read().store.size()
    }

    /// Checks if no entity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Takes the collection lock for reading.
    ///
    /// Mutations on any clone of this map block until the reader is dropped.
    pub fn read(&self) -> MapReader<'_, E> {
        MapReader {
            state: self.shared.state.read(),
            stats: &self.shared.stats,
        }
    }

    /// Returns the entity stored under `id`.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn get(&self, id: EntityId) -> CoreResult<Option<Arc<E>>> {
        self.shared.state.read().store.get(id)
    }

    /// Stores an entity under the next ID and indexes it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConstraintViolation`] if a constraint rejects
    /// the entity, [`CoreError::InvalidConfiguration`] if an index cannot
    /// store its key, or [`CoreError::CapacityExceeded`] once the geometry
    /// is full. Nothing changes in any of these cases. A violation carries
    /// the rejected entity, see [`CoreError::offending_entity`].
    pub fn add(&self, entity: E) -> CoreResult<EntityId> {
        let mut guard = self.shared.state.write();
        self.add_locked(&mut guard, entity)
    }

    /// Adds entities under one hold of the collection lock, stopping at the
    /// first failure.
    ///
    /// The added entities get consecutive IDs: no other writer can interleave
    /// with the batch. Entities added before a failure stay. Returns the ID
    /// of the first added entity, if any.
    ///
    /// # Errors
    ///
    /// Returns the error of the first rejected entity.
    pub fn add_all(&self, entities: impl IntoIterator<Item = E>) -> CoreResult<Option<EntityId>> {
        let mut guard = self.shared.state.write();
        let mut first = None;
        let mut added = 0u64;
        for entity in entities {
            let id = self.add_locked(&mut guard, entity)?;
            first.get_or_insert(id);
            added += 1;
        }
        tracing::trace!(added, first = ?first, "added batch");
        Ok(first)
    }

    /// One add, with the write lock already held.
    fn add_locked(&self, state: &mut MapState<E>, entity: E) -> CoreResult<EntityId> {
        let entity = Arc::new(entity);
        let id = state.store.next_id();
        let max_entities = self.shared.config.max_entities();
        if id.as_u64() >= max_entities {
            return Err(CoreError::CapacityExceeded {
                entity_id: id,
                max_entities,
            });
        }

        if let Err(err) = state.prepare(id, None, Some(&*entity), &self.shared.stats) {
            return Err(err.with_entities(None, entity));
        }
        state.indices.commit_all(&mut state.changes)?;
        let stored = state.store.add(entity, &mut state.changes)?;
        state.live.add(stored, &mut state.changes)?;
        self.shared.stats.record_add();
        Ok(stored)
    }

    /// Replaces the entity under `id`, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if nothing is stored under
    /// `id`, or [`CoreError::ConstraintViolation`] if a constraint rejects
    /// the new entity, in which case the old entity stays in place and
    /// every index still holds its keys. The violation carries both the
    /// stored and the rejected entity.
    pub fn replace(&self, id: EntityId, entity: E) -> CoreResult<Arc<E>> {
        let entity = Arc::new(entity);
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let old = state
            .store
            .get(id)?
            .ok_or(CoreError::EntityNotFound { entity_id: id })?;

        if let Err(err) = state.prepare(id, Some(&*old), Some(&*entity), &self.shared.stats) {
            return Err(err.with_entities(Some(old as AnyEntity), entity));
        }
        state.indices.commit_all(&mut state.changes)?;
        let previous = state.store.replace(id, entity, &mut state.changes)?;
        self.shared.stats.record_replace();
        Ok(previous)
    }

    /// Removes the entity under `id`. Its ID is never issued again.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn remove(&self, id: EntityId) -> CoreResult<Option<Arc<E>>> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let Some(old) = state.store.get(id)? else {
            return Ok(None);
        };

        state.prepare(id, Some(&*old), None, &self.shared.stats)?;
        state.indices.commit_all(&mut state.changes)?;
        let removed = state.store.remove(id, &mut state.changes)?;
        state.live.remove(id, &mut state.changes)?;
        self.shared.stats.record_removes(1);
        Ok(removed)
    }

    /// Removes every entity. Indices and constraints stay registered.
    pub fn remove_all(&self) {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let removed = state.store.size();
        state.indices.remove_all(&mut state.changes);
        state.store.remove_all(&mut state.changes);
        state.live.remove_all(&mut state.changes);
        self.shared.stats.record_removes(removed);
        tracing::debug!(removed, "removed all entities");
    }

    /// Whether adding `entity` would pass every index and constraint.
    ///
    /// Nothing is changed either way.
    ///
    /// # Errors
    ///
    /// Returns errors other than constraint violations, such as keys an
    /// index cannot store.
    pub fn check_add(&self, entity: &E) -> CoreResult<bool> {
        let mut guard = self.shared.state.write();
        let id = guard.store.next_id();
        self.check(&mut guard, id, None, entity)
    }

    /// Whether replacing the entity under `id` with `entity` would pass
    /// every index and constraint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if nothing is stored under `id`.
    pub fn check_replace(&self, id: EntityId, entity: &E) -> CoreResult<bool> {
        let mut guard = self.shared.state.write();
        let old = guard
            .store
            .get(id)?
            .ok_or(CoreError::EntityNotFound { entity_id: id })?;
        self.check(&mut guard, id, Some(&*old), entity)
    }

    fn check(&self, state: &mut MapState<E>, id: EntityId, old: Option<&E>, entity: &E) -> CoreResult<bool> {
        match state.prepare(id, old, Some(entity), &self.shared.stats) {
            Ok(()) => {
                state.indices.abort_all();
                Ok(true)
            }
            Err(err) if err.is_constraint_violation() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Registers a hashing index and indexes every stored entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn add_hashing_index<I: HashingIndexer<E>>(
        &self,
        indexer: I,
    ) -> CoreResult<IndexHandle<HashingIndex<E, I>>> {
        self.register(|id, exponent| Ok(HashingIndex::new(id, indexer, exponent)))
    }

    /// Registers a binary index and indexes every stored entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken, or
    /// [`CoreError::InvalidConfiguration`] if a stored entity has a key the
    /// index cannot store.
    pub fn add_binary_index<I: BinaryIndexer<E>>(
        &self,
        indexer: I,
    ) -> CoreResult<IndexHandle<BinaryIndex<E, I>>> {
        self.register(|id, exponent| Ok(BinaryIndex::new(id, indexer, exponent)))
    }

    /// Registers a composite index and indexes every stored entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for a zero width or a
    /// stored entity with an oversized key, or [`CoreError::DuplicateName`].
    pub fn add_composite_index<I: CompositeIndexer<E>>(
        &self,
        indexer: I,
    ) -> CoreResult<IndexHandle<CompositeIndex<E, I>>> {
        self.register(|id, exponent| CompositeIndex::new(id, indexer, exponent))
    }

    /// Registers a boolean index and indexes every stored entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn add_boolean_index<I: BooleanIndexer<E>>(
        &self,
        indexer: I,
    ) -> CoreResult<IndexHandle<BooleanIndex<E, I>>> {
        self.register(|id, exponent| Ok(BooleanIndex::new(id, indexer, exponent)))
    }

    fn register<X: IndexMaintainer<E> + 'static>(
        &self,
        build: impl FnOnce(IndexId, u32) -> CoreResult<X>,
    ) -> CoreResult<IndexHandle<X>> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let id = state.indices.next_id();
        let mut index = build(id, self.shared.config.bitmap_block_exponent)?;
        state.indices.ensure_unused(index.name())?;

        let changes = &mut state.changes;
        let populated = state.store.for_each(|entity_id, entity| {
            index.prepare(entity_id, None, Some(&**entity))?;
            index.commit(changes)
        });
        if let Err(err) = populated {
            index.abort();
            forget_index(changes, id);
            return Err(err);
        }

        let handle = IndexHandle::new(id, index.name());
        state.indices.register(Box::new(index), &mut state.changes)?;
        Ok(handle)
    }

    /// Unregisters an index, and its unique constraint if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if no index has the name.
    pub fn remove_index(&self, name: &str) -> CoreResult<()> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let removed = state
            .indices
            .remove(name, &mut state.changes)
            .ok_or_else(|| CoreError::index_not_found(name))?;
        state.unique.remove(removed.id());
        Ok(())
    }

    /// Names of the registered indices, in registration order.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.shared.state.read().indices.names()
    }

    /// Declares that every key of the index is held by one entity at most.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if the index was removed,
    /// [`CoreError::DuplicateName`] if it is already unique, or
    /// [`CoreError::ConstraintViolation`] if stored entities already share
    /// a key; the constraint is not registered in that case.
    pub fn add_unique_constraint<X>(&self, index: &IndexHandle<X>) -> CoreResult<()> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        if state.unique.contains(index.id()) {
            return Err(CoreError::duplicate_name("unique constraint", index.name()));
        }
        let maintainer = state
            .indices
            .get_mut(index.id())
            .ok_or_else(|| CoreError::index_not_found(index.name()))?;
        let name = maintainer.name().to_string();

        let validated = state.store.for_each(|entity_id, entity| {
            maintainer.prepare(entity_id, None, Some(&**entity))?;
            let conflict = maintainer.conflicting_holder();
            maintainer.abort();
            match conflict? {
                Some((holder, key)) => Err(CoreError::constraint_violation(
                    name.as_str(),
                    entity_id,
                    format!("key {} is already held by entity {}", key, holder),
                )),
                None => Ok(()),
            }
        });
        if let Err(err) = validated {
            if err.is_constraint_violation() {
                self.shared.stats.record_constraint_violation();
            }
            return Err(err);
        }
        state.unique.add(index.id(), &name)?;
        tracing::debug!(index = %index.id(), name = %name, "added unique constraint");
        Ok(())
    }

    /// Drops the unique constraint of an index. Returns whether one existed.
    pub fn remove_unique_constraint<X>(&self, index: &IndexHandle<X>) -> bool {
        self.shared.state.write().unique.remove(index.id())
    }

    /// Registers a custom constraint after validating every stored entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken, or
    /// [`CoreError::ConstraintViolation`] if a stored entity fails it; the
    /// constraint is not registered in that case.
    pub fn add_custom_constraint(&self, constraint: impl CustomConstraint<E>) -> CoreResult<()> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let name = constraint.name();
        state.custom.add(Box::new(constraint))?;

        let custom = &state.custom;
        let validated = state
            .store
            .for_each(|entity_id, entity| custom.check_named(&name, entity_id, None, entity));
        if let Err(err) = validated {
            state.custom.remove(&name);
            if err.is_constraint_violation() {
                self.shared.stats.record_constraint_violation();
            }
            return Err(err);
        }
        tracing::debug!(name = %name, "added custom constraint");
        Ok(())
    }

    /// Unregisters a custom constraint. Returns whether it existed.
    pub fn remove_custom_constraint(&self, name: &str) -> bool {
        self.shared.state.write().custom.remove(name)
    }

    /// Names of all constraints: unique ones first, then custom ones.
    #[must_use]
    pub fn constraint_names(&self) -> Vec<String> {
        let state = self.shared.state.read();
        state
            .unique
            .names()
            .into_iter()
            .chain(state.custom.names())
            .map(str::to_string)
            .collect()
    }

    /// Starts a query.
    pub fn query(&self, condition: Condition<E>) -> Query<'_, E> {
        Query {
            map: self,
            condition,
        }
    }

    /// Nodes changed since the last store cycle, with their flags.
    #[must_use]
    pub fn dirty_nodes(&self) -> Vec<(NodeId, StateFlags)> {
        self.shared.state.read().changes.dirty_nodes()
    }
}

impl<E: EntityCodec + Send + Sync + 'static> GigaMap<E> {
    /// Writes every new or changed segment to `target`.
    ///
    /// Afterwards the change-set is empty and no segment is pinned as
    /// dirty, so [`Self::evict_unused`] can drop them from memory.
    ///
    /// # Errors
    ///
    /// Returns storage and codec errors. The change-set is kept, so the
    /// next call retries the same segments.
    pub fn store_to(&self, target: &dyn SegmentStore) -> CoreResult<StoreReport> {
        let mut guard = self.shared.state.write();
        let MapState {
            store,
            live,
            indices,
            changes,
            ..
        } = &mut *guard;
        let mut bitmaps = vec![live];
        bitmaps.extend(indices.bitmaps_mut());
        let report = persistence::store(
            store,
            bitmaps,
            changes,
            target,
            self.shared.config.compress_on_store,
        )?;
        self.shared.stats.record_segments_stored(report.segments_written());
        Ok(report)
    }

    /// Drops every stored, clean segment from memory.
    ///
    /// `source` must be the store the segments were written to; reads load
    /// them back from it. Returns how many segments were evicted.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn evict_unused(&self, source: Arc<dyn SegmentStore>) -> CoreResult<u64> {
        let loaders = Loaders::new(source, Arc::clone(&self.shared.stats), &self.shared.config);
        let mut guard = self.shared.state.write();
        let MapState {
            store,
            live,
            indices,
            ..
        } = &mut *guard;
        let mut bitmaps = vec![live];
        bitmaps.extend(indices.bitmaps_mut());
        let evicted = persistence::evict(store, bitmaps, &loaders)?;
        self.shared.stats.record_segments_evicted(evicted);
        Ok(evicted)
    }
}

fn forget_index(changes: &mut ChangeSet, id: IndexId) {
    changes.forget_where(|node| match node {
        NodeId::Index(index) => *index == id,
        NodeId::BitmapEntry(owner) | NodeId::BitmapSegment { owner, .. } => owner.index == id,
        _ => false,
    });
}

impl<E> fmt::Debug for GigaMap<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("GigaMap")
            .field("store", &state.store)
            .field("indices", &state.indices)
            .field("unique", &state.unique)
            .finish()
    }
}

/// A read guard over a map.
///
/// Everything read through one reader observes the same state.
pub struct MapReader<'m, E> {
    state: RwLockReadGuard<'m, MapState<E>>,
    stats: &'m GigaMapStats,
}

impl<'m, E: Send + Sync + 'static> MapReader<'m, E> {
    /// Number of stored entities.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.store.size()
    }

    /// Returns the entity stored under `id`.
    ///
    /// # Errors
    ///
    /// Propagates segment load errors.
    pub fn get(&self, id: EntityId) -> CoreResult<Option<Arc<E>>> {
        self.state.store.get(id)
    }

    /// The index behind a handle, for direct lookups.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if the index was removed.
    pub fn index<X: 'static>(&self, handle: &IndexHandle<X>) -> CoreResult<&X> {
        self.state.context().index::<X>(handle.id(), handle.name())
    }

    /// Names of the registered indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.state.indices.names()
    }

    /// IDs of every stored entity.
    #[must_use]
    pub fn live_ids(&self) -> BitmapResult<'_> {
        self.state.live.result()
    }

    /// Resolves a condition to a lazy bitmap result.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if the condition refers to a
    /// removed index.
    pub fn evaluate(&self, condition: &Condition<E>) -> CoreResult<BitmapResult<'_>> {
        self.stats.record_query();
        self.state.evaluate(condition)
    }

    /// Number of entities matching a condition.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn count(&self, condition: &Condition<E>) -> CoreResult<u64> {
        self.evaluate(condition)?.count()
    }

    /// Visits matching entities in ID order until `visit` breaks.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn for_each(
        &self,
        condition: &Condition<E>,
        visit: impl FnMut(EntityId, &Arc<E>) -> ControlFlow<()>,
    ) -> CoreResult<ControlFlow<()>> {
        let result = self.evaluate(condition)?;
        scan(&result, &self.state.store, 0..result.block_count(), visit)
    }
}

/// A condition bound to a map, ready to run.
pub struct Query<'m, E> {
    map: &'m GigaMap<E>,
    condition: Condition<E>,
}

impl<'m, E: Send + Sync + 'static> Query<'m, E> {
    /// Number of matching entities.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn count(&self) -> CoreResult<u64> {
        self.map.read().count(&self.condition)
    }

    /// Checks if any entity matches. Stops at the first match.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn exists(&self) -> CoreResult<bool> {
        Ok(self.first()?.is_some())
    }

    /// The matching entity with the lowest ID.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn first(&self) -> CoreResult<Option<(EntityId, Arc<E>)>> {
        let mut first = None;
        self.map.read().for_each(&self.condition, |id, entity| {
            first = Some((id, Arc::clone(entity)));
            ControlFlow::Break(())
        })?;
        Ok(first)
    }

    /// IDs of the matching entities, ascending.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn ids(&self) -> CoreResult<Vec<EntityId>> {
        let mut ids = Vec::new();
        self.for_each(|id, _| ids.push(id))?;
        Ok(ids)
    }

    /// The matching entities in ID order.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn to_vec(&self) -> CoreResult<Vec<Arc<E>>> {
        let mut entities = Vec::new();
        self.for_each(|_, entity| entities.push(Arc::clone(entity)))?;
        Ok(entities)
    }

    /// Visits every matching entity in ID order.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors.
    pub fn for_each(&self, mut visit: impl FnMut(EntityId, &Arc<E>)) -> CoreResult<()> {
        self.map.read().for_each(&self.condition, |id, entity| {
            visit(id, entity);
            ControlFlow::Continue(())
        })?;
        Ok(())
    }

    /// Collects the matching entities, scanning with `provider`'s threads.
    ///
    /// The result is in ID order regardless of how the work was split.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors, and worker failures.
    pub fn to_vec_with(self, provider: &IterationThreadProvider) -> CoreResult<Vec<Arc<E>>> {
        self.run_parallel(provider, |_, entity| Some(Arc::clone(entity)))
    }

    /// Hands every matching entity to `consumer`, from `provider`'s threads.
    ///
    /// Calls may arrive concurrently and in any order.
    ///
    /// # Errors
    ///
    /// Propagates evaluation and segment load errors, and worker failures.
    pub fn for_each_with<F>(self, provider: &IterationThreadProvider, consumer: F) -> CoreResult<()>
    where
        F: Fn(EntityId, &Arc<E>) + Send + Sync + 'static,
    {
        self.run_parallel(provider, move |id, entity| {
            consumer(id, entity);
            None::<()>
        })
        .map(drop)
    }

    /// Splits the result's blocks across tasks.
    ///
    /// The caller keeps the read lock for the whole run; workers re-enter
    /// it recursively, so every task evaluates the same state.
    fn run_parallel<R, F>(self, provider: &IterationThreadProvider, visit: F) -> CoreResult<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(EntityId, &Arc<E>) -> Option<R> + Send + Sync + 'static,
    {
        let Query { map, condition } = self;
        let shared = Arc::clone(&map.shared);
        let guard = shared.state.read();
        let blocks = guard.evaluate(&condition)?.block_count();
        let ranges = partition(blocks, provider.thread_count(blocks));
        shared.stats.record_query();
        if ranges.len() > 1 {
            shared.stats.record_parallel_query();
        }
        tracing::trace!(blocks, tasks = ranges.len(), condition = %condition, "parallel scan");

        let condition = Arc::new(condition);
        let visit = Arc::new(visit);
        let found: Arc<Mutex<Vec<(usize, Vec<R>)>>> = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<Task> = ranges
            .into_iter()
            .enumerate()
            .map(|(part, range)| {
                let shared = Arc::clone(&shared);
                let condition = Arc::clone(&condition);
                let visit = Arc::clone(&visit);
                let found = Arc::clone(&found);
                Box::new(move || {
                    let state = shared.state.read_recursive();
                    let result = state.evaluate(&condition)?;
                    let mut local = Vec::new();
                    scan(&result, &state.store, range, |id, entity| {
                        local.extend((*visit)(id, entity));
                        ControlFlow::Continue(())
                    })?;
                    found.lock().push((part, local));
                    Ok(())
                }) as Task
            })
            .collect();

        let outcome = provider.execute(tasks);
        drop(guard);
        outcome?;

        let mut parts = std::mem::take(&mut *found.lock());
        parts.sort_by_key(|(part, _)| *part);
        Ok(parts.into_iter().flat_map(|(_, local)| local).collect())
    }
}
