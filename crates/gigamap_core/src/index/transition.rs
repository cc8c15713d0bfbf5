//! Two-phase index transitions.
//!
//! Every mutation first computes, per index, where the entity leaves and
//! where it lands without touching a bitmap. Constraints are checked
//! against that plan; only then is it committed (or dropped).

use crate::entity::EntityId;
use std::hash::Hash;

/// Where an entity sits, or will sit, in one index for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryHandle<K> {
    /// No bitmap: removal and insertion are no-ops.
    Null,
    /// An existing entry, by position.
    Existing(usize),
    /// A key without an entry yet; the entry is created on commit.
    Pending(K),
}

impl<K> EntryHandle<K> {
    /// Position of the existing entry, if any.
    pub fn position(&self) -> Option<usize> {
        match self {
            EntryHandle::Existing(position) => Some(*position),
            EntryHandle::Null | EntryHandle::Pending(_) => None,
        }
    }
}

/// The planned move of one entity within one key table.
#[derive(Debug, Clone)]
pub struct Transition<K> {
    /// The entity being moved.
    pub id: EntityId,
    /// Entries the entity leaves. Each key appears once.
    pub removals: Vec<EntryHandle<K>>,
    /// Entries the entity ends up in, whether or not it is already there.
    pub targets: Vec<EntryHandle<K>>,
}

impl<K: Eq + Hash + Clone> Transition<K> {
    /// Plans the move from `old` keys to `new` keys.
    ///
    /// Keys present on both sides are neither removed nor re-inserted, so a
    /// key shared by several values of a multi-value entity loses the ID
    /// exactly once, and only if no new value still maps to it.
    pub fn plan(
        id: EntityId,
        old: &[K],
        new: &[K],
        resolve: impl Fn(&K) -> Option<usize>,
    ) -> Self {
        let old = dedup(old);
        let new = dedup(new);

        let removals = old
            .iter()
            .filter(|key| !new.contains(key))
            .map(|key| match resolve(key) {
                Some(position) => EntryHandle::Existing(position),
                None => EntryHandle::Null,
            })
            .collect();

        let targets = new
            .into_iter()
            .map(|key| match resolve(&key) {
                Some(position) => EntryHandle::Existing(position),
                None => EntryHandle::Pending(key),
            })
            .collect();

        Self {
            id,
            removals,
            targets,
        }
    }

    /// Whether committing would change nothing.
    pub fn is_noop(&self) -> bool {
        self.removals.iter().all(|h| *h == EntryHandle::Null)
            && self.targets.iter().all(|h| *h == EntryHandle::Null)
    }
}

fn dedup<K: Eq + Clone>(keys: &[K]) -> Vec<K> {
    let mut unique: Vec<K> = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.contains(key) {
            unique.push(key.clone());
        }
    }
    unique
}
