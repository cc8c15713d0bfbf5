//! Map statistics.
//!
//! Counters are atomic and can be read while operations are in progress.
//!
//! ```rust,ignore
//! let map = GigaMap::<Person>::new()?;
//! map.add(person)?;
//! println!("adds: {}", map.stats().adds());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of one map.
#[derive(Debug, Default)]
pub struct GigaMapStats {
    adds: AtomicU64,
    replaces: AtomicU64,
    removes: AtomicU64,
    queries: AtomicU64,
    parallel_queries: AtomicU64,
    constraint_violations: AtomicU64,
    segments_stored: AtomicU64,
    segments_loaded: AtomicU64,
    segments_evicted: AtomicU64,
    store_cycles: AtomicU64,
}

impl GigaMapStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replace(&self) {
        self.replaces.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removes(&self, count: u64) {
        self.removes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parallel_query(&self) {
        self.parallel_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_constraint_violation(&self) {
        self.constraint_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segments_stored(&self, count: u64) {
        self.segments_stored.fetch_add(count, Ordering::Relaxed);
        self.store_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_loaded(&self) {
        self.segments_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segments_evicted(&self, count: u64) {
        self.segments_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Entities added.
    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    /// Entities replaced.
    pub fn replaces(&self) -> u64 {
        self.replaces.load(Ordering::Relaxed)
    }

    /// Entities removed, one per entity, `remove_all` included.
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Conditions evaluated.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Conditions evaluated by more than one thread.
    pub fn parallel_queries(&self) -> u64 {
        self.parallel_queries.load(Ordering::Relaxed)
    }

    /// Mutations and checks rejected by a constraint.
    pub fn constraint_violations(&self) -> u64 {
        self.constraint_violations.load(Ordering::Relaxed)
    }

    /// Segments written to a segment store.
    pub fn segments_stored(&self) -> u64 {
        self.segments_stored.load(Ordering::Relaxed)
    }

    /// Evicted segments loaded back.
    pub fn segments_loaded(&self) -> u64 {
        self.segments_loaded.load(Ordering::Relaxed)
    }

    /// Segments evicted from memory.
    pub fn segments_evicted(&self) -> u64 {
        self.segments_evicted.load(Ordering::Relaxed)
    }

    /// Completed store cycles.
    pub fn store_cycles(&self) -> u64 {
        self.store_cycles.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            adds: self.adds(),
            replaces: self.replaces(),
            removes: self.removes(),
            queries: self.queries(),
            parallel_queries: self.parallel_queries(),
            constraint_violations: self.constraint_violations(),
            segments_stored: self.segments_stored(),
            segments_loaded: self.segments_loaded(),
            segments_evicted: self.segments_evicted(),
            store_cycles: self.store_cycles(),
        }
    }
}

/// A point-in-time copy of [`GigaMapStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Entities added.
    pub adds: u64,
    /// Entities replaced.
    pub replaces: u64,
    /// Entities removed.
    pub removes: u64,
    /// Conditions evaluated.
    pub queries: u64,
    /// Conditions evaluated by more than one thread.
    pub parallel_queries: u64,
    /// Rejected mutations and checks.
    pub constraint_violations: u64,
    /// Segments written.
    pub segments_stored: u64,
    /// Segments loaded back.
    pub segments_loaded: u64,
    /// Segments evicted.
    pub segments_evicted: u64,
    /// Completed store cycles.
    pub store_cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(GigaMapStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn store_cycles_count_once_per_call() {
        let stats = GigaMapStats::new();
        stats.record_segments_stored(7);
        stats.record_segments_stored(0);
        assert_eq!(stats.segments_stored(), 7);
        assert_eq!(stats.store_cycles(), 2);
    }

    #[test]
    fn concurrent_updates() {
        let stats = Arc::new(GigaMapStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record_add();
                        stats.record_query();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.adds, 800);
        assert_eq!(snap.queries, 800);
    }
}
