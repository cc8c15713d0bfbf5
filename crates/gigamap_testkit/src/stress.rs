//! Stress runs for GigaMap.
//!
//! These runs exercise large populations and concurrent access. Every
//! operation either succeeds with the expected answer or counts as failed.

use crate::fixtures::{scenarios, TestMap};
use gigamap_core::{Condition, IterationThreadProvider};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        tracing::info!(
            run = name,
            total = self.total_ops,
            successful = self.successful_ops,
            failed = self.failed_ops,
            duration = ?self.duration,
            ops_per_second = self.ops_per_second,
            "stress run finished"
        );
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of entities to populate before querying.
    pub entity_count: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            entity_count: 1_000,
        }
    }
}

/// Adds `operations` sample people one by one.
pub fn stress_sequential_adds(map: &TestMap, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations as u64 {
        match map.add(scenarios::person(i)) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Populates `entity_count` people, then looks customer numbers up. Each
/// lookup must find exactly one entity.
pub fn stress_point_queries(map: &TestMap, config: &StressConfig) -> StressTestResult {
    scenarios::populate(map, config.entity_count);
    let count = config.entity_count.max(1);

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations as u64 {
        let query = map.query(map.indices.customer_no.is(i * 7919 % count));
        match query.count() {
            Ok(1) => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Runs reader threads against one writer thread. Every read pins one
/// state and checks that the full scan agrees with the size of that state.
pub fn stress_concurrent_reads(map: &TestMap, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let writing = Arc::new(AtomicBool::new(true));
    let per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();
    thread::scope(|scope| {
        let writer_map = map.map.clone();
        let entity_count = config.entity_count;
        let writing_flag = Arc::clone(&writing);
        let writer_failed = Arc::clone(&failed);
        scope.spawn(move || {
            for i in 0..entity_count {
                if writer_map.add(scenarios::person(i)).is_err() {
                    writer_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            writing_flag.store(false, Ordering::Release);
        });

        for _ in 0..config.threads {
            let reader_map = map.map.clone();
            let active = map.indices.active.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            scope.spawn(move || {
                for _ in 0..per_thread {
                    let reader = reader_map.read();
                    let consistent = reader
                        .count(&Condition::all())
                        .map(|all| all == reader.size())
                        .unwrap_or(false)
                        && match (
                            reader.count(&active.is_true()),
                            reader.count(&active.is_false()),
                        ) {
                            (Ok(t), Ok(f)) => t + f == reader.size(),
                            _ => false,
                        };
                    if consistent {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    tracing::debug!(
        still_writing = writing.load(Ordering::Acquire),
        "concurrent read run joined"
    );
    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Populates `entity_count` people, then scans the active ones with
/// `provider`. Each scan must match the sequential count.
pub fn stress_parallel_scans(
    map: &TestMap,
    provider: &IterationThreadProvider,
    config: &StressConfig,
) -> StressTestResult {
    scenarios::populate(map, config.entity_count);
    let expected = map.query(map.indices.active.is_true()).count().unwrap_or(0);

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for _ in 0..config.operations {
        let scanned = map
            .query(map.indices.active.is_true())
            .to_vec_with(provider)
            .map(|found| found.len() as u64);
        match scanned {
            Ok(n) if n == expected => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}
