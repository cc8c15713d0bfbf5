//! Thread providers for parallel iteration.
//!
//! A parallel query is split into contiguous block ranges, one task per
//! range. The provider decides how many ranges there are and which threads
//! run them; the caller blocks until every task has finished.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One unit of parallel work.
pub type Task = Box<dyn FnOnce() -> CoreResult<()> + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How many threads a parallel iteration uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCountStrategy {
    /// Always the given number of threads.
    Fixed(usize),
    /// As many threads as the machine offers, but no more than one per
    /// `min_blocks_per_thread` bitmap blocks of work.
    Adaptive {
        /// Upper bound of threads.
        max_threads: usize,
        /// Least number of blocks worth a thread of its own.
        min_blocks_per_thread: usize,
    },
}

impl ThreadCountStrategy {
    /// Adaptive strategy bounded by the available parallelism.
    #[must_use]
    pub fn adaptive() -> Self {
        Self::Adaptive {
            max_threads: thread::available_parallelism().map_or(1, |n| n.get()),
            min_blocks_per_thread: 1,
        }
    }

    /// Number of threads for `blocks` blocks of work. Never zero.
    #[must_use]
    pub fn thread_count(&self, blocks: usize) -> usize {
        let count = match *self {
            Self::Fixed(threads) => threads,
            Self::Adaptive {
                max_threads,
                min_blocks_per_thread,
            } => max_threads.min(blocks / min_blocks_per_thread.max(1)),
        };
        count.max(1)
    }
}

impl Default for ThreadCountStrategy {
    fn default() -> Self {
        Self::adaptive()
    }
}

/// Which threads run the tasks of a parallel iteration.
#[derive(Debug, Clone, Default)]
pub enum IterationThreadProvider {
    /// Everything runs on the calling thread.
    #[default]
    NoParallelism,
    /// One fresh thread per task, joined before returning.
    Transient(ThreadCountStrategy),
    /// Long-lived threads of a shared pool.
    Pooled(Arc<ThreadPool>),
}

impl IterationThreadProvider {
    /// Transient threads with the adaptive strategy.
    #[must_use]
    pub fn transient() -> Self {
        Self::Transient(ThreadCountStrategy::adaptive())
    }

    /// A new pool with the given strategy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if a worker thread
    /// cannot be spawned.
    pub fn pooled(strategy: ThreadCountStrategy) -> CoreResult<Self> {
        Ok(Self::Pooled(Arc::new(ThreadPool::new(strategy)?)))
    }

    /// Number of tasks to split `blocks` blocks of work into.
    #[must_use]
    pub fn thread_count(&self, blocks: usize) -> usize {
        match self {
            Self::NoParallelism => 1,
            Self::Transient(strategy) => strategy.thread_count(blocks),
            Self::Pooled(pool) => pool.strategy.thread_count(blocks),
        }
    }

    /// Runs every task and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns the first task error, or [`CoreError::WorkerFailed`] if a
    /// task panicked or could not be started.
    pub fn execute(&self, tasks: Vec<Task>) -> CoreResult<()> {
        match self {
            Self::NoParallelism => tasks.into_iter().try_for_each(|task| task()),
            Self::Transient(_) => run_transient(tasks),
            Self::Pooled(pool) => pool.execute(tasks),
        }
    }
}

fn run_transient(tasks: Vec<Task>) -> CoreResult<()> {
    let mut handles = Vec::with_capacity(tasks.len());
    let mut result = Ok(());
    for (worker, task) in tasks.into_iter().enumerate() {
        match thread::Builder::new()
            .name(format!("gigamap-scan-{worker}"))
            .spawn(task)
        {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                result = Err(CoreError::WorkerFailed {
                    message: format!("cannot spawn worker: {err}"),
                });
                break;
            }
        }
    }
    for handle in handles {
        let outcome = handle.join().unwrap_or_else(|payload| {
            Err(CoreError::WorkerFailed {
                message: panic_message(payload.as_ref()),
            })
        });
        if result.is_ok() {
            result = outcome;
        }
    }
    result
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

struct Queue {
    jobs: VecDeque<Job>,
    active: bool,
}

struct PoolShared {
    queue: Mutex<Queue>,
    work_available: Condvar,
}

/// A fixed set of worker threads waiting for iteration tasks.
///
/// Workers are deactivated by [`ThreadPool::shutdown`] (or on drop): they
/// finish queued tasks, then exit.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    strategy: ThreadCountStrategy,
}

impl ThreadPool {
    /// Starts a pool sized for the strategy's largest thread count.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if a worker thread
    /// cannot be spawned.
    pub fn new(strategy: ThreadCountStrategy) -> CoreResult<Self> {
        let size = strategy.thread_count(usize::MAX);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                active: true,
            }),
            work_available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(size);
        for worker in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("gigamap-pool-{worker}"))
                .spawn(move || work(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    let pool = Self {
                        shared,
                        workers: Mutex::new(workers),
                        strategy,
                    };
                    pool.shutdown();
                    return Err(CoreError::invalid_configuration(format!(
                        "cannot spawn pool worker: {err}"
                    )));
                }
            }
        }
        tracing::debug!(threads = size, "iteration pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            strategy,
        })
    }

    /// Number of worker threads still running.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// The pool's thread count strategy.
    #[must_use]
    pub fn strategy(&self) -> ThreadCountStrategy {
        self.strategy
    }

    /// Whether the pool still accepts tasks.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.queue.lock().active
    }

    fn execute(&self, tasks: Vec<Task>) -> CoreResult<()> {
        let completion = Arc::new(Completion {
            state: Mutex::new(CompletionState {
                remaining: tasks.len(),
                result: Ok(()),
            }),
            done: Condvar::new(),
        });
        {
            let mut queue = self.shared.queue.lock();
            if !queue.active {
                return Err(CoreError::WorkerFailed {
                    message: "iteration pool is shut down".to_string(),
                });
            }
            for task in tasks {
                let completion = Arc::clone(&completion);
                queue.jobs.push_back(Box::new(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                        Err(CoreError::WorkerFailed {
                            message: panic_message(payload.as_ref()),
                        })
                    });
                    completion.finish(outcome);
                }));
            }
        }
        self.shared.work_available.notify_all();

        let mut state = completion.state.lock();
        while state.remaining > 0 {
            completion.done.wait(&mut state);
        }
        std::mem::replace(&mut state.result, Ok(()))
    }

    /// Deactivates the workers and waits for them to exit.
    pub fn shutdown(&self) {
        self.shared.queue.lock().active = false;
        self.shared.work_available.notify_all();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let count = workers.len();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("iteration pool worker panicked");
            }
        }
        if count > 0 {
            tracing::debug!(threads = count, "iteration pool stopped");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size())
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn work(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if !queue.active {
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };
        job();
    }
}

struct CompletionState {
    remaining: usize,
    result: CoreResult<()>,
}

struct Completion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl Completion {
    fn finish(&self, outcome: CoreResult<()>) {
        let mut state = self.state.lock();
        state.remaining -= 1;
        if state.result.is_ok() {
            state.result = outcome;
        }
        if state.remaining == 0 {
            self.done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tasks(counter: &Arc<AtomicUsize>, n: usize) -> Vec<Task> {
        (0..n)
            .map(|_| {
                let counter = Arc::clone(counter);
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as Task
            })
            .collect()
    }

    #[test]
    fn strategies_never_return_zero() {
        assert_eq!(ThreadCountStrategy::Fixed(0).thread_count(10), 1);
        assert_eq!(ThreadCountStrategy::Fixed(4).thread_count(1), 4);
        let adaptive = ThreadCountStrategy::Adaptive {
            max_threads: 8,
            min_blocks_per_thread: 4,
        };
        assert_eq!(adaptive.thread_count(0), 1);
        assert_eq!(adaptive.thread_count(10), 2);
        assert_eq!(adaptive.thread_count(1000), 8);
    }

    #[test]
    fn every_provider_runs_every_task() {
        let providers = [
            IterationThreadProvider::NoParallelism,
            IterationThreadProvider::Transient(ThreadCountStrategy::Fixed(3)),
            IterationThreadProvider::pooled(ThreadCountStrategy::Fixed(2)).unwrap(),
        ];
        for provider in providers {
            let counter = Arc::new(AtomicUsize::new(0));
            provider.execute(counting_tasks(&counter, 5)).unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 5);
        }
    }

    #[test]
    fn task_errors_and_panics_are_reported() {
        let providers = [
            IterationThreadProvider::Transient(ThreadCountStrategy::Fixed(2)),
            IterationThreadProvider::pooled(ThreadCountStrategy::Fixed(2)).unwrap(),
        ];
        for provider in providers {
            let failing: Vec<Task> = vec![
                Box::new(|| Ok(())),
                Box::new(|| Err(CoreError::unsupported("nope"))),
            ];
            assert!(matches!(
                provider.execute(failing),
                Err(CoreError::Unsupported { .. })
            ));

            let panicking: Vec<Task> = vec![Box::new(|| panic!("scan exploded"))];
            match provider.execute(panicking) {
                Err(CoreError::WorkerFailed { message }) => assert!(message.contains("exploded")),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn shut_down_pool_rejects_tasks() {
        let pool = ThreadPool::new(ThreadCountStrategy::Fixed(2)).unwrap();
        assert_eq!(pool.size(), 2);
        pool.shutdown();
        assert!(!pool.is_active());
        assert_eq!(pool.size(), 0);
        let provider = IterationThreadProvider::Pooled(Arc::new(pool));
        assert!(matches!(
            provider.execute(vec![Box::new(|| Ok(()))]),
            Err(CoreError::WorkerFailed { .. })
        ));
    }
}
