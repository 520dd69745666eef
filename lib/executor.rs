//! Executors for embarrassingly parallel batches of independent calls.
//!
//! Executors are passed explicitly into the batch routines of
//! [`frechet`][crate::frechet] and [`cost`][crate::cost]; nothing in this crate
//! touches a process-wide pool.

use std::sync::atomic::{ AtomicUsize, Ordering };
use rayon::iter::{ IndexedParallelIterator, IntoParallelIterator, ParallelIterator };
use crate::error::{ ExpmError, ExpmResult };

/// Maps a function over a batch of owned items, returning outputs in input
/// order.
pub trait BatchExecutor {
    /// Apply `f` to every `(index, item)` pair.
    ///
    /// The `k`-th output must correspond to the `k`-th input regardless of the
    /// order in which work completes.
    fn map_indexed<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync;

    /// Number of workers available to a single batch.
    fn workers(&self) -> usize;
}

/// Runs every item on the calling thread.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Inline;

impl BatchExecutor for Inline {
    fn map_indexed<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        items.into_iter().enumerate().map(|(k, x)| f(k, x)).collect()
    }

    fn workers(&self) -> usize { 1 }
}

/// Runs items on a dedicated `rayon` pool owned by the executor.
#[derive(Debug)]
pub struct ThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool {
    /// Create a pool with `threads` workers; `0` uses every available core.
    pub fn new(threads: usize) -> ExpmResult<Self> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|k| format!("expm-worker-{}", k))
            .build()
            .map(|pool| Self { pool })
            .map_err(|e| ExpmError::Config(e.to_string()))
    }

    /// Create a pool sized to the number of available cores.
    pub fn with_available_cores() -> ExpmResult<Self> { Self::new(0) }
}

impl BatchExecutor for ThreadPool {
    fn map_indexed<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        self.pool.install(|| {
            items.into_par_iter()
                .enumerate()
                .map(|(k, x)| f(k, x))
                .collect()
        })
    }

    fn workers(&self) -> usize { self.pool.current_num_threads() }
}

/// Executor chosen at runtime, e.g. from a
/// [`PropagatorConfig`][crate::config::PropagatorConfig].
#[derive(Debug)]
pub enum Executor {
    Inline(Inline),
    Pool(ThreadPool),
}

impl BatchExecutor for Executor {
    fn map_indexed<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        match self {
            Self::Inline(ex) => ex.map_indexed(items, f),
            Self::Pool(ex) => ex.map_indexed(items, f),
        }
    }

    fn workers(&self) -> usize {
        match self {
            Self::Inline(ex) => ex.workers(),
            Self::Pool(ex) => ex.workers(),
        }
    }
}

/// Run a fallible batch, dispatching single items inline and larger batches
/// to `executor`.
///
/// Outputs are returned in input order. If any item fails, the error of the
/// lowest failing index is returned wrapped in [`ExpmError::BatchItem`] and
/// all other results are discarded. Items above a known failure are skipped
/// without being evaluated; every item below the reported index always runs.
pub fn try_map_batch<E, T, R, F>(executor: &E, items: Vec<T>, f: F)
    -> ExpmResult<Vec<R>>
where
    E: BatchExecutor,
    T: Send,
    R: Send,
    F: Fn(usize, T) -> ExpmResult<R> + Send + Sync,
{
    let first_failure = AtomicUsize::new(usize::MAX);
    let guarded = |k: usize, x: T| -> Option<ExpmResult<R>> {
        if k > first_failure.load(Ordering::Acquire) { return None; }
        let res = f(k, x);
        if res.is_err() { first_failure.fetch_min(k, Ordering::AcqRel); }
        Some(res)
    };
    let results: Vec<Option<ExpmResult<R>>>
        = if items.len() < 2 || executor.workers() < 2 {
            Inline.map_indexed(items, guarded)
        } else {
            executor.map_indexed(items, guarded)
        };
    // skipped items only follow a failure, which ends the collection first
    results.into_iter()
        .enumerate()
        .map_while(|(k, res)| res.map(|r| r.map_err(|e| e.at_index(k))))
        .collect()
}
