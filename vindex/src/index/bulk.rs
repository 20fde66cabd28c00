//! Parallel bulk loading.
//!
//! Loading a large batch of `(value, identifier)` pairs runs in two phases:
//!
//! 1. Extraction: each task runs on a bounded blocking pool, sorts its own
//!    output and groups equal values into one run. Runs come back over a
//!    channel.
//! 2. Insertion: the runs are k-way merged into one ascending sequence and
//!    appended to the tree on the calling thread through
//!    [`Tree::append_entry`], which mostly hits the cached rightmost path.
//!
//! Equal values from different tasks are merged in task order, so the
//! result does not depend on which worker finished first.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::sync::mpsc;

use crate::index::node::LeafEntry;
use crate::index::tree::{Tree, TreeError};
use crate::index::value::{Identifier, Value};
use crate::storage::KvStore;

/// Error returned by an extraction task.
pub type ExtractError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of extraction work producing unordered pairs.
pub type ExtractTask = Box<dyn FnOnce() -> Result<Vec<(Value, Identifier)>, ExtractError> + Send>;

/// How often (in merged entries) the cache limit is enforced during insertion.
const CAP_INTERVAL: usize = 1024;

/// Errors that can occur during a bulk load.
#[derive(Debug)]
pub enum BulkLoadError {
    /// The worker runtime could not be built.
    Runtime(std::io::Error),
    /// An extraction task failed.
    Extract { task: usize, source: ExtractError },
    /// An extraction task panicked.
    WorkerPanicked { task: usize },
    /// Inserting the merged entries failed.
    Tree(TreeError),
}

impl std::fmt::Display for BulkLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime(e) => write!(f, "failed to start bulk-load workers: {e}"),
            Self::Extract { task, source } => write!(f, "extraction task {task} failed: {source}"),
            Self::WorkerPanicked { task } => write!(f, "extraction task {task} panicked"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
        }
    }
}

impl std::error::Error for BulkLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Runtime(e) => Some(e),
            Self::Extract { source, .. } => Some(source.as_ref()),
            Self::Tree(e) => Some(e),
            Self::WorkerPanicked { .. } => None,
        }
    }
}

impl From<TreeError> for BulkLoadError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

/// Summary of a finished bulk load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkLoadReport {
    pub tasks: usize,
    /// Pairs produced by all tasks.
    pub pairs: usize,
    /// Distinct values after merging.
    pub entries: usize,
    /// Entries appended via the rightmost-path fast path.
    pub fast_path_appends: u64,
}

/// Parallel extractor and sorted inserter.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    workers: usize,
    cache_limit: Option<usize>,
}

impl BulkLoader {
    /// Loader running at most `workers` extraction tasks at once.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cache_limit: None,
        }
    }

    /// Keep the tree's dirty cache under `limit` bytes while inserting.
    #[must_use]
    pub const fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Run `tasks` and insert everything they produce into `tree`.
    ///
    /// Must not be called from inside an async runtime: the loader drives its
    /// own.
    pub fn load<S: KvStore>(
        &self,
        tree: &mut Tree<S>,
        tasks: Vec<ExtractTask>,
    ) -> Result<BulkLoadReport, BulkLoadError> {
        let task_count = tasks.len();
        let runs = self.extract(tasks)?;
        let pairs: usize = runs
            .iter()
            .flatten()
            .map(|e| e.identifiers.len())
            .sum();

        let merged = merge_runs(runs);
        let entries = merged.len();
        tracing::debug!("bulk load: {task_count} tasks, {pairs} pairs, {entries} distinct values");

        let fast_before = tree.stats().fast_path_appends;
        for (i, entry) in merged.into_iter().enumerate() {
            tree.append_entry(entry)?;
            if let Some(limit) = self.cache_limit
                && (i + 1) % CAP_INTERVAL == 0
            {
                tree.db().cap(limit).map_err(TreeError::from)?;
            }
        }

        let report = BulkLoadReport {
            tasks: task_count,
            pairs,
            entries,
            fast_path_appends: tree.stats().fast_path_appends - fast_before,
        };
        tracing::info!(
            "bulk loaded {} values ({} fast-path appends)",
            report.entries,
            report.fast_path_appends
        );
        Ok(report)
    }

    /// Run every task on the worker pool and return their sorted runs in
    /// task order.
    pub fn extract(&self, tasks: Vec<ExtractTask>) -> Result<Vec<Vec<LeafEntry>>, BulkLoadError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.workers)
            .thread_name("vindex-bulk")
            .enable_all()
            .build()
            .map_err(BulkLoadError::Runtime)?;

        let task_count = tasks.len();
        runtime.block_on(async move {
            let (tx, mut rx) = mpsc::channel(self.workers);
            let mut handles = Vec::with_capacity(task_count);

            for (index, task) in tasks.into_iter().enumerate() {
                let tx = tx.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    let result = task().map(sort_run);
                    if tx.blocking_send((index, result)).is_err() {
                        tracing::debug!("bulk results channel closed before task {index} finished");
                    }
                }));
            }
            drop(tx);

            let mut runs: Vec<Option<Vec<LeafEntry>>> = vec![None; task_count];
            let mut failure = None;
            while let Some((index, result)) = rx.recv().await {
                match result {
                    Ok(run) => runs[index] = Some(run),
                    Err(source) => {
                        failure.get_or_insert(BulkLoadError::Extract {
                            task: index,
                            source,
                        });
                    }
                }
            }

            for (task, handle) in handles.into_iter().enumerate() {
                if handle.await.is_err() {
                    failure.get_or_insert(BulkLoadError::WorkerPanicked { task });
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }

            runs.into_iter()
                .enumerate()
                .map(|(task, run)| run.ok_or(BulkLoadError::WorkerPanicked { task }))
                .collect()
        })
    }
}

/// Sort one task's output and group equal values, keeping identifiers in
/// production order.
fn sort_run(mut pairs: Vec<(Value, Identifier)>) -> Vec<LeafEntry> {
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut run: Vec<LeafEntry> = Vec::new();
    for (value, identifier) in pairs {
        match run.last_mut() {
            Some(last) if last.value == value => last.identifiers.push(identifier),
            _ => run.push(LeafEntry::new(value, identifier)),
        }
    }
    run
}

/// Merge sorted runs into one ascending sequence.
///
/// Equal values are combined, earlier runs' identifiers first.
pub fn merge_runs(runs: Vec<Vec<LeafEntry>>) -> Vec<LeafEntry> {
    let total = runs.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = runs.into_iter().map(Vec::into_iter).collect();

    // (value, run index); the smallest pair pops first
    let mut heap = BinaryHeap::new();
    let mut pending: Vec<Option<LeafEntry>> = Vec::with_capacity(iters.len());
    for (index, iter) in iters.iter_mut().enumerate() {
        let head = iter.next();
        if let Some(entry) = &head {
            heap.push(Reverse((entry.value.clone(), index)));
        }
        pending.push(head);
    }

    let mut merged: Vec<LeafEntry> = Vec::with_capacity(total);
    while let Some(Reverse((_, index))) = heap.pop() {
        let Some(entry) = pending[index].take() else {
            continue;
        };
        if let Some(next) = iters[index].next() {
            heap.push(Reverse((next.value.clone(), index)));
            pending[index] = Some(next);
        }

        match merged.last_mut() {
            Some(last) if last.value == entry.value => last.identifiers.extend(entry.identifiers),
            _ => merged.push(entry),
        }
    }
    merged
}
