//! Core dataset types: the node contract and the user-facing handle.
//!
//! This module defines:
//!
//! - [`Data`] / [`Key`]: the blanket trait bounds for records and keys.
//! - [`DatasetNode<T>`]: the contract every concrete dataset implements —
//!   identity, split table, dependency records and `compute(split)`.
//! - [`Dataset<T>`]: the typed, cloneable handle users chain transformations
//!   on. `iterator(split)` wraps `compute` with the three orthogonal
//!   policies (cache, checkpoint, deep-recursion guard), and the terminal
//!   actions (`collect`, `count`, `reduce`, `take`, …) run jobs through the
//!   local scheduler.
//!
//! Datasets are immutable once constructed; a transformation builds a new
//! node that holds its parents' handles. Record iterators are lazy,
//! single-pass and not restartable — operators must not assume they can
//! re-iterate a partition.

use crate::checkpoint::CheckpointSlot;
use crate::context::Context;
use crate::dependency::Dependency;
use crate::scheduler;
use crate::split::Split;
use crate::utils;
use anyhow::{Result, anyhow};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The standard bound for records carried by a [`Dataset`].
///
/// Records may be moved across threads, buffered, cached and replayed, so
/// they must be `'static`, `Send + Sync` and `Clone`. The blanket impl lets
/// any such type flow through the engine.
pub trait Data: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Data for T {}

/// The bound for shuffle keys: hashable for hash partitioning and totally
/// ordered for the sort-merge shuffle path.
pub trait Key: Data + std::hash::Hash + Eq + Ord {}
impl<T: Data + std::hash::Hash + Eq + Ord> Key for T {}

/// A lazy, single-pass partition iterator. Record-level failures travel as
/// `Err` items; structural failures surface when the iterator is created.
pub type PartIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Identity and resource hints shared by every dataset node.
pub struct DatasetCore {
    pub id: u64,
    pub ctx: Context,
    err_bits: AtomicU64,
    mem: AtomicU64,
    cpus: AtomicU64,
    gpus: AtomicU64,
    should_cache: AtomicBool,
    scope: &'static Location<'static>,
}

impl DatasetCore {
    /// A fresh core with hints taken from the context configuration.
    #[track_caller]
    pub fn new(ctx: &Context) -> Self {
        let cfg = ctx.config();
        Self {
            id: ctx.new_dataset_id(),
            ctx: ctx.clone(),
            err_bits: AtomicU64::new(cfg.err.to_bits()),
            mem: AtomicU64::new(cfg.mem),
            cpus: AtomicU64::new(0),
            gpus: AtomicU64::new(0),
            should_cache: AtomicBool::new(false),
            scope: Location::caller(),
        }
    }

    /// A core for a derived dataset: inherits the parent's resource hints.
    #[track_caller]
    pub fn derived(parent: &DatasetCore) -> Self {
        let core = Self::new(&parent.ctx);
        core.err_bits
            .store(parent.err().to_bits(), Ordering::Relaxed);
        core.mem.store(parent.mem(), Ordering::Relaxed);
        core.cpus.store(parent.cpus(), Ordering::Relaxed);
        core.gpus.store(parent.gpus(), Ordering::Relaxed);
        core
    }

    pub fn err(&self) -> f64 {
        f64::from_bits(self.err_bits.load(Ordering::Relaxed))
    }

    pub fn mem(&self) -> u64 {
        self.mem.load(Ordering::Relaxed)
    }

    pub fn cpus(&self) -> u64 {
        self.cpus.load(Ordering::Relaxed)
    }

    pub fn gpus(&self) -> u64 {
        self.gpus.load(Ordering::Relaxed)
    }

    pub fn should_cache(&self) -> bool {
        self.should_cache.load(Ordering::Relaxed)
    }

    /// The user call site that constructed this dataset, for diagnostics.
    pub fn call_site(&self) -> String {
        format!("{}:{}", self.scope.file(), self.scope.line())
    }
}

/// The contract every concrete dataset kind implements.
pub trait DatasetNode<T: Data>: Send + Sync + 'static {
    /// Shared identity/resource record.
    fn core(&self) -> &DatasetCore;

    /// Short human label, e.g. `<Mapped <TextFile /data/a.txt>>`.
    fn label(&self) -> String;

    /// The ordered split table. Fixed at construction.
    fn splits(&self) -> Vec<Arc<dyn Split>>;

    /// Declarative dependency records for this node.
    fn dependencies(&self) -> Vec<Dependency>;

    /// Host hints for placing the task that computes `split`.
    fn preferred_locations(&self, _split: &Arc<dyn Split>) -> Vec<String> {
        Vec::new()
    }

    /// Produce the record stream for one split issued by this dataset.
    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>>;
}

/// A typed, immutable, lazy partitioned collection — the handle users chain
/// transformations on. Cloning is cheap and shares the underlying node.
pub struct Dataset<T: Data> {
    pub(crate) node: Arc<dyn DatasetNode<T>>,
    pub(crate) ckpt: Arc<CheckpointSlot<T>>,
    /// Type-erased `Part<K>` for key-partitioned datasets; see `keyed.rs`.
    pub(crate) part: Option<Arc<dyn Any + Send + Sync>>,
}

impl<T: Data> Clone for Dataset<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            ckpt: Arc::clone(&self.ckpt),
            part: self.part.clone(),
        }
    }
}

impl<T: Data> std::fmt::Debug for Dataset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.node.label())
    }
}

impl<T: Data> Dataset<T> {
    pub(crate) fn from_node(node: Arc<dyn DatasetNode<T>>) -> Self {
        Self {
            node,
            ckpt: Arc::new(CheckpointSlot::new()),
            part: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.node.core().id
    }

    /// Human-readable label of the underlying node, for diagnostics.
    pub fn label(&self) -> String {
        self.node.label()
    }

    pub fn context(&self) -> Context {
        self.node.core().ctx.clone()
    }

    pub(crate) fn core(&self) -> &DatasetCore {
        self.node.core()
    }

    /// The ordered split table. Split indices always cover `[0, n)`.
    pub fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.node.splits()
    }

    /// Partition count.
    pub fn num_splits(&self) -> usize {
        self.node.splits().len()
    }

    /// Dependency records; empty once a checkpoint has materialized (the
    /// upstream edges collapse to the checkpoint leaf).
    pub fn dependencies(&self) -> Vec<Dependency> {
        if self.ckpt.promoted() {
            return Vec::new();
        }
        self.node.dependencies()
    }

    pub fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        let core = self.node.core();
        if core.should_cache() {
            let locs = core.ctx.cache().cached_locs(core.id, split.index());
            if !locs.is_empty() {
                return locs;
            }
        }
        self.node.preferred_locations(split)
    }

    /// Request that computed partitions be memoised by the cache tracker.
    pub fn cache(self) -> Self {
        self.node
            .core()
            .should_cache
            .store(true, Ordering::Relaxed);
        self
    }

    /// Per-record error tolerance for the fallible operators downstream.
    pub fn with_err(self, err: f64) -> Self {
        self.node
            .core()
            .err_bits
            .store(err.to_bits(), Ordering::Relaxed);
        self
    }

    /// Task memory hint in MiB.
    pub fn with_mem(self, mem: u64) -> Self {
        self.node.core().mem.store(mem, Ordering::Relaxed);
        self
    }

    pub fn with_cpus(self, cpus: u64) -> Self {
        self.node.core().cpus.store(cpus, Ordering::Relaxed);
        self
    }

    pub fn with_gpus(self, gpus: u64) -> Self {
        self.node.core().gpus.store(gpus, Ordering::Relaxed);
        self
    }

    /// The record stream for `split`, wrapped with the cache, checkpoint and
    /// deep-recursion policies.
    pub fn iterator(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let limit = self.node.core().ctx.config().recursion_limit;
        if utils::chain_depth() >= limit {
            // Continue the chain on a helper thread with a fresh stack.
            let this = self.clone();
            let sp = Arc::clone(split);
            return Ok(utils::detach_iter(move || this.iterator_guarded(&sp)));
        }
        self.iterator_guarded(split)
    }

    fn iterator_guarded(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let _depth = utils::DepthGuard::enter();
        if self.ckpt.configured() {
            return self.ckpt.iterate(self, split);
        }
        self.cached_compute(split)
    }

    /// `compute` routed through the cache tracker when caching is requested.
    pub(crate) fn cached_compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let core = self.node.core();
        if core.should_cache() {
            let node = Arc::clone(&self.node);
            let sp = Arc::clone(split);
            return core
                .ctx
                .cache()
                .get_or_compute((core.id, split.index()), move || node.compute(&sp));
        }
        self.node.compute(split)
    }

    // ---------------- terminal actions ----------------

    /// Materialize every partition in order.
    pub fn collect(&self) -> Result<Vec<T>> {
        let parts =
            scheduler::run_job(self, |_idx, it| it.collect::<Result<Vec<T>>>(), None)?;
        Ok(parts.into_iter().flatten().collect())
    }

    /// Number of records across all partitions.
    pub fn count(&self) -> Result<u64> {
        let counts = scheduler::run_job(
            self,
            |_idx, it| {
                let mut n = 0u64;
                for r in it {
                    r?;
                    n += 1;
                }
                Ok(n)
            },
            None,
        )?;
        Ok(counts.into_iter().sum())
    }

    /// First `n` records, pulling one partition at a time.
    pub fn take(&self, n: usize) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return Ok(out);
        }
        let total = self.num_splits();
        let mut p = 0;
        while out.len() < n && p < total {
            let want = n - out.len();
            let got = scheduler::run_job(
                self,
                move |_idx, it| it.take(want).collect::<Result<Vec<T>>>(),
                Some(vec![p]),
            )?;
            if let Some(v) = got.into_iter().next() {
                out.extend(v);
            }
            p += 1;
        }
        Ok(out)
    }

    pub fn first(&self) -> Result<Option<T>> {
        Ok(self.take(1)?.into_iter().next())
    }

    /// Reduce all records with an associative function. An empty dataset is
    /// an invariant violation.
    pub fn reduce(&self, f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Result<T> {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        let parts = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut acc: Option<T> = None;
                for r in it {
                    let v = r?;
                    acc = Some(match acc {
                        Some(a) => g(a, v),
                        None => v,
                    });
                }
                Ok(acc)
            },
            None,
        )?;
        parts
            .into_iter()
            .flatten()
            .reduce(|a, b| f(a, b))
            .ok_or_else(|| anyhow!("reduce on an empty dataset"))
    }

    /// Like [`reduce`](Self::reduce) but tolerates failing records up to the
    /// dataset's error quota; failures are counted and logged, never echoed.
    pub fn try_reduce(
        &self,
        f: impl Fn(T, T) -> Result<T> + Send + Sync + 'static,
    ) -> Result<Option<T>> {
        let err = self.core().err();
        let site = self.core().call_site();
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        let parts = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut quota = crate::ops::ErrorQuota::new(err, &site);
                let mut acc: Option<T> = None;
                for r in it {
                    let v = r?;
                    quota.saw_record();
                    match acc {
                        Some(a) => match g(a.clone(), v) {
                            Ok(next) => acc = Some(next),
                            Err(e) => {
                                quota.record_error(e)?;
                                acc = Some(a);
                            }
                        },
                        None => acc = Some(v),
                    }
                }
                quota.finish()?;
                Ok(acc)
            },
            None,
        )?;
        let mut acc: Option<T> = None;
        for v in parts.into_iter().flatten() {
            acc = Some(match acc {
                Some(a) => f(a, v)?,
                None => v,
            });
        }
        Ok(acc)
    }

    /// Fold each partition from `zero`, then fold the partition results.
    pub fn fold(&self, zero: T, f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Result<T> {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        let z = zero.clone();
        let parts = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut acc = z.clone();
                for r in it {
                    acc = g(acc, r?);
                }
                Ok(acc)
            },
            None,
        )?;
        Ok(parts.into_iter().fold(zero, |a, b| f(a, b)))
    }

    /// Aggregate with a result type different from the record type.
    pub fn aggregate<U: Data>(
        &self,
        zero: U,
        seq_op: impl Fn(U, T) -> U + Send + Sync + 'static,
        comb_op: impl Fn(U, U) -> U + Send + Sync + 'static,
    ) -> Result<U> {
        let seq = Arc::new(seq_op);
        let z = zero.clone();
        let parts = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut acc = z.clone();
                for r in it {
                    acc = seq(acc, r?);
                }
                Ok(acc)
            },
            None,
        )?;
        Ok(parts.into_iter().fold(zero, |a, b| comb_op(a, b)))
    }

    /// Apply `f` to every record for its side effects.
    pub fn foreach(&self, f: impl Fn(T) + Send + Sync + 'static) -> Result<()> {
        scheduler::run_job(
            self,
            move |_idx, it| {
                for r in it {
                    f(r?);
                }
                Ok(())
            },
            None,
        )?;
        Ok(())
    }

    /// Apply `f` once per partition iterator.
    pub fn foreach_partition(
        &self,
        f: impl Fn(PartIter<T>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        scheduler::run_job(self, move |_idx, it| f(it), None)?;
        Ok(())
    }

    /// The `n` largest records under `key`, descending (ascending when
    /// `reverse`).
    pub fn top_by<S: Key>(
        &self,
        n: usize,
        key: impl Fn(&T) -> S + Send + Sync + 'static,
        reverse: bool,
    ) -> Result<Vec<T>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let key = Arc::new(key);
        let k2 = Arc::clone(&key);
        let parts = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut heap: BinaryHeap<Reverse<TopEntry<S, T>>> = BinaryHeap::new();
                for r in it {
                    let v = r?;
                    heap.push(Reverse(TopEntry::new(k2(&v), v, reverse)));
                    if heap.len() > n {
                        heap.pop(); // drop the worst of the kept set
                    }
                }
                Ok(heap.into_iter().map(|Reverse(e)| e).collect::<Vec<_>>())
            },
            None,
        )?;
        let mut heap: BinaryHeap<Reverse<TopEntry<S, T>>> = BinaryHeap::new();
        for entry in parts.into_iter().flatten() {
            heap.push(Reverse(entry));
            if heap.len() > n {
                heap.pop();
            }
        }
        let mut out: Vec<TopEntry<S, T>> = heap.into_iter().map(|Reverse(e)| e).collect();
        out.sort();
        Ok(out.into_iter().rev().map(|e| e.value).collect())
    }

    /// The `n` largest records, descending.
    pub fn top(&self, n: usize) -> Result<Vec<T>>
    where
        T: Key,
    {
        self.top_by(n, |v| v.clone(), false)
    }
}

/// Bounded min-heap entry: ordering ignores the value so only the key (and
/// the reverse flag) decide retention.
struct TopEntry<S, T> {
    key: S,
    value: T,
    reverse: bool,
}

impl<S: Ord, T> TopEntry<S, T> {
    fn new(key: S, value: T, reverse: bool) -> Self {
        Self {
            key,
            value,
            reverse,
        }
    }
}

impl<S: Ord, T> PartialEq for TopEntry<S, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<S: Ord, T> Eq for TopEntry<S, T> {}

impl<S: Ord, T> PartialOrd for TopEntry<S, T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: Ord, T> Ord for TopEntry<S, T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ord = self.key.cmp(&other.key);
        if self.reverse { ord.reverse() } else { ord }
    }
}
