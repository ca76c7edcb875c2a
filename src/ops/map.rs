//! Record-wise and partition-wise narrow transformations.
//!
//! All of these share one node shape: a per-split stream transform over the
//! parent's record iterator. The node keeps the parent's split table and
//! preferred locations; whether the parent's partitioner survives is decided
//! by the wrapper method (`map_values` keeps it, `map` does not).

use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::ops::ErrorQuota;
use crate::scheduler;
use crate::split::Split;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;

type StreamFn<T, U> = Arc<dyn Fn(PartIter<T>, usize) -> PartIter<U> + Send + Sync>;

/// A narrow one-to-one node applying a stream transform per split.
pub(crate) struct StreamTransform<T: Data, U: Data> {
    core: DatasetCore,
    prev: Dataset<T>,
    op: &'static str,
    f: StreamFn<T, U>,
}

impl<T: Data, U: Data> DatasetNode<U> for StreamTransform<T, U> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<{} {:?}>", self.op, self.prev)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.prev.splits()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Narrow {
            parent: self.prev.id(),
        }]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        self.prev.preferred_locations(split)
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<U>> {
        let input = self.prev.iterator(split)?;
        Ok((self.f)(input, split.index()))
    }
}

impl<T: Data> Dataset<T> {
    /// Internal constructor for narrow per-split transforms.
    #[track_caller]
    pub(crate) fn derive<U: Data>(
        &self,
        op: &'static str,
        f: impl Fn(PartIter<T>, usize) -> PartIter<U> + Send + Sync + 'static,
    ) -> Dataset<U> {
        Dataset::from_node(Arc::new(StreamTransform {
            core: DatasetCore::derived(self.core()),
            prev: self.clone(),
            op,
            f: Arc::new(f),
        }))
    }

    /// Transform each record.
    #[track_caller]
    pub fn map<U: Data>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Dataset<U> {
        let f = Arc::new(f);
        self.derive("Mapped", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(it.map(move |r| r.map(|v| f(v))))
        })
    }

    /// Keep records matching the predicate.
    #[track_caller]
    pub fn filter(&self, p: impl Fn(&T) -> bool + Send + Sync + 'static) -> Dataset<T> {
        let p = Arc::new(p);
        self.derive("Filtered", move |it, _| {
            let p = Arc::clone(&p);
            Box::new(it.filter(move |r| match r {
                Ok(v) => p(v),
                Err(_) => true,
            }))
        })
    }

    /// Transform each record into zero or more records.
    #[track_caller]
    pub fn flat_map<U: Data>(
        &self,
        f: impl Fn(T) -> Vec<U> + Send + Sync + 'static,
    ) -> Dataset<U> {
        let f = Arc::new(f);
        self.derive("FlatMapped", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(
                it.map(move |r| match r {
                    Ok(v) => f(v).into_iter().map(Ok).collect::<Vec<Result<U>>>(),
                    Err(e) => vec![Err(e)],
                })
                .flatten(),
            )
        })
    }

    /// Fallible transform; failing records are dropped against the error
    /// quota.
    #[track_caller]
    pub fn try_map<U: Data>(
        &self,
        f: impl Fn(T) -> Result<U> + Send + Sync + 'static,
    ) -> Dataset<U> {
        let f = Arc::new(f);
        let err = self.core().err();
        let site = self.core().call_site();
        self.derive("TryMapped", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(QuotaIter::new(
                it,
                move |v| f(v).map(|u| vec![u]),
                ErrorQuota::new(err, &site),
            ))
        })
    }

    /// Fallible 1-to-N transform under the error quota.
    #[track_caller]
    pub fn try_flat_map<U: Data>(
        &self,
        f: impl Fn(T) -> Result<Vec<U>> + Send + Sync + 'static,
    ) -> Dataset<U> {
        let f = Arc::new(f);
        let err = self.core().err();
        let site = self.core().call_site();
        self.derive("TryFlatMapped", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(QuotaIter::new(
                it,
                move |v| f(v),
                ErrorQuota::new(err, &site),
            ))
        })
    }

    /// Fallible filter under the error quota.
    #[track_caller]
    pub fn try_filter(
        &self,
        p: impl Fn(&T) -> Result<bool> + Send + Sync + 'static,
    ) -> Dataset<T> {
        let p = Arc::new(p);
        let err = self.core().err();
        let site = self.core().call_site();
        self.derive("TryFiltered", move |it, _| {
            let p = Arc::clone(&p);
            Box::new(QuotaIter::new(
                it,
                move |v: T| {
                    let keep = p(&v)?;
                    Ok(if keep { vec![v] } else { Vec::new() })
                },
                ErrorQuota::new(err, &site),
            ))
        })
    }

    /// Transform a whole partition iterator at once. The partitioner is not
    /// preserved.
    #[track_caller]
    pub fn map_partitions<U: Data>(
        &self,
        f: impl Fn(PartIter<T>) -> PartIter<U> + Send + Sync + 'static,
    ) -> Dataset<U> {
        let f = Arc::new(f);
        self.derive("MapPartitions", move |it, _| f(it))
    }

    /// Like [`map_partitions`](Self::map_partitions) with the split index.
    #[track_caller]
    pub fn enumerate_partitions<U: Data>(
        &self,
        f: impl Fn(usize, PartIter<T>) -> PartIter<U> + Send + Sync + 'static,
    ) -> Dataset<U> {
        let f = Arc::new(f);
        self.derive("EnumeratePartitions", move |it, idx| f(idx, it))
    }

    /// Materialize each partition into one `Vec` record.
    #[track_caller]
    pub fn glom(&self) -> Dataset<Vec<T>> {
        self.derive("Glommed", |it, _| {
            Box::new(std::iter::once(it.collect::<Result<Vec<T>>>()))
        })
    }

    /// Chunk each partition into `Vec`s of at most `size` records.
    #[track_caller]
    pub fn batch(&self, size: usize) -> Dataset<Vec<T>> {
        let size = size.max(1);
        self.derive("Batched", move |it, _| Box::new(BatchIter { it, size }))
    }

    /// Attach the global record index: `(index, record)` in partition order.
    ///
    /// ```text
    /// parallelize(["a","b","c","d"], 3).enumerate() == [(0,"a"),(1,"b"),(2,"c"),(3,"d")]
    /// ```
    #[track_caller]
    pub fn enumerate(&self) -> Result<Dataset<(u64, T)>> {
        let mut starts = vec![0u64];
        if self.num_splits() > 1 {
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
            for n in &counts[..counts.len() - 1] {
                starts.push(starts[starts.len() - 1] + n);
            }
        }
        Ok(self.enumerate_partitions(move |idx, it| {
            let mut next = starts[idx];
            Box::new(it.map(move |r| {
                r.map(|v| {
                    let i = next;
                    next += 1;
                    (i, v)
                })
            }))
        }))
    }
}

/// Fallible 1-to-N transform iterator with quota accounting.
struct QuotaIter<T, U, F> {
    inner: PartIter<T>,
    f: F,
    quota: ErrorQuota,
    buf: VecDeque<U>,
    finished: bool,
}

impl<T, U, F> QuotaIter<T, U, F> {
    fn new(inner: PartIter<T>, f: F, quota: ErrorQuota) -> Self {
        Self {
            inner,
            f,
            quota,
            buf: VecDeque::new(),
            finished: false,
        }
    }
}

impl<T, U, F> Iterator for QuotaIter<T, U, F>
where
    F: Fn(T) -> Result<Vec<U>>,
{
    type Item = Result<U>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(v) = self.buf.pop_front() {
                return Some(Ok(v));
            }
            if self.finished {
                return None;
            }
            match self.inner.next() {
                None => {
                    self.finished = true;
                    if let Err(e) = self.quota.finish() {
                        return Some(Err(e));
                    }
                    return None;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(v)) => {
                    self.quota.saw_record();
                    match (self.f)(v) {
                        Ok(vs) => self.buf.extend(vs),
                        Err(e) => {
                            if let Err(fatal) = self.quota.record_error(e) {
                                self.finished = true;
                                return Some(Err(fatal));
                            }
                        }
                    }
                }
            }
        }
    }
}

struct BatchIter<T> {
    it: PartIter<T>,
    size: usize,
}

impl<T> Iterator for BatchIter<T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::with_capacity(self.size);
        for r in self.it.by_ref() {
            match r {
                Ok(v) => {
                    chunk.push(v);
                    if chunk.len() == self.size {
                        return Some(Ok(chunk));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}
