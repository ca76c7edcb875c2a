//! Sort-merge reducers: k-way merge over key-sorted runs.
//!
//! Each map task contributes one key-sorted run; the reducer merges them
//! with a min-heap on `(key, run index)`, so entries for equal keys pop in
//! mapper-id order. On top of the raw merge sit the three consumers: fold to
//! one combiner per key, group into per-key value streams, and the
//! merge-join used by the sorted cogroup.

use crate::dataset::Data;
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Head of one run in the merge heap.
struct RunHead<K, C> {
    key: K,
    run: usize,
    combiner: C,
}

impl<K: Ord, C> PartialEq for RunHead<K, C> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl<K: Ord, C> Eq for RunHead<K, C> {}

impl<K: Ord, C> PartialOrd for RunHead<K, C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, C> Ord for RunHead<K, C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.key, self.run).cmp(&(&other.key, other.run))
    }
}

/// K-way merge yielding, per key, the combiners from every run holding that
/// key, in run order.
pub(crate) struct KWayMerge<K: Ord, C> {
    heap: BinaryHeap<Reverse<RunHead<K, C>>>,
    runs: Vec<std::vec::IntoIter<(K, C)>>,
}

impl<K: Ord, C> KWayMerge<K, C> {
    pub(crate) fn new(runs: Vec<Vec<(K, C)>>) -> Self {
        let mut runs: Vec<_> = runs.into_iter().map(|r| r.into_iter()).collect();
        let mut heap = BinaryHeap::new();
        for (i, run) in runs.iter_mut().enumerate() {
            if let Some((key, combiner)) = run.next() {
                heap.push(Reverse(RunHead {
                    key,
                    run: i,
                    combiner,
                }));
            }
        }
        Self { heap, runs }
    }

    fn refill(&mut self, run: usize) {
        if let Some((key, combiner)) = self.runs[run].next() {
            self.heap.push(Reverse(RunHead {
                key,
                run,
                combiner,
            }));
        }
    }

    /// All combiners for the smallest remaining key, in run order.
    pub(crate) fn next_key(&mut self) -> Option<(K, Vec<C>)> {
        let Reverse(head) = self.heap.pop()?;
        let key = head.key;
        let mut combiners = vec![head.combiner];
        self.refill(head.run);
        while let Some(Reverse(peek)) = self.heap.peek() {
            if peek.key != key {
                break;
            }
            let Reverse(head) = self.heap.pop().expect("peeked");
            combiners.push(head.combiner);
            self.refill(head.run);
        }
        Some((key, combiners))
    }
}

/// Sorted merge folding all of a key's combiners into one.
pub(crate) struct SortedMerger<K: Ord, C> {
    merge: Arc<dyn Fn(C, C) -> C + Send + Sync>,
    inner: KWayMerge<K, C>,
}

impl<K: Ord, C> SortedMerger<K, C> {
    pub(crate) fn new(
        runs: Vec<Vec<(K, C)>>,
        merge: Arc<dyn Fn(C, C) -> C + Send + Sync>,
    ) -> Self {
        Self {
            merge,
            inner: KWayMerge::new(runs),
        }
    }
}

impl<K: Ord, C> Iterator for SortedMerger<K, C> {
    type Item = Result<(K, C)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, combiners) = self.inner.next_key()?;
        let mut it = combiners.into_iter();
        let first = it.next()?;
        let combined = it.fold(first, |a, b| (self.merge)(a, b));
        Some(Ok((key, combined)))
    }
}

/// Cloneable, single-pass stream over the per-run value segments of one key.
///
/// The caller must fully consume a key's stream before advancing to the next
/// key; the stream is not restartable.
pub struct ValueStream<V> {
    segments: Arc<Vec<Vec<V>>>,
    seg: usize,
    pos: usize,
}

impl<V> Clone for ValueStream<V> {
    fn clone(&self) -> Self {
        Self {
            segments: Arc::clone(&self.segments),
            seg: self.seg,
            pos: self.pos,
        }
    }
}

impl<V> ValueStream<V> {
    pub(crate) fn new(segments: Vec<Vec<V>>) -> Self {
        Self {
            segments: Arc::new(segments),
            seg: 0,
            pos: 0,
        }
    }

    pub(crate) fn single(values: Vec<V>) -> Self {
        Self::new(vec![values])
    }

    /// Total number of values without consuming the stream.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Iterator for ValueStream<V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let seg = self.segments.get(self.seg)?;
            match seg.get(self.pos) {
                Some(v) => {
                    self.pos += 1;
                    return Some(v.clone());
                }
                None => {
                    self.seg += 1;
                    self.pos = 0;
                }
            }
        }
    }
}

/// Sorted merge yielding `(key, value stream)` per key, streams in run
/// order.
pub(crate) struct SortedGroupMerger<K: Ord, V> {
    inner: KWayMerge<K, Vec<V>>,
}

impl<K: Ord, V> SortedGroupMerger<K, V> {
    pub(crate) fn new(runs: Vec<Vec<(K, Vec<V>)>>) -> Self {
        Self {
            inner: KWayMerge::new(runs),
        }
    }
}

impl<K: Ord, V: Data> Iterator for SortedGroupMerger<K, V> {
    type Item = Result<(K, ValueStream<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, segments) = self.inner.next_key()?;
        Some(Ok((key, ValueStream::new(segments))))
    }
}

impl<V> Default for ValueStream<V> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Merge-join of two key-sorted grouped streams, for the sorted cogroup.
/// A key missing on one side joins against that side's empty payload.
pub(crate) struct MergeJoin<K: Ord, A, B> {
    left: std::iter::Peekable<std::vec::IntoIter<(K, A)>>,
    right: std::iter::Peekable<std::vec::IntoIter<(K, B)>>,
}

impl<K: Ord, A, B> MergeJoin<K, A, B> {
    pub(crate) fn new(left: Vec<(K, A)>, right: Vec<(K, B)>) -> Self {
        Self {
            left: left.into_iter().peekable(),
            right: right.into_iter().peekable(),
        }
    }
}

impl<K: Ord, A: Default, B: Default> Iterator for MergeJoin<K, A, B> {
    type Item = (K, (A, B));

    fn next(&mut self) -> Option<Self::Item> {
        use std::cmp::Ordering;
        match (self.left.peek(), self.right.peek()) {
            (None, None) => None,
            (Some(_), None) => {
                let (k, vs) = self.left.next()?;
                Some((k, (vs, B::default())))
            }
            (None, Some(_)) => {
                let (k, ws) = self.right.next()?;
                Some((k, (A::default(), ws)))
            }
            (Some((lk, _)), Some((rk, _))) => match lk.cmp(rk) {
                Ordering::Less => {
                    let (k, vs) = self.left.next()?;
                    Some((k, (vs, B::default())))
                }
                Ordering::Greater => {
                    let (k, ws) = self.right.next()?;
                    Some((k, (A::default(), ws)))
                }
                Ordering::Equal => {
                    let (k, vs) = self.left.next()?;
                    let (_, ws) = self.right.next()?;
                    Some((k, (vs, ws)))
                }
            },
        }
    }
}
