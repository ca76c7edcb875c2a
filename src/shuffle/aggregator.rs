//! Aggregators: the three-function fold driving every shuffle.
//!
//! An [`Aggregator`] is a triple of pure functions `(create, merge_value,
//! merge_combiners)` plus `aggregate_sorted` for folding key-sorted runs on
//! the sort-shuffle path. The named variants carry a [`AggKind`] marker so
//! the reducer can pick the right merger (group-by aggregation preserves
//! arrival order per key).

use crate::dataset::Data;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// How the reducer should treat this aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    /// Arbitrary user fold.
    Plain,
    /// `C = Vec<V>` accumulating values in arrival order.
    GroupBy,
    /// Concatenating fold used by the local-sort shuffle path.
    Merge,
    /// Bounded top-k heap.
    Heap,
}

/// Associative reduction of values `V` into combiners `C`.
pub struct Aggregator<V, C> {
    pub kind: AggKind,
    pub create: Arc<dyn Fn(V) -> C + Send + Sync>,
    pub merge_value: Arc<dyn Fn(C, V) -> C + Send + Sync>,
    pub merge_combiners: Arc<dyn Fn(C, C) -> C + Send + Sync>,
}

impl<V, C> Clone for Aggregator<V, C> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            create: Arc::clone(&self.create),
            merge_value: Arc::clone(&self.merge_value),
            merge_combiners: Arc::clone(&self.merge_combiners),
        }
    }
}

impl<V: Data, C: Data> Aggregator<V, C> {
    pub fn new(
        create: impl Fn(V) -> C + Send + Sync + 'static,
        merge_value: impl Fn(C, V) -> C + Send + Sync + 'static,
        merge_combiners: impl Fn(C, C) -> C + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: AggKind::Plain,
            create: Arc::new(create),
            merge_value: Arc::new(merge_value),
            merge_combiners: Arc::new(merge_combiners),
        }
    }

    /// Fold a key-sorted run into one combiner per key.
    pub fn aggregate_sorted<K: Data + Eq>(&self, run: Vec<(K, V)>) -> Vec<(K, C)> {
        let mut out: Vec<(K, C)> = Vec::new();
        for (k, v) in run {
            if out.last().is_some_and(|(lk, _)| *lk == k) {
                let (k0, c) = out.pop().expect("checked non-empty");
                out.push((k0, (self.merge_value)(c, v)));
            } else {
                out.push((k, (self.create)(v)));
            }
        }
        out
    }
}

impl<V: Data> Aggregator<V, V> {
    /// Aggregator from a plain reduce function (`reduce_by_key`).
    pub fn from_reduce(f: impl Fn(V, V) -> V + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        Self {
            kind: AggKind::Plain,
            create: Arc::new(|v| v),
            merge_value: Arc::new(move |c, v| f(c, v)),
            merge_combiners: Arc::new(move |a, b| g(a, b)),
        }
    }
}

/// `C = Vec<V>`, values kept in arrival order.
pub fn group_by_aggregator<V: Data>() -> Aggregator<V, Vec<V>> {
    Aggregator {
        kind: AggKind::GroupBy,
        create: Arc::new(|v| vec![v]),
        merge_value: Arc::new(|mut c: Vec<V>, v| {
            c.push(v);
            c
        }),
        merge_combiners: Arc::new(|mut a: Vec<V>, b| {
            a.extend(b);
            a
        }),
    }
}

/// Concatenating aggregator for the sort path: combiners are value runs that
/// the reduce side must preserve and concatenate unchanged.
pub fn merge_aggregator<V: Data>() -> Aggregator<V, Vec<V>> {
    Aggregator {
        kind: AggKind::Merge,
        ..group_by_aggregator()
    }
}

/// Heap entry for the bounded top-k aggregator: ordered by `(order, tie)`,
/// never by the value itself.
#[derive(Clone, Debug)]
pub struct HeapEntry<O, V> {
    pub order: O,
    /// `(split_index, record_index)`, sign-flipped under `reverse` so ties
    /// stay stable in either direction.
    pub tie: (i64, i64),
    pub value: V,
    reverse: bool,
}

impl<O: Ord, V> HeapEntry<O, V> {
    pub fn new(order: O, tie: (i64, i64), value: V, reverse: bool) -> Self {
        let tie = if reverse { (-tie.0, -tie.1) } else { tie };
        Self {
            order,
            tie,
            value,
            reverse,
        }
    }
}

impl<O: Ord, V> PartialEq for HeapEntry<O, V> {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.tie == other.tie
    }
}

impl<O: Ord, V> Eq for HeapEntry<O, V> {}

impl<O: Ord, V> PartialOrd for HeapEntry<O, V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<O: Ord, V> Ord for HeapEntry<O, V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ord = (&self.order, self.tie).cmp(&(&other.order, other.tie));
        if self.reverse { ord.reverse() } else { ord }
    }
}

/// Bounded min-heap keeping the best `k` entries.
pub type BoundedHeap<O, V> = BinaryHeap<Reverse<HeapEntry<O, V>>>;

fn trim<O: Ord + Clone, V: Clone>(heap: &mut BoundedHeap<O, V>, k: usize) {
    while heap.len() > k {
        heap.pop();
    }
}

/// Aggregator retaining the top `k` values per key under the entry order.
pub fn heap_aggregator<O, V>(k: usize) -> Aggregator<HeapEntry<O, V>, BoundedHeap<O, V>>
where
    O: Data + Ord,
    V: Data,
{
    Aggregator {
        kind: AggKind::Heap,
        create: Arc::new(move |e| {
            let mut h = BinaryHeap::new();
            h.push(Reverse(e));
            h
        }),
        merge_value: Arc::new(move |mut h: BoundedHeap<O, V>, e| {
            h.push(Reverse(e));
            trim(&mut h, k);
            h
        }),
        merge_combiners: Arc::new(move |mut a: BoundedHeap<O, V>, b| {
            a.extend(b);
            trim(&mut a, k);
            a
        }),
    }
}
