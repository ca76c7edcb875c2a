//! Hash-merge reducers.
//!
//! In hash-merge mode the fetcher delivers pre-aggregated `(key, combiner)`
//! entries per map task; the reducer folds them with `merge_combiners`. The
//! plain merger uses a hash map (bucket order, unspecified); the ordered
//! variant additionally preserves key insertion order — and therefore, for
//! group-by combiners, per-key value order of mapper-id ascending then
//! per-mapper record order.

use crate::dataset::{Data, Key};
use std::collections::HashMap;
use std::sync::Arc;

type MergeFn<C> = Arc<dyn Fn(C, C) -> C + Send + Sync>;

/// Unordered hash merger.
pub(crate) struct Merger<K, C> {
    map: HashMap<K, C>,
    merge: MergeFn<C>,
}

impl<K: Key, C: Data> Merger<K, C> {
    pub(crate) fn new(merge: MergeFn<C>) -> Self {
        Self {
            map: HashMap::new(),
            merge,
        }
    }

    pub(crate) fn insert(&mut self, key: K, combiner: C) {
        let next = match self.map.remove(&key) {
            Some(prev) => (self.merge)(prev, combiner),
            None => combiner,
        };
        self.map.insert(key, next);
    }

    pub(crate) fn extend(&mut self, entries: &[(K, C)]) {
        for (k, c) in entries {
            self.insert(k.clone(), c.clone());
        }
    }

    pub(crate) fn into_entries(self) -> Vec<(K, C)> {
        self.map.into_iter().collect()
    }
}

/// Hash merger preserving key insertion order.
pub(crate) struct OrderedMerger<K, C> {
    index: HashMap<K, usize>,
    entries: Vec<(K, C)>,
    merge: MergeFn<C>,
}

impl<K: Key, C: Data> OrderedMerger<K, C> {
    pub(crate) fn new(merge: MergeFn<C>) -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
            merge,
        }
    }

    pub(crate) fn insert(&mut self, key: K, combiner: C) {
        match self.index.get(&key) {
            Some(&at) => {
                let prev = self.entries[at].1.clone();
                self.entries[at].1 = (self.merge)(prev, combiner);
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, combiner));
            }
        }
    }

    pub(crate) fn extend(&mut self, entries: &[(K, C)]) {
        for (k, c) in entries {
            self.insert(k.clone(), c.clone());
        }
    }

    pub(crate) fn into_entries(self) -> Vec<(K, C)> {
        self.entries
    }
}

/// Hash merger for a two-parent cogroup: each key maps to a pair of
/// per-parent value lists, keys in insertion order.
pub(crate) struct CoGroupMerger<K, V, W> {
    index: HashMap<K, usize>,
    entries: Vec<(K, (Vec<V>, Vec<W>))>,
}

impl<K: Key, V: Data, W: Data> CoGroupMerger<K, V, W> {
    pub(crate) fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, key: &K) -> &mut (Vec<V>, Vec<W>) {
        let at = match self.index.get(key) {
            Some(&at) => at,
            None => {
                let at = self.entries.len();
                self.index.insert(key.clone(), at);
                self.entries.push((key.clone(), (Vec::new(), Vec::new())));
                at
            }
        };
        &mut self.entries[at].1
    }

    pub(crate) fn push_lefts(&mut self, key: &K, values: Vec<V>) {
        self.entry(key).0.extend(values);
    }

    pub(crate) fn push_rights(&mut self, key: &K, values: Vec<W>) {
        self.entry(key).1.extend(values);
    }

    pub(crate) fn into_entries(self) -> Vec<(K, (Vec<V>, Vec<W>))> {
        self.entries
    }
}
