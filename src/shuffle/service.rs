//! In-process shuffle service.
//!
//! Implements both collaborator seams of the shuffle boundary. Map side: the
//! first task to touch a `shuffle_id` runs the whole map stage (in parallel
//! over map splits, guarded so it runs at most once per process), writing
//! per-reducer runs pre-aggregated with the reducer's aggregator — key-sorted
//! runs in sort mode. Reduce side: `fetch` replays each map task's run for
//! one reduce partition in mapper-id order; `get_iters` hands out the sorted
//! runs for the k-way merge.

use crate::dataset::{Data, Dataset, Key};
use crate::partitioner::Part;
use crate::shuffle::aggregator::Aggregator;
use anyhow::{Result, anyhow};
use rayon::prelude::*;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per map task: one run of `(key, combiner)` entries per reduce partition.
pub(crate) type MapOutputs<K, C> = Vec<Vec<Vec<(K, C)>>>;

type Slot = Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>;

/// Process-wide shuffle output store.
#[derive(Default)]
pub struct ShuffleService {
    entries: Mutex<HashMap<u64, Slot>>,
}

impl ShuffleService {
    fn slot(&self, shuffle_id: u64) -> Slot {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(entries.entry(shuffle_id).or_default())
    }

    /// Run the map stage for `shuffle_id` at most once, storing its outputs.
    pub(crate) fn ensure_map_stage<K: Key, V: Data, C: Data>(
        &self,
        shuffle_id: u64,
        parent: &Dataset<(K, V)>,
        aggregator: &Aggregator<V, C>,
        partitioner: &Part<K>,
        sort: bool,
    ) -> Result<Arc<MapOutputs<K, C>>> {
        let slot = self.slot(shuffle_id);
        let mut guard = slot.lock().unwrap();
        if guard.is_none() {
            let outputs = run_map_stage(parent, aggregator, partitioner, sort)?;
            log::debug!(
                "shuffle {shuffle_id}: map stage wrote {} map outputs x {} partitions",
                outputs.len(),
                partitioner.num_partitions()
            );
            *guard = Some(Arc::new(outputs));
        }
        let arc = guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("shuffle {shuffle_id} outputs vanished"))?;
        arc.downcast::<MapOutputs<K, C>>()
            .map_err(|_| anyhow!("shuffle {shuffle_id} outputs have unexpected type"))
    }

    fn get<K: Data, C: Data>(&self, shuffle_id: u64) -> Result<Arc<MapOutputs<K, C>>> {
        let slot = self.slot(shuffle_id);
        let guard = slot.lock().unwrap();
        let arc = guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("shuffle {shuffle_id} has not run its map stage"))?;
        arc.downcast::<MapOutputs<K, C>>()
            .map_err(|_| anyhow!("shuffle {shuffle_id} outputs have unexpected type"))
    }

    /// Hash-mode reduce fetch: the callback sees each map task's entries for
    /// `reduce`, in mapper-id order.
    pub(crate) fn fetch<K: Data, C: Data>(
        &self,
        shuffle_id: u64,
        reduce: usize,
        mut cb: impl FnMut(usize, &[(K, C)]),
    ) -> Result<()> {
        let outputs = self.get::<K, C>(shuffle_id)?;
        for (map_id, per_reduce) in outputs.iter().enumerate() {
            let run = per_reduce
                .get(reduce)
                .ok_or_else(|| anyhow!("reduce partition {reduce} out of range"))?;
            cb(map_id, run);
        }
        Ok(())
    }

    /// Sort-mode reduce fetch: one key-sorted run per map task.
    pub(crate) fn get_iters<K: Data, C: Data>(
        &self,
        shuffle_id: u64,
        reduce: usize,
    ) -> Result<Vec<Vec<(K, C)>>> {
        let outputs = self.get::<K, C>(shuffle_id)?;
        outputs
            .iter()
            .map(|per_reduce| {
                per_reduce
                    .get(reduce)
                    .cloned()
                    .ok_or_else(|| anyhow!("reduce partition {reduce} out of range"))
            })
            .collect()
    }
}

/// One map task per parent split: partition each record, pre-aggregate per
/// key, and (in sort mode) sort each run.
fn run_map_stage<K: Key, V: Data, C: Data>(
    parent: &Dataset<(K, V)>,
    aggregator: &Aggregator<V, C>,
    partitioner: &Part<K>,
    sort: bool,
) -> Result<MapOutputs<K, C>> {
    let n = partitioner.num_partitions();
    parent
        .splits()
        .into_par_iter()
        .map(|split| -> Result<Vec<Vec<(K, C)>>> {
            let mut buckets: Vec<HashMap<K, C>> = (0..n).map(|_| HashMap::new()).collect();
            for record in parent.iterator(&split)? {
                let (k, v) = record?;
                let bucket = &mut buckets[partitioner.partition(&k)];
                let combined = match bucket.remove(&k) {
                    Some(c) => (aggregator.merge_value)(c, v),
                    None => (aggregator.create)(v),
                };
                bucket.insert(k, combined);
            }
            Ok(buckets
                .into_iter()
                .map(|bucket| {
                    let mut run: Vec<(K, C)> = bucket.into_iter().collect();
                    if sort {
                        run.sort_by(|a, b| a.0.cmp(&b.0));
                    }
                    run
                })
                .collect())
        })
        .collect()
}
