//! Process-wide cache tracker for `should_cache` datasets.
//!
//! The tracker memoises materialized partitions keyed by
//! `(dataset id, split index)` and guarantees at most one concurrent build
//! per key: a second task asking for the same partition blocks on the
//! per-entry lock until the first build completes, then reads the memo.

use crate::dataset::PartIter;
use crate::utils::SharedVecIter;
use anyhow::{Result, anyhow};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Slot = Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>;

/// Memoised partition store.
#[derive(Default)]
pub struct CacheTracker {
    entries: Mutex<HashMap<(u64, usize), Slot>>,
}

impl CacheTracker {
    /// Hosts known to hold a cached copy of the partition. The in-process
    /// tracker has no placement information.
    pub fn cached_locs(&self, _dataset_id: u64, _split_index: usize) -> Vec<String> {
        Vec::new()
    }

    /// Return the memoised partition, computing and storing it on first use.
    pub fn get_or_compute<T: Clone + Send + Sync + 'static>(
        &self,
        key: (u64, usize),
        compute: impl FnOnce() -> Result<PartIter<T>>,
    ) -> Result<PartIter<T>> {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(entries.entry(key).or_default())
        };
        // The entry lock serializes concurrent builds of the same partition.
        let mut guard = slot.lock().unwrap();
        if guard.is_none() {
            let materialized: Vec<T> = compute()?.collect::<Result<_>>()?;
            *guard = Some(Arc::new(materialized));
        }
        let arc = guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("cache entry vanished"))?;
        drop(guard);
        let data = arc
            .downcast::<Vec<T>>()
            .map_err(|_| anyhow!("cached partition has unexpected type"))?;
        Ok(Box::new(SharedVecIter::new(data)))
    }

    /// Forget every cached partition of one dataset.
    pub fn evict(&self, dataset_id: u64) {
        self.entries
            .lock()
            .unwrap()
            .retain(|(id, _), _| *id != dataset_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn computes_once_and_memoises() -> Result<()> {
        let tracker = CacheTracker::default();
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            let out: Vec<i32> = tracker
                .get_or_compute((7, 0), || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(vec![1, 2, 3].into_iter().map(Ok)))
                })?
                .collect::<Result<_>>()?;
            assert_eq!(out, vec![1, 2, 3]);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
