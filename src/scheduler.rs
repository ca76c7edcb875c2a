//! Local job runner.
//!
//! The engine core delegates job execution to a scheduler with the contract
//! `run_job(dataset, partition_fn, partition_indices?) -> per-partition
//! results`. This module provides the in-process implementation: tasks run
//! in parallel on the rayon pool, one blocking iterator per task, and results
//! come back in partition order. A distributed scheduler would honour
//! `preferred_locations` and retry failed tasks; locally both are moot.

use crate::dataset::{Data, Dataset, PartIter};
use crate::split::Split;
use anyhow::{Result, anyhow};
use rayon::prelude::*;
use std::sync::Arc;

/// Run `f` over the selected partitions of `ds`, in parallel, returning the
/// per-partition results in partition order.
pub fn run_job<T, U, F>(ds: &Dataset<T>, f: F, partitions: Option<Vec<usize>>) -> Result<Vec<U>>
where
    T: Data,
    U: Send,
    F: Fn(usize, PartIter<T>) -> Result<U> + Send + Sync,
{
    let splits = ds.splits();
    let selected: Vec<Arc<dyn Split>> = match partitions {
        None => splits,
        Some(idxs) => {
            let mut sel = Vec::with_capacity(idxs.len());
            for i in idxs {
                let sp = splits
                    .get(i)
                    .ok_or_else(|| anyhow!("partition {i} out of range ({} splits)", splits.len()))?;
                sel.push(Arc::clone(sp));
            }
            sel
        }
    };

    selected
        .into_par_iter()
        .map(|split| {
            let it = ds.iterator(&split)?;
            f(split.index(), it)
        })
        .collect()
}
