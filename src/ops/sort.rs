//! Two-pass global sort.
//!
//! Each parent split contributes a handful of leading records as key
//! samples; the sorted samples' quantiles become the boundaries of a range
//! partitioner, records shuffle through a merge aggregator, and each output
//! partition sorts locally. An empty or single-split parent short-circuits
//! to a local sort.

use crate::dataset::{Data, Dataset, Key, PartIter};
use crate::partitioner::{Part, RangePartitioner};
use crate::shuffle::aggregator::merge_aggregator;
use anyhow::Result;
use std::sync::Arc;

impl<T: Data> Dataset<T> {
    /// Globally sort by a derived key.
    #[track_caller]
    pub fn sort_by<S: Key>(
        &self,
        key: impl Fn(&T) -> S + Send + Sync + 'static,
        reverse: bool,
        num_splits: Option<usize>,
    ) -> Result<Dataset<T>> {
        let key = Arc::new(key);
        let parent_splits = self.num_splits();
        if parent_splits == 0 {
            return Ok(self.clone());
        }

        let sort_key = Arc::clone(&key);
        let local_sort = move |it: PartIter<T>| -> PartIter<T> {
            let sort_key = Arc::clone(&sort_key);
            match it.collect::<Result<Vec<T>>>() {
                Err(e) => Box::new(std::iter::once(Err(e))),
                Ok(mut records) => {
                    records.sort_by(|a, b| {
                        let ord = sort_key(a).cmp(&sort_key(b));
                        if reverse { ord.reverse() } else { ord }
                    });
                    Box::new(records.into_iter().map(Ok))
                }
            }
        };

        if parent_splits == 1 {
            return Ok(self.map_partitions(local_sort));
        }

        let n = num_splits
            .unwrap_or_else(|| {
                self.context()
                    .config()
                    .default_min_splits
                    .min(parent_splits)
            })
            .max(1);

        // Leading samples from every split seed the range boundaries.
        let per_split = (n * 10 / parent_splits).max(1);
        let sample_key = Arc::clone(&key);
        let mut samples: Vec<S> = self
            .map_partitions(move |it| {
                let sample_key = Arc::clone(&sample_key);
                Box::new(it.take(per_split).map(move |r| r.map(|v| sample_key(&v))))
            })
            .collect()?;
        samples.sort();
        if reverse {
            samples.reverse();
        }
        let boundaries: Vec<S> = samples
            .into_iter()
            .skip(5)
            .step_by(10)
            .take(n.saturating_sub(1))
            .collect();

        let part = Part::Range(RangePartitioner::new(boundaries, reverse));
        let pair_key = Arc::clone(&key);
        let shuffled = self
            .map(move |v| (pair_key(&v), v))
            .combine_by_key_with(merge_aggregator(), part, None);
        Ok(shuffled
            .flat_map(|(_k, run)| run)
            .map_partitions(local_sort))
    }

    /// Globally sort by the records' own ordering.
    ///
    /// ```text
    /// parallelize([5,2,8,1,4], 2).sort() == [1,2,4,5,8]
    /// ```
    #[track_caller]
    pub fn sort(&self, reverse: bool, num_splits: Option<usize>) -> Result<Dataset<T>>
    where
        T: Key,
    {
        self.sort_by(|v| v.clone(), reverse, num_splits)
    }
}
