//! Keyed operators over `Dataset<(K, V)>`.
//!
//! Everything here routes through `combine_by_key`, the single entry to the
//! shuffle boundary: it picks a partition count, optionally runs the
//! skew-mitigation sampling pass, and hands the parent to a shuffled
//! dataset. Value-side transforms (`map_values`, `flat_map_values`) preserve
//! the parent's partitioner so downstream cogroups can take narrow edges.

use crate::dataset::{Data, Dataset, Key};
use crate::partitioner::{HashPartitioner, Part};
use crate::scheduler;
use crate::shuffle::aggregator::{Aggregator, HeapEntry, group_by_aggregator, heap_aggregator};
use crate::shuffle::shuffled::{shuffle_dataset, stream_shuffle_dataset};
use crate::shuffle::sorted::ValueStream;
use crate::sketch::TDigest;
use crate::utils::portable_hash;
use anyhow::{Result, anyhow};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// Options shared by the shuffle-backed keyed operators.
#[derive(Clone, Debug, Default)]
pub struct ShuffleOpts {
    /// Reduce partition count; defaults to
    /// `min(default_min_splits, parent splits)`.
    pub num_splits: Option<usize>,
    /// Task memory hint for the reducer side, MiB.
    pub task_memory: Option<u64>,
    /// When positive, sample the input at this rate and seed the hash
    /// partitioner with quantile thresholds of the key-hash distribution.
    pub fix_skew: f64,
    /// Override the configured shuffle mode.
    pub sort_shuffle: Option<bool>,
}

impl ShuffleOpts {
    /// Convenience: just a partition count.
    pub fn splits(n: usize) -> Self {
        Self {
            num_splits: Some(n),
            ..Default::default()
        }
    }
}

impl<T: Data> Dataset<T> {
    /// Approximate quantiles of `f(record)` at percentile `offsets`
    /// (0..100), optionally over a sampled subset.
    pub fn percentiles(
        &self,
        offsets: &[f64],
        sample_rate: f64,
        f: impl Fn(&T) -> f64 + Send + Sync + 'static,
    ) -> Result<Vec<f64>> {
        if sample_rate <= 0.0 {
            return Err(anyhow!("sample rate must be positive"));
        }
        let source = if sample_rate >= 1.0 {
            self.clone()
        } else {
            self.sample(sample_rate, false, 12345)
        };
        let digests = scheduler::run_job(
            &source,
            move |_idx, it| {
                let mut d = TDigest::default();
                for r in it {
                    d.add(f(&r?));
                }
                d.compress();
                Ok(d)
            },
            None,
        )?;
        let mut merged = TDigest::default();
        for d in &digests {
            merged.merge(d);
        }
        if merged.count() == 0.0 {
            return Ok(Vec::new());
        }
        Ok(offsets
            .iter()
            .map(|p| merged.quantile(p / 100.0))
            .collect())
    }

    /// Group records by a derived key.
    #[track_caller]
    pub fn group_by<K: Key>(
        &self,
        f: impl Fn(&T) -> K + Send + Sync + 'static,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, Vec<T>)>> {
        self.map(move |v| (f(&v), v)).group_by_key(opts)
    }
}

impl<T: Key> Dataset<T> {
    /// Distinct records.
    #[track_caller]
    pub fn uniq(&self, opts: ShuffleOpts) -> Result<Dataset<T>> {
        Ok(self
            .map(|v| (v, ()))
            .reduce_by_key(|a, _| a, opts)?
            .map(|(k, ())| k))
    }

    /// The `n` most frequent records with their counts, descending.
    pub fn hot(&self, n: usize, opts: ShuffleOpts) -> Result<Vec<(T, i64)>> {
        self.map(|v| (v, 1i64))
            .reduce_by_key(|a, b| a + b, opts)?
            .top_by(n, |(_, count)| *count, false)
    }
}

impl<K: Key, V: Data> Dataset<(K, V)> {
    /// The partitioner this dataset is keyed by, if any.
    pub fn partitioner(&self) -> Option<Arc<Part<K>>> {
        self.part.clone()?.downcast::<Part<K>>().ok()
    }

    /// Transform values, preserving the partitioner.
    #[track_caller]
    pub fn map_values<U: Data>(&self, f: impl Fn(V) -> U + Send + Sync + 'static) -> Dataset<(K, U)> {
        let f = Arc::new(f);
        let mut ds = self.derive("MappedValues", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(it.map(move |r| r.map(|(k, v)| (k, f(v)))))
        });
        ds.part = self.part.clone();
        ds
    }

    /// Expand values, preserving the partitioner.
    #[track_caller]
    pub fn flat_map_values<U: Data>(
        &self,
        f: impl Fn(V) -> Vec<U> + Send + Sync + 'static,
    ) -> Dataset<(K, U)> {
        let f = Arc::new(f);
        let mut ds = self.derive("FlatMappedValues", move |it, _| {
            let f = Arc::clone(&f);
            Box::new(
                it.map(move |r| match r {
                    Ok((k, v)) => f(v)
                        .into_iter()
                        .map(|u| Ok((k.clone(), u)))
                        .collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
                .flatten(),
            )
        });
        ds.part = self.part.clone();
        ds
    }

    fn default_splits(&self, requested: Option<usize>) -> usize {
        let cfg_min = self.context().config().default_min_splits;
        requested
            .unwrap_or_else(|| cfg_min.min(self.num_splits().max(1)))
            .max(1)
    }

    /// Quantile thresholds over `portable_hash(key) % 2^32`, for the skew
    /// partitioner. `None` when sampling found nothing usable.
    pub(crate) fn skew_thresholds(&self, splits: usize, rate: f64) -> Result<Option<Vec<u32>>> {
        if rate <= 0.0 || splits <= 1 {
            return Ok(None);
        }
        let offsets: Vec<f64> = (1..splits)
            .map(|i| 100.0 * i as f64 / splits as f64)
            .collect();
        let percentiles = self.percentiles(&offsets, rate, |(k, _)| {
            (portable_hash(k) % (1u64 << 32)) as f64
        })?;
        if percentiles.is_empty() {
            return Ok(None);
        }
        let mut thresholds: Vec<u32> = Vec::new();
        for p in percentiles {
            if p.is_nan() {
                continue;
            }
            let p = (p.ceil().max(0.0) as u64).min(u64::from(u32::MAX)) as u32;
            if thresholds.last().is_none_or(|t| p > *t) {
                thresholds.push(p);
            }
        }
        if thresholds.is_empty() {
            return Ok(None);
        }
        if thresholds.len() + 1 < splits {
            log::warn!("highly skewed dataset detected");
        }
        Ok(Some(thresholds))
    }

    /// The hash partitioner for a shuffle under `opts`, skew-adjusted when
    /// requested.
    pub(crate) fn shuffle_partitioner(&self, opts: &ShuffleOpts) -> Result<Part<K>> {
        let splits = self.default_splits(opts.num_splits);
        if opts.fix_skew > 0.0
            && splits > 1
            && let Some(thresholds) = self.skew_thresholds(splits, opts.fix_skew)?
        {
            return Ok(Part::Hash(HashPartitioner::with_thresholds(thresholds)));
        }
        Ok(Part::Hash(HashPartitioner::new(splits)))
    }

    /// Shuffle through an aggregator: the root of every keyed reduction.
    #[track_caller]
    pub fn combine_by_key<C: Data>(
        &self,
        aggregator: Aggregator<V, C>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, C)>> {
        let part = self.shuffle_partitioner(&opts)?;
        let ds = shuffle_dataset(self, aggregator, part, opts.sort_shuffle);
        Ok(match opts.task_memory {
            Some(mem) => ds.with_mem(mem),
            None => ds,
        })
    }

    /// Shuffle through an explicit partitioner.
    #[track_caller]
    pub fn combine_by_key_with<C: Data>(
        &self,
        aggregator: Aggregator<V, C>,
        part: Part<K>,
        sort_shuffle: Option<bool>,
    ) -> Dataset<(K, C)> {
        shuffle_dataset(self, aggregator, part, sort_shuffle)
    }

    /// Merge values per key with an associative function.
    #[track_caller]
    pub fn reduce_by_key(
        &self,
        f: impl Fn(V, V) -> V + Send + Sync + 'static,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, V)>> {
        self.combine_by_key(Aggregator::from_reduce(f), opts)
    }

    /// Collect values per key, in mapper-id then mapper-record order.
    #[track_caller]
    pub fn group_by_key(&self, opts: ShuffleOpts) -> Result<Dataset<(K, Vec<V>)>> {
        self.combine_by_key(group_by_aggregator(), opts)
    }

    /// Like [`group_by_key`](Self::group_by_key) but yields single-pass value
    /// streams; each must be fully consumed before the next key.
    #[track_caller]
    pub fn group_by_key_iter(&self, opts: ShuffleOpts) -> Result<Dataset<(K, ValueStream<V>)>> {
        let part = self.shuffle_partitioner(&opts)?;
        let ds = stream_shuffle_dataset(self, part, opts.sort_shuffle);
        Ok(match opts.task_memory {
            Some(mem) => ds.with_mem(mem),
            None => ds,
        })
    }

    /// Group, then re-emit each value under its key: co-locates equal keys
    /// without changing the record shape.
    #[track_caller]
    pub fn partition_by_key(&self, opts: ShuffleOpts) -> Result<Dataset<(K, V)>> {
        Ok(self.group_by_key(opts)?.flat_map_values(|vs| vs))
    }

    /// Top `n` values per key under a derived ordering. Values come back
    /// sorted ascending, or descending with `reverse`; ties resolve to the
    /// record seen first.
    #[track_caller]
    pub fn top_by_key_by<O: Key>(
        &self,
        n: usize,
        order: impl Fn(&V) -> O + Send + Sync + 'static,
        reverse: bool,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, Vec<V>)>> {
        let order = Arc::new(order);
        let tagged = self.enumerate_partitions(move |split_idx, it| {
            let order = Arc::clone(&order);
            let mut seq = 0i64;
            Box::new(it.map(move |r| {
                r.map(|(k, v)| {
                    let tie = (split_idx as i64, seq);
                    seq += 1;
                    let entry = HeapEntry::new(order(&v), tie, v, reverse);
                    (k, entry)
                })
            }))
        });
        let combined = tagged.combine_by_key(heap_aggregator(n), opts)?;
        Ok(combined.map_values(move |heap| {
            let mut entries: Vec<HeapEntry<O, V>> =
                heap.into_iter().map(|Reverse(e)| e).collect();
            entries.sort();
            entries.into_iter().map(|e| e.value).collect()
        }))
    }

    /// Top `n` values per key by the values' own ordering.
    #[track_caller]
    pub fn top_by_key(&self, n: usize, reverse: bool, opts: ShuffleOpts) -> Result<Dataset<(K, Vec<V>)>>
    where
        V: Key,
    {
        self.top_by_key_by(n, |v| v.clone(), reverse, opts)
    }

    /// Overlay `other` on this dataset: keys present in `other` take its
    /// value. With `replace_only`, keys only present in `other` are dropped.
    #[track_caller]
    pub fn update(
        &self,
        other: &Dataset<(K, V)>,
        replace_only: bool,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, V)>> {
        let tagged = self
            .map_values(|v| (v, 1u8))
            .union(&[other.map_values(|v| (v, 2u8))]);
        let reduced = tagged.reduce_by_key(
            |a, b| {
                let value = if b.1 > a.1 { b.0 } else { a.0 };
                (value, a.1 | b.1)
            },
            opts,
        )?;
        let merged = if replace_only {
            reduced.filter(|kv| kv.1.1 != 2)
        } else {
            reduced
        };
        Ok(merged.map_values(|(v, _)| v))
    }

    /// Reduce by key into a driver-side map, merging partition maps locally.
    pub fn reduce_by_key_to_driver(
        &self,
        f: impl Fn(V, V) -> V + Send + Sync + 'static,
    ) -> Result<HashMap<K, V>> {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        let maps = scheduler::run_job(
            self,
            move |_idx, it| {
                let mut m: HashMap<K, V> = HashMap::new();
                for r in it {
                    let (k, v) = r?;
                    let next = match m.remove(&k) {
                        Some(a) => g(a, v),
                        None => v,
                    };
                    m.insert(k, next);
                }
                Ok(m)
            },
            None,
        )?;
        let mut out: HashMap<K, V> = HashMap::new();
        for m in maps {
            for (k, v) in m {
                let next = match out.remove(&k) {
                    Some(a) => f(a, v),
                    None => v,
                };
                out.insert(k, next);
            }
        }
        Ok(out)
    }

    /// Collect into a map; later partitions win on duplicate keys.
    pub fn collect_as_map(&self) -> Result<HashMap<K, V>> {
        Ok(self.collect()?.into_iter().collect())
    }

    /// Find one value for `key`. With a partitioner only the owning
    /// partition is scanned.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        if let Some(part) = self.partitioner() {
            let index = part.partition(key);
            let key = key.clone();
            let results = scheduler::run_job(
                self,
                move |_idx, it| {
                    for r in it {
                        let (k, v) = r?;
                        if k == key {
                            return Ok(Some(v));
                        }
                    }
                    Ok(None)
                },
                Some(vec![index]),
            )?;
            return Ok(results.into_iter().flatten().next());
        }
        log::warn!("lookup without a partitioner scans every partition");
        let key = key.clone();
        let found = self.filter(move |(k, _)| *k == key).take(1)?;
        Ok(found.into_iter().next().map(|(_, v)| v))
    }

    /// Approximate per-key quantiles of `value(v)` at percentile `offsets`.
    #[track_caller]
    pub fn percentiles_by_key(
        &self,
        offsets: Vec<f64>,
        sample_rate: f64,
        value: impl Fn(&V) -> f64 + Send + Sync + 'static,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, Vec<f64>)>> {
        if sample_rate <= 0.0 {
            return Err(anyhow!("sample rate must be positive"));
        }
        let source = if sample_rate >= 1.0 {
            self.clone()
        } else {
            self.sample(sample_rate, false, 12345)
        };
        let value = Arc::new(value);
        let v2 = Arc::clone(&value);
        let aggregator = Aggregator::<V, TDigest>::new(
            move |v| {
                let mut d = TDigest::default();
                d.add(value(&v));
                d
            },
            move |mut d, v| {
                d.add(v2(&v));
                d
            },
            |mut a, b| {
                a.merge(&b);
                a
            },
        );
        Ok(source
            .combine_by_key(aggregator, opts)?
            .map_values(move |mut d| offsets.iter().map(|p| d.quantile(p / 100.0)).collect()))
    }
}
