//! Cogroup and the join family.
//!
//! The two-parent cogroup is the multi-parent shuffle: each parent whose
//! partitioner already equals the target consumes its co-partitioned splits
//! through a narrow edge; every other parent shuffles through a group-by
//! aggregator. The reducer assembles, per key, the pair of per-parent value
//! lists — hash-merged in insertion order, or merge-joined from key-sorted
//! runs in sort-shuffle mode. Joins dispatch over the cogroup output.

use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, Key, PartIter};
use crate::dependency::Dependency;
use crate::keyed::ShuffleOpts;
use crate::partitioner::{HashPartitioner, Part};
use crate::shuffle::aggregator::group_by_aggregator;
use crate::shuffle::merger::CoGroupMerger;
use crate::shuffle::sorted::{KWayMerge, MergeJoin, ValueStream};
use crate::split::{Split, index_splits};
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// How one cogroup parent feeds the reducer.
enum SideDep {
    /// Co-partitioned: read the parent's split directly.
    Narrow,
    /// Shuffled through a group-by aggregator under this shuffle id.
    Shuffle(u64),
}

pub struct CoGroupedDataset<K: Key, V: Data, W: Data> {
    core: DatasetCore,
    left: Dataset<(K, V)>,
    right: Dataset<(K, W)>,
    part: Arc<Part<K>>,
    left_dep: SideDep,
    right_dep: SideDep,
    sort_shuffle: bool,
}

fn side_dep<K: Key, V: Data>(ds: &Dataset<(K, V)>, part: &Part<K>) -> SideDep {
    match ds.partitioner() {
        Some(p) if *p == *part => SideDep::Narrow,
        _ => SideDep::Shuffle(ds.context().new_shuffle_id()),
    }
}

#[track_caller]
fn cogroup_datasets<K: Key, V: Data, W: Data>(
    left: &Dataset<(K, V)>,
    right: &Dataset<(K, W)>,
    part: Part<K>,
    sort_shuffle: Option<bool>,
) -> Dataset<(K, (Vec<V>, Vec<W>))> {
    let ctx = left.context();
    let part = Arc::new(part);
    let node = CoGroupedDataset {
        core: DatasetCore::derived(left.core()),
        left: left.clone(),
        right: right.clone(),
        left_dep: side_dep(left, &part),
        right_dep: side_dep(right, &part),
        part: Arc::clone(&part),
        sort_shuffle: sort_shuffle.unwrap_or(ctx.config().sort_shuffle),
    };
    let mut ds = Dataset::from_node(Arc::new(node));
    ds.part = Some(part as Arc<dyn Any + Send + Sync>);
    ds
}

impl<K: Key, V: Data, W: Data> CoGroupedDataset<K, V, W> {
    /// One side's grouped entries for a reduce partition: narrow parents are
    /// read and grouped locally, shuffled parents come from the service.
    /// In sorted mode the result is key-sorted.
    fn side_groups<T: Data>(
        &self,
        parent: &Dataset<(K, T)>,
        dep: &SideDep,
        reduce: usize,
        sorted: bool,
    ) -> Result<Vec<(K, Vec<T>)>> {
        let aggregator = group_by_aggregator::<T>();
        match dep {
            SideDep::Narrow => {
                let splits = parent.splits();
                let split = splits
                    .get(reduce)
                    .ok_or_else(|| anyhow!("co-partitioned parent lacks split {reduce}"))?;
                let mut records: Vec<(K, T)> =
                    parent.iterator(split)?.collect::<Result<_>>()?;
                if sorted {
                    records.sort_by(|a, b| a.0.cmp(&b.0));
                    Ok(aggregator.aggregate_sorted(records))
                } else {
                    // Group preserving arrival order.
                    let mut index: HashMap<K, usize> = HashMap::new();
                    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
                    for (k, v) in records {
                        match index.get(&k) {
                            Some(&at) => groups[at].1.push(v),
                            None => {
                                index.insert(k.clone(), groups.len());
                                groups.push((k, vec![v]));
                            }
                        }
                    }
                    Ok(groups)
                }
            }
            SideDep::Shuffle(id) => {
                let service = self.core.ctx.shuffle_service();
                service.ensure_map_stage(*id, parent, &aggregator, &self.part, sorted)?;
                let runs = service.get_iters::<K, Vec<T>>(*id, reduce)?;
                if sorted {
                    let mut merge = KWayMerge::new(runs);
                    let mut out: Vec<(K, Vec<T>)> = Vec::new();
                    while let Some((k, segments)) = merge.next_key() {
                        out.push((k, segments.into_iter().flatten().collect()));
                    }
                    Ok(out)
                } else {
                    let mut index: HashMap<K, usize> = HashMap::new();
                    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
                    for run in runs {
                        for (k, vs) in run {
                            match index.get(&k) {
                                Some(&at) => groups[at].1.extend(vs),
                                None => {
                                    index.insert(k.clone(), groups.len());
                                    groups.push((k, vs));
                                }
                            }
                        }
                    }
                    Ok(groups)
                }
            }
        }
    }
}

impl<K: Key, V: Data, W: Data> DatasetNode<(K, (Vec<V>, Vec<W>))> for CoGroupedDataset<K, V, W> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        let mut s = format!("<CoGrouped of {:?}, {:?}>", self.left, self.right);
        s.truncate(80);
        s
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        index_splits(self.part.num_partitions())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = Vec::new();
        for (parent, dep) in [
            (self.left.id(), &self.left_dep),
            (self.right.id(), &self.right_dep),
        ] {
            deps.push(match dep {
                SideDep::Narrow => Dependency::Narrow { parent },
                SideDep::Shuffle(id) => Dependency::Shuffle {
                    shuffle_id: *id,
                    parent,
                    partitions: self.part.num_partitions(),
                    sort_shuffle: self.sort_shuffle,
                    iter_values: false,
                },
            });
        }
        deps
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        let mut locs = Vec::new();
        if matches!(self.left_dep, SideDep::Narrow)
            && let Some(sp) = self.left.splits().get(split.index())
        {
            locs.extend(self.left.preferred_locations(sp));
        }
        if matches!(self.right_dep, SideDep::Narrow)
            && let Some(sp) = self.right.splits().get(split.index())
        {
            locs.extend(self.right.preferred_locations(sp));
        }
        locs
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<(K, (Vec<V>, Vec<W>))>> {
        let reduce = split.index();
        if self.sort_shuffle {
            let left = self.side_groups(&self.left, &self.left_dep, reduce, true)?;
            let right = self.side_groups(&self.right, &self.right_dep, reduce, true)?;
            return Ok(Box::new(MergeJoin::new(left, right).map(Ok)));
        }
        let left = self.side_groups(&self.left, &self.left_dep, reduce, false)?;
        let right = self.side_groups(&self.right, &self.right_dep, reduce, false)?;
        let mut merger = CoGroupMerger::<K, V, W>::new();
        for (k, vs) in left {
            merger.push_lefts(&k, vs);
        }
        for (k, ws) in right {
            merger.push_rights(&k, ws);
        }
        Ok(Box::new(merger.into_entries().into_iter().map(Ok)))
    }
}

impl<K: Key, V: Data> Dataset<(K, V)> {
    fn cogroup_partitioner(&self, opts: &ShuffleOpts) -> Result<Part<K>> {
        let splits = match opts.num_splits {
            Some(n) => n.max(1),
            None => match self.partitioner() {
                Some(p) => p.num_partitions(),
                None => self.context().config().default_parallelism,
            },
        };
        if opts.fix_skew > 0.0
            && splits > 1
            && let Some(thresholds) = self.skew_thresholds(splits, opts.fix_skew)?
        {
            return Ok(Part::Hash(HashPartitioner::with_thresholds(thresholds)));
        }
        Ok(Part::Hash(HashPartitioner::new(splits)))
    }

    /// Group this dataset with another by key: for every key, the pair of
    /// value lists from each side, each in its parent's mapper order.
    #[track_caller]
    pub fn cogroup<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (Vec<V>, Vec<W>))>> {
        let part = self.cogroup_partitioner(&opts)?;
        Ok(cogroup_datasets(self, other, part, opts.sort_shuffle))
    }

    /// Inner join over the shuffle.
    #[track_caller]
    pub fn join<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (V, W))>> {
        Ok(self.cogroup(other, opts)?.flat_map(|(k, (vs, ws))| {
            let mut out = Vec::with_capacity(vs.len() * ws.len());
            for v in &vs {
                for w in &ws {
                    out.push((k.clone(), (v.clone(), w.clone())));
                }
            }
            out
        }))
    }

    /// Left outer join: keys missing on the right get `None`.
    #[track_caller]
    pub fn left_outer_join<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (V, Option<W>))>> {
        Ok(self.cogroup(other, opts)?.flat_map(|(k, (vs, ws))| {
            let ws: Vec<Option<W>> = if ws.is_empty() {
                vec![None]
            } else {
                ws.into_iter().map(Some).collect()
            };
            let mut out = Vec::with_capacity(vs.len() * ws.len());
            for v in &vs {
                for w in &ws {
                    out.push((k.clone(), (v.clone(), w.clone())));
                }
            }
            out
        }))
    }

    /// Right outer join: keys missing on the left get `None`.
    #[track_caller]
    pub fn right_outer_join<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (Option<V>, W))>> {
        Ok(self.cogroup(other, opts)?.flat_map(|(k, (vs, ws))| {
            let vs: Vec<Option<V>> = if vs.is_empty() {
                vec![None]
            } else {
                vs.into_iter().map(Some).collect()
            };
            let mut out = Vec::with_capacity(vs.len() * ws.len());
            for v in &vs {
                for w in &ws {
                    out.push((k.clone(), (v.clone(), w.clone())));
                }
            }
            out
        }))
    }

    /// Full outer join.
    #[track_caller]
    pub fn outer_join<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (Option<V>, Option<W>))>> {
        Ok(self.cogroup(other, opts)?.flat_map(|(k, (vs, ws))| {
            let vs: Vec<Option<V>> = if vs.is_empty() {
                vec![None]
            } else {
                vs.into_iter().map(Some).collect()
            };
            let ws: Vec<Option<W>> = if ws.is_empty() {
                vec![None]
            } else {
                ws.into_iter().map(Some).collect()
            };
            let mut out = Vec::with_capacity(vs.len() * ws.len());
            for v in &vs {
                for w in &ws {
                    out.push((k.clone(), (v.clone(), w.clone())));
                }
            }
            out
        }))
    }

    /// Broadcast inner join: materialize `small` into a hash multimap on the
    /// driver, broadcast it, and probe it from every map task. Equivalent to
    /// [`join`](Self::join) whenever the right side fits in memory.
    #[track_caller]
    pub fn inner_join<W>(&self, small: &Dataset<(K, W)>) -> Result<Dataset<(K, (V, W))>>
    where
        K: Serialize,
        W: Data + Serialize,
    {
        let mut multimap: HashMap<K, Vec<W>> = HashMap::new();
        for (k, w) in small.collect()? {
            multimap.entry(k).or_default().push(w);
        }
        let handle = self.context().broadcast(multimap)?;
        let extra_mem = (handle.bytes() as u64 * 10) >> 20;
        let table = handle.share();
        let joined = self.flat_map(move |(k, v)| match table.get(&k) {
            Some(ws) => ws
                .iter()
                .map(|w| (k.clone(), (v.clone(), w.clone())))
                .collect(),
            None => Vec::new(),
        });
        let mem = joined.core().mem() + extra_mem;
        Ok(joined.with_mem(mem))
    }

    /// Same-typed N-way cogroup: per key, one value list per input dataset
    /// (self first), in input order.
    #[track_caller]
    pub fn cogroup_many(
        &self,
        others: &[Dataset<(K, V)>],
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, Vec<Vec<V>>)>> {
        let arity = others.len() + 1;
        let mut tagged = vec![self.map_values(|v| (0usize, v))];
        for (i, other) in others.iter().enumerate() {
            tagged.push(other.map_values(move |v| (i + 1, v)));
        }
        let unioned = tagged[0].union(&tagged[1..]);
        Ok(unioned.group_by_key(opts)?.map_values(move |pairs| {
            let mut lists: Vec<Vec<V>> = (0..arity).map(|_| Vec::new()).collect();
            for (i, v) in pairs {
                lists[i].push(v);
            }
            lists
        }))
    }
}

/// Stream-valued cogroup output, for reducers too large to materialize.
impl<K: Key, V: Data> Dataset<(K, V)> {
    /// Like [`cogroup`](Self::cogroup) but each side is a single-pass value
    /// stream; both streams of a key must be consumed before the next key.
    #[track_caller]
    pub fn cogroup_iter<W: Data>(
        &self,
        other: &Dataset<(K, W)>,
        opts: ShuffleOpts,
    ) -> Result<Dataset<(K, (ValueStream<V>, ValueStream<W>))>> {
        Ok(self
            .cogroup(other, opts)?
            .map_values(|(vs, ws)| (ValueStream::single(vs), ValueStream::single(ws))))
    }
}
