//! The reducer-side shuffled dataset.

use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, Key, PartIter};
use crate::dependency::Dependency;
use crate::partitioner::Part;
use crate::shuffle::aggregator::{AggKind, Aggregator, group_by_aggregator};
use crate::shuffle::merger::{Merger, OrderedMerger};
use crate::shuffle::sorted::{SortedGroupMerger, SortedMerger, ValueStream};
use crate::split::{Split, index_splits};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

/// Reducer side of a shuffle edge: one split per reduce partition, merged
/// from every map task's output with the aggregator's `merge_combiners`.
pub struct ShuffledDataset<K: Key, V: Data, C: Data> {
    core: DatasetCore,
    parent: Dataset<(K, V)>,
    aggregator: Aggregator<V, C>,
    part: Arc<Part<K>>,
    shuffle_id: u64,
    sort_shuffle: bool,
}

/// Build a shuffled dataset; the handle carries the partitioner so
/// downstream keyed operators can exploit co-partitioning.
#[track_caller]
pub(crate) fn shuffle_dataset<K: Key, V: Data, C: Data>(
    parent: &Dataset<(K, V)>,
    aggregator: Aggregator<V, C>,
    part: Part<K>,
    sort_shuffle: Option<bool>,
) -> Dataset<(K, C)> {
    let ctx = parent.context();
    let part = Arc::new(part);
    let node = ShuffledDataset {
        core: DatasetCore::derived(parent.core()),
        parent: parent.clone(),
        aggregator,
        part: Arc::clone(&part),
        shuffle_id: ctx.new_shuffle_id(),
        sort_shuffle: sort_shuffle.unwrap_or(ctx.config().sort_shuffle),
    };
    let mut ds = Dataset::from_node(Arc::new(node));
    ds.part = Some(part as Arc<dyn Any + Send + Sync>);
    ds
}

impl<K: Key, V: Data, C: Data> DatasetNode<(K, C)> for ShuffledDataset<K, V, C> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Shuffled {:?}>", self.parent)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        index_splits(self.part.num_partitions())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Shuffle {
            shuffle_id: self.shuffle_id,
            parent: self.parent.id(),
            partitions: self.part.num_partitions(),
            sort_shuffle: self.sort_shuffle,
            iter_values: false,
        }]
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<(K, C)>> {
        let service = self.core.ctx.shuffle_service();
        service.ensure_map_stage(
            self.shuffle_id,
            &self.parent,
            &self.aggregator,
            &self.part,
            self.sort_shuffle,
        )?;
        let reduce = split.index();
        if self.sort_shuffle {
            let runs = service.get_iters::<K, C>(self.shuffle_id, reduce)?;
            return Ok(Box::new(SortedMerger::new(
                runs,
                Arc::clone(&self.aggregator.merge_combiners),
            )));
        }
        if self.aggregator.kind == AggKind::GroupBy {
            let mut merger = OrderedMerger::new(Arc::clone(&self.aggregator.merge_combiners));
            service.fetch::<K, C>(self.shuffle_id, reduce, |_map_id, run| merger.extend(run))?;
            Ok(Box::new(merger.into_entries().into_iter().map(Ok)))
        } else {
            let mut merger = Merger::new(Arc::clone(&self.aggregator.merge_combiners));
            service.fetch::<K, C>(self.shuffle_id, reduce, |_map_id, run| merger.extend(run))?;
            Ok(Box::new(merger.into_entries().into_iter().map(Ok)))
        }
    }
}

/// Grouped shuffle yielding lazy per-key value streams instead of
/// materialized `Vec`s.
pub struct StreamShuffledDataset<K: Key, V: Data> {
    core: DatasetCore,
    parent: Dataset<(K, V)>,
    part: Arc<Part<K>>,
    shuffle_id: u64,
    sort_shuffle: bool,
}

#[track_caller]
pub(crate) fn stream_shuffle_dataset<K: Key, V: Data>(
    parent: &Dataset<(K, V)>,
    part: Part<K>,
    sort_shuffle: Option<bool>,
) -> Dataset<(K, ValueStream<V>)> {
    let ctx = parent.context();
    let part = Arc::new(part);
    let node = StreamShuffledDataset {
        core: DatasetCore::derived(parent.core()),
        parent: parent.clone(),
        part: Arc::clone(&part),
        shuffle_id: ctx.new_shuffle_id(),
        sort_shuffle: sort_shuffle.unwrap_or(ctx.config().sort_shuffle),
    };
    let mut ds = Dataset::from_node(Arc::new(node));
    ds.part = Some(part as Arc<dyn Any + Send + Sync>);
    ds
}

impl<K: Key, V: Data> DatasetNode<(K, ValueStream<V>)> for StreamShuffledDataset<K, V> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<StreamShuffled {:?}>", self.parent)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        index_splits(self.part.num_partitions())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Shuffle {
            shuffle_id: self.shuffle_id,
            parent: self.parent.id(),
            partitions: self.part.num_partitions(),
            sort_shuffle: self.sort_shuffle,
            iter_values: true,
        }]
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<(K, ValueStream<V>)>> {
        let service = self.core.ctx.shuffle_service();
        let aggregator = group_by_aggregator::<V>();
        service.ensure_map_stage(
            self.shuffle_id,
            &self.parent,
            &aggregator,
            &self.part,
            self.sort_shuffle,
        )?;
        let reduce = split.index();
        if self.sort_shuffle {
            let runs = service.get_iters::<K, Vec<V>>(self.shuffle_id, reduce)?;
            return Ok(Box::new(SortedGroupMerger::new(runs)));
        }
        let mut merger = OrderedMerger::new(Arc::clone(&aggregator.merge_combiners));
        service.fetch::<K, Vec<V>>(self.shuffle_id, reduce, |_map_id, run| merger.extend(run))?;
        Ok(Box::new(
            merger
                .into_entries()
                .into_iter()
                .map(|(k, values)| Ok((k, ValueStream::single(values)))),
        ))
    }
}
