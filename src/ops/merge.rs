//! Multi-parent narrow operators: union, slice, split merging and zip.

use crate::context::Context;
use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::split::{MultiSplit, NestedSplit, PairSplit, Split};
use anyhow::{Result, anyhow};
use std::sync::Arc;

/// Concatenation of several datasets' splits, in order.
pub struct UnionDataset<T: Data> {
    core: DatasetCore,
    parents: Vec<Dataset<T>>,
}

#[track_caller]
pub fn union_datasets<T: Data>(ctx: &Context, parents: &[Dataset<T>]) -> Dataset<T> {
    Dataset::from_node(Arc::new(UnionDataset {
        core: DatasetCore::new(ctx),
        parents: parents.to_vec(),
    }))
}

impl<T: Data> DatasetNode<T> for UnionDataset<T> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Union of {} datasets>", self.parents.len())
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        let mut out: Vec<Arc<dyn Split>> = Vec::new();
        for (pi, parent) in self.parents.iter().enumerate() {
            for inner in parent.splits() {
                out.push(Arc::new(NestedSplit {
                    index: out.len(),
                    parent: pi,
                    inner,
                }));
            }
        }
        out
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = Vec::new();
        let mut pos = 0;
        for parent in &self.parents {
            let len = parent.num_splits();
            deps.push(Dependency::Range {
                parent: parent.id(),
                in_start: 0,
                out_start: pos,
                len,
            });
            pos += len;
        }
        deps
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        match split.as_any().downcast_ref::<NestedSplit>() {
            Some(ns) => self.parents[ns.parent].preferred_locations(&ns.inner),
            None => Vec::new(),
        }
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let ns = split
            .as_any()
            .downcast_ref::<NestedSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        self.parents[ns.parent].iterator(&ns.inner)
    }
}

/// Contiguous slice `[i, j)` of the parent's splits.
pub struct SliceDataset<T: Data> {
    core: DatasetCore,
    prev: Dataset<T>,
    i: usize,
    j: usize,
}

/// Several consecutive parent splits merged into one.
pub struct MergedDataset<T: Data> {
    core: DatasetCore,
    prev: Dataset<T>,
    factor: usize,
}

/// Element-wise zip of two equally-partitioned datasets.
pub struct ZippedDataset<A: Data, B: Data> {
    core: DatasetCore,
    left: Dataset<A>,
    right: Dataset<B>,
}

impl<T: Data> Dataset<T> {
    /// Concatenate with `others`, preserving split order.
    #[track_caller]
    pub fn union(&self, others: &[Dataset<T>]) -> Dataset<T> {
        let mut parents = vec![self.clone()];
        parents.extend_from_slice(others);
        union_datasets(&self.context(), &parents)
    }

    /// The contiguous partition slice `[i, j)`. Only full-step slices are
    /// supported.
    #[track_caller]
    pub fn slice(&self, i: usize, j: usize) -> Result<Dataset<T>> {
        let n = self.num_splits();
        let j = j.min(n);
        if i > j {
            return Err(anyhow!("invalid slice [{i}, {j})"));
        }
        Ok(Dataset::from_node(Arc::new(SliceDataset {
            core: DatasetCore::derived(self.core()),
            prev: self.clone(),
            i,
            j,
        })))
    }

    /// Merge consecutive splits so each new split covers `factor` old ones.
    #[track_caller]
    pub fn merge_splits(&self, factor: usize) -> Dataset<T> {
        Dataset::from_node(Arc::new(MergedDataset {
            core: DatasetCore::derived(self.core()),
            prev: self.clone(),
            factor: factor.max(1),
        }))
    }

    /// Merge down to at most `num_splits` partitions.
    #[track_caller]
    pub fn merge_to(&self, num_splits: usize) -> Dataset<T> {
        let n = self.num_splits();
        let factor = n.div_ceil(num_splits.max(1));
        self.merge_splits(factor)
    }

    /// Pair up records of two datasets with identical partition counts.
    /// Partitions of unequal length are a fatal error.
    #[track_caller]
    pub fn zip_with<U: Data>(&self, other: &Dataset<U>) -> Result<Dataset<(T, U)>> {
        if self.num_splits() != other.num_splits() {
            return Err(anyhow!(
                "zipped datasets must have the same number of splits ({} != {})",
                self.num_splits(),
                other.num_splits()
            ));
        }
        Ok(Dataset::from_node(Arc::new(ZippedDataset {
            core: DatasetCore::derived(self.core()),
            left: self.clone(),
            right: other.clone(),
        })))
    }
}

impl<T: Data> DatasetNode<T> for SliceDataset<T> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Slice [{}:{}] of {:?}>", self.i, self.j, self.prev)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.prev.splits()[self.i..self.j]
            .iter()
            .enumerate()
            .map(|(pos, inner)| {
                Arc::new(NestedSplit {
                    index: pos,
                    parent: 0,
                    inner: Arc::clone(inner),
                }) as Arc<dyn Split>
            })
            .collect()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Range {
            parent: self.prev.id(),
            in_start: self.i,
            out_start: 0,
            len: self.j - self.i,
        }]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        match split.as_any().downcast_ref::<NestedSplit>() {
            Some(ns) => self.prev.preferred_locations(&ns.inner),
            None => Vec::new(),
        }
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let ns = split
            .as_any()
            .downcast_ref::<NestedSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        self.prev.iterator(&ns.inner)
    }
}

impl<T: Data> DatasetNode<T> for MergedDataset<T> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Merged {}:1 of {:?}>", self.factor, self.prev)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.prev
            .splits()
            .chunks(self.factor)
            .enumerate()
            .map(|(i, chunk)| {
                Arc::new(MultiSplit {
                    index: i,
                    splits: chunk.to_vec(),
                }) as Arc<dyn Split>
            })
            .collect()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::OneToRange {
            parent: self.prev.id(),
            factor: self.factor,
            parent_splits: self.prev.num_splits(),
        }]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        match split.as_any().downcast_ref::<MultiSplit>() {
            Some(ms) => ms
                .splits
                .iter()
                .flat_map(|sp| self.prev.preferred_locations(sp))
                .collect(),
            None => Vec::new(),
        }
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let ms = split
            .as_any()
            .downcast_ref::<MultiSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        let mut iters = Vec::with_capacity(ms.splits.len());
        for sp in &ms.splits {
            iters.push(self.prev.iterator(sp)?);
        }
        Ok(Box::new(iters.into_iter().flatten()))
    }
}

impl<A: Data, B: Data> DatasetNode<(A, B)> for ZippedDataset<A, B> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Zipped {:?} {:?}>", self.left, self.right)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        let rights = self.right.splits();
        self.left
            .splits()
            .into_iter()
            .zip(rights)
            .enumerate()
            .map(|(i, (l, r))| {
                Arc::new(PairSplit {
                    index: i,
                    left: l,
                    right: r,
                }) as Arc<dyn Split>
            })
            .collect()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::Narrow {
                parent: self.left.id(),
            },
            Dependency::Narrow {
                parent: self.right.id(),
            },
        ]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        match split.as_any().downcast_ref::<PairSplit>() {
            Some(ps) => {
                let mut locs = self.left.preferred_locations(&ps.left);
                locs.extend(self.right.preferred_locations(&ps.right));
                locs
            }
            None => Vec::new(),
        }
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<(A, B)>> {
        let ps = split
            .as_any()
            .downcast_ref::<PairSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        Ok(Box::new(ZipIter {
            left: self.left.iterator(&ps.left)?,
            right: self.right.iterator(&ps.right)?,
            done: false,
        }))
    }
}

/// Lockstep pairing; unequal partition lengths are fatal.
struct ZipIter<A, B> {
    left: PartIter<A>,
    right: PartIter<B>,
    done: bool,
}

impl<A, B> Iterator for ZipIter<A, B> {
    type Item = Result<(A, B)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match (self.left.next(), self.right.next()) {
            (None, None) => {
                self.done = true;
                None
            }
            (Some(Ok(a)), Some(Ok(b))) => Some(Ok((a, b))),
            (Some(Err(e)), _) | (_, Some(Err(e))) => {
                self.done = true;
                Some(Err(e))
            }
            (Some(Ok(_)), None) | (None, Some(Ok(_))) => {
                self.done = true;
                Some(Err(anyhow!("zipped partitions have unequal lengths")))
            }
        }
    }
}
