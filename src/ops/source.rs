//! In-memory source dataset.

use crate::context::Context;
use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::split::{IndexSplit, Split, index_splits};
use anyhow::{Result, anyhow};
use std::sync::Arc;

/// A driver-side collection distributed over index ranges. The data is
/// stored once and shared by every split, so oversized collections cost one
/// allocation regardless of the slice count.
pub struct ParallelCollection<T: Data> {
    core: DatasetCore,
    data: Arc<Vec<T>>,
    ranges: Vec<(usize, usize)>,
}

impl<T: Data> ParallelCollection<T> {
    #[track_caller]
    pub(crate) fn create(ctx: &Context, data: Vec<T>, num_slices: usize) -> Result<Dataset<T>> {
        if num_slices == 0 {
            return Err(anyhow!("invalid num_slices 0"));
        }
        let m = data.len();
        let slices = num_slices.min(m.max(1));
        let per_slice = m.div_ceil(slices).max(1);
        let mut ranges = Vec::with_capacity(slices);
        for i in 0..slices {
            let begin = (i * per_slice).min(m);
            let end = ((i + 1) * per_slice).min(m);
            ranges.push((begin, end));
        }
        Ok(Dataset::from_node(Arc::new(Self {
            core: DatasetCore::new(ctx),
            data: Arc::new(data),
            ranges,
        })))
    }
}

impl<T: Data> DatasetNode<T> for ParallelCollection<T> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<ParallelCollection {}>", self.data.len())
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        index_splits(self.ranges.len())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let idx = split
            .as_any()
            .downcast_ref::<IndexSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?
            .index;
        let &(begin, end) = self
            .ranges
            .get(idx)
            .ok_or_else(|| anyhow!("split {idx} out of range"))?;
        Ok(Box::new(SliceIter {
            data: Arc::clone(&self.data),
            pos: begin,
            end,
        }))
    }
}

struct SliceIter<T> {
    data: Arc<Vec<T>>,
    pos: usize,
    end: usize,
}

impl<T: Clone> Iterator for SliceIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let item = self.data[self.pos].clone();
        self.pos += 1;
        Some(Ok(item))
    }
}
