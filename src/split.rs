//! Partition descriptors.
//!
//! A [`Split`] names one partition of a dataset. Splits are value-like,
//! immutable once the owning dataset is built, and identified by their index;
//! concrete datasets attach extra addressing (byte ranges, child splits) by
//! defining their own split types and downcasting in `compute`.

use std::any::Any;
use std::sync::Arc;

/// One partition of a dataset.
pub trait Split: Send + Sync + 'static {
    /// Position of this split within the owning dataset, in `[0, n)`.
    fn index(&self) -> usize;

    /// Downcast hook for dataset-specific split types.
    fn as_any(&self) -> &dyn Any;
}

/// Plain split carrying nothing but its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexSplit {
    pub index: usize,
}

impl Split for IndexSplit {
    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Split over a byte range `[begin, end)` of an underlying file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeSplit {
    pub index: usize,
    pub begin: u64,
    pub end: u64,
}

impl Split for RangeSplit {
    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Split aggregating several child splits (merge).
#[derive(Clone)]
pub struct MultiSplit {
    pub index: usize,
    pub splits: Vec<Arc<dyn Split>>,
}

impl Split for MultiSplit {
    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Split pairing one child split from each of two parents (zip, cartesian).
#[derive(Clone)]
pub struct PairSplit {
    pub index: usize,
    pub left: Arc<dyn Split>,
    pub right: Arc<dyn Split>,
}

impl Split for PairSplit {
    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Split delegating to one parent's split (union, slice).
#[derive(Clone)]
pub struct NestedSplit {
    pub index: usize,
    /// Which parent dataset the inner split belongs to.
    pub parent: usize,
    pub inner: Arc<dyn Split>,
}

impl Split for NestedSplit {
    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Build the `Arc`'d plain split table `0..n`.
pub fn index_splits(n: usize) -> Vec<Arc<dyn Split>> {
    (0..n)
        .map(|i| Arc::new(IndexSplit { index: i }) as Arc<dyn Split>)
        .collect()
}
