//! Dependency records: how a child partition consumes parent partitions.
//!
//! These are declarative metadata — the typed data flow lives inside the
//! concrete dataset nodes, which hold their parents directly. Schedulers and
//! diagnostics read these records to understand the DAG shape, in particular
//! where the narrow/wide (shuffle) boundary sits.

/// How child partitions map onto one parent's partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dependency {
    /// Child split `i` consumes parent split `i`.
    Narrow { parent: u64 },
    /// Child split `j` consumes parent split `j + in_start - out_start`.
    Range {
        parent: u64,
        in_start: usize,
        out_start: usize,
        len: usize,
    },
    /// Child split `j` consumes parent splits `[j*factor, min(n, (j+1)*factor))`.
    OneToRange {
        parent: u64,
        factor: usize,
        parent_splits: usize,
    },
    /// Child split of two parents, identified by the pair
    /// `(index / right_splits, index % right_splits)`.
    Cartesian { parent: u64, right_splits: usize },
    /// Wide edge: child reducer `r` consumes map-output partition `r` from
    /// every parent partition, redistributed by a partitioner.
    Shuffle {
        shuffle_id: u64,
        parent: u64,
        partitions: usize,
        sort_shuffle: bool,
        iter_values: bool,
    },
}

impl Dependency {
    /// True if this edge crosses a shuffle boundary.
    pub fn is_shuffle(&self) -> bool {
        matches!(self, Dependency::Shuffle { .. })
    }
}
