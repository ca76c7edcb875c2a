//! Key-to-partition routing.
//!
//! A [`Part<K>`] maps a key to a partition index. The two variants mirror the
//! two shuffle placement strategies:
//!
//! - [`HashPartitioner`]: `portable_hash(key) % n`, optionally biased by a
//!   sorted list of hash thresholds so skewed hash buckets split into
//!   neighbours (produced by the skew-mitigation pass).
//! - [`RangePartitioner`]: binary search over sorted boundary samples,
//!   honouring a `reverse` flag (produced by the global sort).
//!
//! Two partitioners are interchangeable only if they are the same variant
//! with the same parameters; `PartialEq` is exactly that check, and keyed
//! operators use it to decide whether a co-partitioned parent can be consumed
//! through a narrow edge.

use crate::utils::portable_hash;
use std::hash::Hash;

/// A partitioner for keys of type `K`.
#[derive(Clone, Debug, PartialEq)]
pub enum Part<K> {
    Hash(HashPartitioner),
    Range(RangePartitioner<K>),
}

impl<K: Hash + Ord> Part<K> {
    pub fn num_partitions(&self) -> usize {
        match self {
            Part::Hash(h) => h.num_partitions(),
            Part::Range(r) => r.num_partitions(),
        }
    }

    pub fn partition(&self, key: &K) -> usize {
        match self {
            Part::Hash(h) => h.partition_of(portable_hash(key)),
            Part::Range(r) => r.partition(key),
        }
    }
}

/// Hash partitioner, optionally thresholded for skew mitigation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashPartitioner {
    partitions: usize,
    /// Sorted 32-bit hash thresholds; when present, `hash % 2^32` is routed
    /// to the bucket it falls into instead of plain modulo.
    thresholds: Option<Vec<u32>>,
}

impl HashPartitioner {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            thresholds: None,
        }
    }

    /// Partitioner with `thresholds.len() + 1` buckets over `hash % 2^32`.
    /// The thresholds must be strictly ascending.
    pub fn with_thresholds(thresholds: Vec<u32>) -> Self {
        Self {
            partitions: thresholds.len() + 1,
            thresholds: Some(thresholds),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions
    }

    pub fn partition_of(&self, hash: u64) -> usize {
        match &self.thresholds {
            Some(th) => {
                let h = (hash % (1u64 << 32)) as u32;
                th.partition_point(|t| *t < h)
            }
            None => (hash % self.partitions as u64) as usize,
        }
    }
}

/// Range partitioner over sorted boundary samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangePartitioner<K> {
    boundaries: Vec<K>,
    reverse: bool,
}

impl<K: Ord> RangePartitioner<K> {
    /// `boundaries` must be sorted ascending; with `reverse` the partition
    /// order is flipped so the largest keys land in partition 0.
    pub fn new(mut boundaries: Vec<K>, reverse: bool) -> Self {
        boundaries.sort();
        Self {
            boundaries,
            reverse,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.boundaries.len() + 1
    }

    pub fn partition(&self, key: &K) -> usize {
        let idx = self.boundaries.partition_point(|b| b <= key);
        if self.reverse {
            self.boundaries.len() - idx
        } else {
            idx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_mod_routing() {
        let p = HashPartitioner::new(4);
        for k in 0..100u64 {
            let idx = p.partition_of(portable_hash(&k));
            assert!(idx < 4);
        }
    }

    #[test]
    fn thresholds_route_into_buckets() {
        let p = HashPartitioner::with_thresholds(vec![100, 200, 300]);
        assert_eq!(p.num_partitions(), 4);
        assert_eq!(p.partition_of(5), 0);
        assert_eq!(p.partition_of(100), 1);
        assert_eq!(p.partition_of(250), 3);
        assert_eq!(p.partition_of(4_000_000_000), 3);
    }

    #[test]
    fn range_boundaries() {
        let p = RangePartitioner::new(vec![10, 20], false);
        assert_eq!(p.partition(&5), 0);
        assert_eq!(p.partition(&10), 1);
        assert_eq!(p.partition(&15), 1);
        assert_eq!(p.partition(&25), 2);

        let r = RangePartitioner::new(vec![10, 20], true);
        assert_eq!(r.partition(&25), 0);
        assert_eq!(r.partition(&5), 2);
    }

    #[test]
    fn interchangeable_only_with_same_parameters() {
        let a = Part::<u32>::Hash(HashPartitioner::new(4));
        let b = Part::<u32>::Hash(HashPartitioner::new(4));
        let c = Part::<u32>::Hash(HashPartitioner::new(5));
        let d = Part::<u32>::Range(RangePartitioner::new(vec![1, 2, 3], false));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
