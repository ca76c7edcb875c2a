use anyhow::Result;
use millrace::*;

fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
    v.sort();
    v
}

fn opts_sorted(sort: bool) -> ShuffleOpts {
    ShuffleOpts {
        sort_shuffle: Some(sort),
        ..Default::default()
    }
}

#[test]
fn reduce_by_key_sums_counts() -> Result<()> {
    let ctx = Context::default();
    let words = ctx.parallelize(
        vec!["a", "b", "a", "c", "b", "a"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>(),
        3,
    )?;
    let counts = words
        .map(|w| (w, 1u64))
        .reduce_by_key(|a, b| a + b, ShuffleOpts::default())?
        .collect()?;
    assert_eq!(
        sorted(counts),
        vec![
            ("a".to_string(), 3),
            ("b".to_string(), 2),
            ("c".to_string(), 1),
        ]
    );
    Ok(())
}

#[test]
fn hash_and_sort_shuffle_agree() -> Result<()> {
    let ctx = Context::default();
    let pairs: Vec<(i64, i64)> = (0..200).map(|i| (i % 13, i)).collect();
    let ds = ctx.parallelize(pairs, 5)?;
    let hash = ds.reduce_by_key(|a, b| a + b, opts_sorted(false))?.collect()?;
    let merge = ds.reduce_by_key(|a, b| a + b, opts_sorted(true))?.collect()?;
    assert_eq!(sorted(hash), sorted(merge));
    Ok(())
}

#[test]
fn sort_shuffle_delivers_keys_in_order_per_partition() -> Result<()> {
    let ctx = Context::default();
    let pairs: Vec<(i64, i64)> = (0..100).rev().map(|i| (i % 17, i)).collect();
    let partitions = ctx
        .parallelize(pairs, 4)?
        .reduce_by_key(|a, b| a + b, opts_sorted(true))?
        .glom()
        .collect()?;
    for part in partitions {
        let keys: Vec<i64> = part.iter().map(|(k, _)| *k).collect();
        let mut expect = keys.clone();
        expect.sort();
        assert_eq!(keys, expect);
    }
    Ok(())
}

#[test]
fn group_by_key_preserves_value_order_within_a_mapper() -> Result<()> {
    let ctx = Context::default();
    // One split: arrival order inside the group must match record order.
    let ds = ctx.parallelize(
        vec![("k", 1), ("k", 2), ("j", 9), ("k", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<Vec<_>>(),
        1,
    )?;
    let grouped = ds.group_by_key(ShuffleOpts::default())?.collect_as_map()?;
    assert_eq!(grouped.get("k"), Some(&vec![1, 2, 3]));
    assert_eq!(grouped.get("j"), Some(&vec![9]));
    Ok(())
}

#[test]
fn group_by_key_iter_streams_values() -> Result<()> {
    let ctx = Context::default();
    let pairs: Vec<(i64, i64)> = (0..60).map(|i| (i % 6, i)).collect();
    for sort in [false, true] {
        let grouped = ctx
            .parallelize(pairs.clone(), 4)?
            .group_by_key_iter(opts_sorted(sort))?
            .collect()?;
        let mut total = 0usize;
        for (k, stream) in grouped {
            let values: Vec<i64> = stream.collect();
            assert_eq!(values.len(), 10);
            assert!(values.iter().all(|v| v % 6 == k));
            total += values.len();
        }
        assert_eq!(total, 60);
    }
    Ok(())
}

#[test]
fn combine_by_key_with_custom_aggregator() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(
        vec![(1u8, 10i64), (1, 20), (2, 5), (1, 30), (2, 7)],
        2,
    )?;
    // Track (sum, count) per key.
    let agg = Aggregator::new(
        |v: i64| (v, 1u64),
        |(s, n), v| (s + v, n + 1),
        |a: (i64, u64), b: (i64, u64)| (a.0 + b.0, a.1 + b.1),
    );
    let out = ds.combine_by_key(agg, ShuffleOpts::default())?.collect()?;
    assert_eq!(sorted(out), vec![(1, (60, 3)), (2, (12, 2))]);
    Ok(())
}

#[test]
fn top_by_key_keeps_the_best_values() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(
        vec![
            ("a".to_string(), 3),
            ("a".to_string(), 1),
            ("a".to_string(), 7),
            ("a".to_string(), 5),
            ("b".to_string(), 2),
        ],
        2,
    )?;
    let top = ds.top_by_key(2, false, ShuffleOpts::default())?.collect_as_map()?;
    assert_eq!(top.get("a"), Some(&vec![5, 7]));
    assert_eq!(top.get("b"), Some(&vec![2]));

    let bottom = ds.top_by_key(2, true, ShuffleOpts::default())?.collect_as_map()?;
    assert_eq!(bottom.get("a"), Some(&vec![3, 1]));
    Ok(())
}

#[test]
fn uniq_and_hot() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(vec![1, 2, 2, 3, 3, 3, 4, 4, 4, 4], 3)?;
    assert_eq!(sorted(ds.uniq(ShuffleOpts::default())?.collect()?), vec![1, 2, 3, 4]);
    let hot = ds.hot(2, ShuffleOpts::default())?;
    assert_eq!(hot, vec![(4, 4), (3, 3)]);
    Ok(())
}

#[test]
fn update_overlays_new_values() -> Result<()> {
    let ctx = Context::default();
    let old = ctx.parallelize(
        vec![(1, "old1".to_string()), (2, "old2".to_string())],
        2,
    )?;
    let new = ctx.parallelize(
        vec![(2, "new2".to_string()), (3, "new3".to_string())],
        1,
    )?;
    let merged = old.update(&new, false, ShuffleOpts::default())?.collect()?;
    assert_eq!(
        sorted(merged),
        vec![
            (1, "old1".to_string()),
            (2, "new2".to_string()),
            (3, "new3".to_string()),
        ]
    );

    let replaced = old.update(&new, true, ShuffleOpts::default())?.collect()?;
    assert_eq!(
        sorted(replaced),
        vec![(1, "old1".to_string()), (2, "new2".to_string())]
    );
    Ok(())
}

#[test]
fn partition_by_key_colocates_keys() -> Result<()> {
    let ctx = Context::default();
    let pairs: Vec<(i64, i64)> = (0..40).map(|i| (i % 4, i)).collect();
    let parts = ctx
        .parallelize(pairs, 5)?
        .partition_by_key(ShuffleOpts::splits(4))?
        .glom()
        .collect()?;
    assert_eq!(parts.len(), 4);
    for part in parts {
        // All records of a key land in one partition.
        let mut keys: Vec<i64> = part.iter().map(|(k, _)| *k).collect();
        keys.dedup();
        keys.sort();
        keys.dedup();
        for k in keys {
            assert_eq!(part.iter().filter(|(pk, _)| *pk == k).count(), 10);
        }
    }
    Ok(())
}

#[test]
fn reduce_by_key_to_driver_and_lookup() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(vec![(1, 10), (2, 20), (1, 5)], 2)?;
    let driver = ds.reduce_by_key_to_driver(|a, b| a + b)?;
    assert_eq!(driver.get(&1), Some(&15));

    // A shuffled dataset carries a partitioner, so lookup scans one split.
    let reduced = ds.reduce_by_key(|a, b| a + b, ShuffleOpts::splits(3))?;
    assert!(reduced.partitioner().is_some());
    assert_eq!(reduced.lookup(&1)?, Some(15));
    assert_eq!(reduced.lookup(&9)?, None);
    Ok(())
}

#[test]
fn skewed_shuffle_still_reduces_correctly() -> Result<()> {
    let ctx = Context::default();
    // 90% of records share one key.
    let mut pairs: Vec<(i64, i64)> = (0..900).map(|_| (7, 1)).collect();
    pairs.extend((0..100).map(|i| (i % 10, 1)));
    let ds = ctx.parallelize(pairs, 4)?;
    let skew_opts = ShuffleOpts {
        num_splits: Some(4),
        fix_skew: 1.0,
        ..Default::default()
    };
    let fixed = ds.reduce_by_key(|a, b| a + b, skew_opts)?;
    assert!(fixed.num_splits() <= 4);
    let plain = ds.reduce_by_key(|a, b| a + b, ShuffleOpts::splits(4))?;
    assert_eq!(sorted(fixed.collect()?), sorted(plain.collect()?));
    Ok(())
}

#[test]
fn group_by_derived_key() -> Result<()> {
    let ctx = Context::default();
    let groups = ctx
        .parallelize((0..10).collect::<Vec<i64>>(), 3)?
        .group_by(|v| v % 2, ShuffleOpts::default())?
        .collect_as_map()?;
    assert_eq!(sorted(groups.get(&0).cloned().unwrap_or_default()), vec![0, 2, 4, 6, 8]);
    assert_eq!(sorted(groups.get(&1).cloned().unwrap_or_default()), vec![1, 3, 5, 7, 9]);
    Ok(())
}

#[test]
fn percentiles_estimate_quantiles() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((0..10_000).collect::<Vec<i64>>(), 8)?;
    let ps = ds.percentiles(&[50.0], 1.0, |v| *v as f64)?;
    assert_eq!(ps.len(), 1);
    assert!((ps[0] - 5_000.0).abs() < 500.0, "p50 was {}", ps[0]);
    Ok(())
}
