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
fn cogroup_collects_both_sides() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![("k".to_string(), 1), ("k".to_string(), 2)], 2)?;
    let b = ctx.parallelize(vec![("k".to_string(), 3)], 1)?;
    for sort in [false, true] {
        let grouped = a.cogroup(&b, opts_sorted(sort))?.collect()?;
        assert_eq!(grouped, vec![("k".to_string(), (vec![1, 2], vec![3]))]);
    }
    Ok(())
}

#[test]
fn cogroup_is_complete_over_shared_keys() -> Result<()> {
    let ctx = Context::default();
    let a: Vec<(i64, i64)> = (0..50).map(|i| (i % 10, i)).collect();
    let b: Vec<(i64, i64)> = (0..30).map(|i| (i % 10, 100 + i)).collect();
    let left = ctx.parallelize(a.clone(), 4)?;
    let right = ctx.parallelize(b.clone(), 3)?;
    for sort in [false, true] {
        let grouped = left.cogroup(&right, opts_sorted(sort))?.collect()?;
        assert_eq!(grouped.len(), 10);
        for (k, (vs, ws)) in grouped {
            let expect_vs: Vec<i64> = a.iter().filter(|(ak, _)| *ak == k).map(|(_, v)| *v).collect();
            let expect_ws: Vec<i64> = b.iter().filter(|(bk, _)| *bk == k).map(|(_, w)| *w).collect();
            assert_eq!(vs, expect_vs, "values for key {k}");
            assert_eq!(ws, expect_ws, "right values for key {k}");
        }
    }
    Ok(())
}

#[test]
fn inner_join_via_shuffle() -> Result<()> {
    let ctx = Context::default();
    let x = ctx.parallelize(vec![("a".to_string(), 1), ("b".to_string(), 4)], 2)?;
    let y = ctx.parallelize(vec![("a".to_string(), 2), ("a".to_string(), 3)], 1)?;
    let joined = sorted(x.join(&y, ShuffleOpts::default())?.collect()?);
    assert_eq!(
        joined,
        vec![("a".to_string(), (1, 2)), ("a".to_string(), (1, 3))]
    );
    Ok(())
}

#[test]
fn broadcast_inner_join_matches_shuffle_join() -> Result<()> {
    let ctx = Context::default();
    let x = ctx.parallelize(vec![("a".to_string(), 1), ("b".to_string(), 4)], 2)?;
    let y = ctx.parallelize(vec![("a".to_string(), 2), ("a".to_string(), 3)], 1)?;
    let broadcasted = sorted(x.inner_join(&y)?.collect()?);
    let shuffled = sorted(x.join(&y, ShuffleOpts::default())?.collect()?);
    assert_eq!(broadcasted, shuffled);
    Ok(())
}

#[test]
fn outer_joins_fill_missing_sides() -> Result<()> {
    let ctx = Context::default();
    let left = ctx.parallelize(
        vec![(1u32, "L1".to_string()), (2, "L2".to_string())],
        2,
    )?;
    let right = ctx.parallelize(
        vec![(1u32, "R1".to_string()), (3, "R3".to_string())],
        2,
    )?;

    let l = sorted(left.left_outer_join(&right, ShuffleOpts::default())?.collect()?);
    assert_eq!(
        l,
        vec![
            (1, ("L1".to_string(), Some("R1".to_string()))),
            (2, ("L2".to_string(), None)),
        ]
    );

    let r = sorted(left.right_outer_join(&right, ShuffleOpts::default())?.collect()?);
    assert_eq!(
        r,
        vec![
            (1, (Some("L1".to_string()), "R1".to_string())),
            (3, (None, "R3".to_string())),
        ]
    );

    let f = sorted(left.outer_join(&right, ShuffleOpts::default())?.collect()?);
    assert_eq!(
        f,
        vec![
            (1, (Some("L1".to_string()), Some("R1".to_string()))),
            (2, (Some("L2".to_string()), None)),
            (3, (None, Some("R3".to_string()))),
        ]
    );
    Ok(())
}

#[test]
fn map_values_preserves_the_partitioner() -> Result<()> {
    let ctx = Context::default();
    let reduced = ctx
        .parallelize(vec![(1, 1), (2, 2), (1, 3)], 2)?
        .reduce_by_key(|a, b| a + b, ShuffleOpts::splits(3))?;
    let mapped = reduced.map_values(|v| v * 10);
    let p = reduced.partitioner().expect("shuffled dataset has a partitioner");
    let q = mapped.partitioner().expect("map_values keeps the partitioner");
    assert!(*p == *q);

    let flat = mapped.flat_map_values(|v| vec![v]);
    assert!(flat.partitioner().is_some());
    Ok(())
}

#[test]
fn copartitioned_cogroup_takes_narrow_edges() -> Result<()> {
    let ctx = Context::default();
    let a = ctx
        .parallelize(vec![(1, 1), (2, 2), (3, 3)], 2)?
        .reduce_by_key(|a, b| a + b, ShuffleOpts::splits(4))?;
    let b = ctx
        .parallelize(vec![(1, 10), (4, 40)], 2)?
        .reduce_by_key(|a, b| a + b, ShuffleOpts::splits(4))?;
    // Both sides share the 4-way hash partitioner, so the cogroup consumes
    // them through narrow one-to-one edges.
    let grouped = a.cogroup(&b, ShuffleOpts::splits(4))?;
    let deps = grouped.dependencies();
    assert_eq!(deps.len(), 2);
    assert!(deps.iter().all(|d| !d.is_shuffle()), "deps were {deps:?}");

    let out = sorted(grouped.collect()?);
    assert_eq!(
        out,
        vec![
            (1, (vec![1], vec![10])),
            (2, (vec![2], vec![])),
            (3, (vec![3], vec![])),
            (4, (vec![], vec![40])),
        ]
    );
    Ok(())
}

#[test]
fn cogroup_many_tags_inputs_in_order() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![(1, 10), (2, 20)], 1)?;
    let b = ctx.parallelize(vec![(1, 11)], 1)?;
    let c = ctx.parallelize(vec![(2, 22), (1, 12)], 1)?;
    let grouped = a
        .cogroup_many(&[b, c], ShuffleOpts::default())?
        .collect_as_map()?;
    assert_eq!(grouped.get(&1), Some(&vec![vec![10], vec![11], vec![12]]));
    assert_eq!(grouped.get(&2), Some(&vec![vec![20], vec![], vec![22]]));
    Ok(())
}

#[test]
fn cogroup_iter_streams_each_side() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![("k".to_string(), 1), ("k".to_string(), 2)], 1)?;
    let b = ctx.parallelize(vec![("k".to_string(), 9)], 1)?;
    let grouped = a.cogroup_iter(&b, ShuffleOpts::default())?.collect()?;
    assert_eq!(grouped.len(), 1);
    let (k, (vs, ws)) = grouped.into_iter().next().expect("one key");
    assert_eq!(k, "k");
    assert_eq!(vs.collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(ws.collect::<Vec<_>>(), vec![9]);
    Ok(())
}
