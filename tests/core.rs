use anyhow::Result;
use millrace::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
    v.sort();
    v
}

#[test]
fn map_filter_flatmap_chain() -> Result<()> {
    let ctx = Context::default();
    let lines = ctx.parallelize(
        vec![
            "the quick brown fox".to_string(),
            "jumps over the lazy dog".to_string(),
        ],
        2,
    )?;
    let words = lines
        .flat_map(|s| s.split_whitespace().map(String::from).collect::<Vec<_>>())
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_uppercase())
        .collect()?;
    assert_eq!(words, vec!["QUICK", "BROWN", "JUMPS", "OVER", "LAZY"]);
    Ok(())
}

#[test]
fn parallelize_rejects_zero_slices() {
    let ctx = Context::default();
    assert!(ctx.parallelize(vec![1, 2, 3], 0).is_err());
}

#[test]
fn count_take_first() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((0..100).collect::<Vec<i64>>(), 7)?;
    assert_eq!(ds.count()?, 100);
    assert_eq!(ds.take(5)?, vec![0, 1, 2, 3, 4]);
    assert_eq!(ds.first()?, Some(0));
    assert_eq!(ds.take(0)?, Vec::<i64>::new());
    Ok(())
}

#[test]
fn reduce_fold_aggregate() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((1..=10).collect::<Vec<i64>>(), 3)?;
    assert_eq!(ds.reduce(|a, b| a + b)?, 55);
    assert_eq!(ds.fold(0, |a, b| a + b)?, 55);
    let (sum, n) = ds.aggregate((0i64, 0u64), |(s, n), v| (s + v, n + 1), |a, b| {
        (a.0 + b.0, a.1 + b.1)
    })?;
    assert_eq!((sum, n), (55, 10));
    Ok(())
}

#[test]
fn reduce_of_empty_dataset_is_an_error() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(Vec::<i64>::new(), 2)?;
    assert!(ds.reduce(|a, b| a + b).is_err());
    Ok(())
}

#[test]
fn union_preserves_order() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![1, 2], 2)?;
    let b = ctx.parallelize(vec![3, 4], 1)?;
    let c = ctx.parallelize(vec![5], 1)?;
    let u = a.union(&[b, c]);
    assert_eq!(u.num_splits(), 4);
    assert_eq!(u.collect()?, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn slice_and_merge_splits() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((0..12).collect::<Vec<i64>>(), 6)?;
    let sliced = ds.slice(1, 4)?;
    assert_eq!(sliced.num_splits(), 3);
    assert_eq!(sliced.collect()?, vec![2, 3, 4, 5, 6, 7]);

    let merged = ds.merge_splits(2);
    assert_eq!(merged.num_splits(), 3);
    assert_eq!(merged.collect()?, (0..12).collect::<Vec<i64>>());

    let coalesced = ds.merge_to(2);
    assert_eq!(coalesced.num_splits(), 2);
    assert_eq!(coalesced.collect()?, (0..12).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn zip_pairs_lockstep() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![1, 2, 3, 4], 2)?;
    let b = ctx.parallelize(vec!["a", "b", "c", "d"], 2)?;
    let zipped = a.zip_with(&b)?.collect()?;
    assert_eq!(zipped, vec![(1, "a"), (2, "b"), (3, "c"), (4, "d")]);
    Ok(())
}

#[test]
fn zip_rejects_unequal_split_counts() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![1, 2, 3], 3)?;
    let b = ctx.parallelize(vec![1, 2, 3], 2)?;
    assert!(a.zip_with(&b).is_err());
    Ok(())
}

#[test]
fn zip_unequal_lengths_are_fatal() -> Result<()> {
    let ctx = Context::default();
    // Same split count, different lengths within a split.
    let a = ctx.parallelize(vec![1, 2, 3], 1)?;
    let b = ctx.parallelize(vec![1, 2], 1)?;
    assert!(a.zip_with(&b)?.collect().is_err());
    Ok(())
}

#[test]
fn glom_and_batch() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((0..10).collect::<Vec<i64>>(), 2)?;
    let globs = ds.glom().collect()?;
    assert_eq!(globs.len(), 2);
    assert_eq!(globs[0], (0..5).collect::<Vec<i64>>());

    let batches = ds.batch(3).collect()?;
    assert!(batches.iter().all(|b| b.len() <= 3));
    let flat: Vec<i64> = batches.into_iter().flatten().collect();
    assert_eq!(flat, (0..10).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn enumerate_assigns_global_indices() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(
        vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
        3,
    )?;
    let indexed = ds.enumerate()?.collect()?;
    assert_eq!(
        indexed,
        vec![
            (0, "a".to_string()),
            (1, "b".to_string()),
            (2, "c".to_string()),
            (3, "d".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn sample_is_deterministic_per_seed() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize((0..1000).collect::<Vec<i64>>(), 4)?;
    let once = ds.sample(0.2, false, 42).collect()?;
    let twice = ds.sample(0.2, false, 42).collect()?;
    assert_eq!(once, twice);
    assert!(!once.is_empty() && once.len() < 1000);

    let with = ds.sample(0.5, true, 7).collect()?;
    assert_eq!(with.len(), 500);
    Ok(())
}

#[test]
fn cartesian_in_memory() -> Result<()> {
    let ctx = Context::default();
    let a = ctx.parallelize(vec![1, 2], 2)?;
    let b = ctx.parallelize(vec!["x".to_string(), "y".to_string()], 1)?;
    let cross = sorted(a.cartesian(&b).collect()?);
    assert_eq!(
        cross,
        sorted(vec![
            (1, "x".to_string()),
            (1, "y".to_string()),
            (2, "x".to_string()),
            (2, "y".to_string()),
        ])
    );
    Ok(())
}

#[test]
fn cartesian_replays_from_disk_spool() -> Result<()> {
    // A zero-capacity spool rolls to disk immediately, forcing the
    // decode-per-pass replay path.
    let ctx = Context::new(Config {
        spool_memory_mib: 0,
        ..Default::default()
    });
    let a = ctx.parallelize((0..20).collect::<Vec<i64>>(), 1)?;
    let b = ctx.parallelize((0..30).collect::<Vec<i64>>(), 1)?;
    let cross = a.cartesian(&b).collect()?;
    assert_eq!(cross.len(), 600);
    assert_eq!(cross[0], (0, 0));
    assert_eq!(cross[599], (19, 29));
    Ok(())
}

#[test]
fn try_map_respects_error_quota() -> Result<()> {
    let ctx = Context::default();
    // Zero tolerance: the first failing record is fatal.
    let strict = ctx
        .parallelize(vec!["1".to_string(), "x".to_string(), "3".to_string()], 1)?
        .try_map(|s| s.parse::<i64>().map_err(anyhow::Error::from));
    assert!(strict.collect().is_err());

    // Full tolerance: bad records are dropped.
    let lax = ctx
        .parallelize(vec!["1".to_string(), "x".to_string(), "3".to_string()], 1)?
        .with_err(1.0)
        .try_map(|s| s.parse::<i64>().map_err(anyhow::Error::from));
    assert_eq!(lax.collect()?, vec![1, 3]);
    Ok(())
}

#[test]
fn cached_dataset_computes_once() -> Result<()> {
    let ctx = Context::default();
    let computes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&computes);
    let ds = ctx
        .parallelize((0..10).collect::<Vec<i64>>(), 2)?
        .map(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            v * 2
        })
        .cache();
    let first = ds.collect()?;
    let after_first = computes.load(Ordering::SeqCst);
    let second = ds.collect()?;
    assert_eq!(first, second);
    assert_eq!(computes.load(Ordering::SeqCst), after_first);
    assert_eq!(after_first, 10);
    Ok(())
}

#[test]
fn deep_chains_do_not_overflow_the_stack() -> Result<()> {
    let ctx = Context::new(Config {
        recursion_limit: 100,
        ..Default::default()
    });
    let mut ds = ctx.parallelize(vec![1i64, 2, 3], 1)?;
    for _ in 0..1500 {
        ds = ds.map(|v| v);
    }
    assert_eq!(ds.collect()?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn top_and_top_by() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(vec![5, 1, 9, 3, 7, 2, 8], 3)?;
    assert_eq!(ds.top(3)?, vec![9, 8, 7]);
    assert_eq!(ds.top_by(2, |v| -v, false)?, vec![1, 2]);
    Ok(())
}

#[test]
fn foreach_visits_every_record() -> Result<()> {
    let ctx = Context::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    ctx.parallelize((0..25).collect::<Vec<i64>>(), 4)?
        .foreach(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
    assert_eq!(seen.load(Ordering::SeqCst), 25);
    Ok(())
}
