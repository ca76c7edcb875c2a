use anyhow::Result;
use millrace::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn checkpoint_materializes_and_collapses_dependencies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Context::new(Config {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    });

    let computes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&computes);
    let ds = ctx
        .parallelize((0..20).collect::<Vec<i64>>(), 4)?
        .map(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            v * 3
        })
        .checkpoint(None)?;

    assert_eq!(ds.dependencies().len(), 1);

    let first = ds.collect()?;
    assert_eq!(first, (0..20).map(|v| v * 3).collect::<Vec<i64>>());
    let computed = computes.load(Ordering::SeqCst);
    assert_eq!(computed, 20);

    // One subdirectory per checkpointed dataset, one file per split.
    let sub = std::fs::read_dir(dir.path())?
        .next()
        .expect("checkpoint subdir")?
        .path();
    for i in 0..4 {
        assert!(sub.join(i.to_string()).exists(), "missing split {i}");
    }

    // The second run reads the checkpoint instead of recomputing, and the
    // upstream edges have collapsed away.
    let second = ds.collect()?;
    assert_eq!(second, first);
    assert_eq!(computes.load(Ordering::SeqCst), computed);
    assert!(ds.dependencies().is_empty());
    Ok(())
}

#[test]
fn checkpoint_directory_reads_back_as_a_leaf_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Context::new(Config {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let ds = ctx
        .parallelize((0..12).collect::<Vec<i64>>(), 3)?
        .checkpoint(None)?;
    let expect = ds.collect()?;

    let sub = std::fs::read_dir(dir.path())?
        .next()
        .expect("checkpoint subdir")?
        .path();
    let leaf = ctx.checkpoint_file::<i64>(&sub)?;
    assert_eq!(leaf.num_splits(), 3);
    assert!(leaf.dependencies().is_empty());
    assert_eq!(leaf.collect()?, expect);
    Ok(())
}

#[test]
fn checkpoint_without_a_directory_is_a_noop() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx
        .parallelize(vec![1i64, 2, 3], 1)?
        .checkpoint(None)?;
    assert_eq!(ds.collect()?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn explicit_checkpoint_path_overrides_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Context::default();
    let ds = ctx
        .parallelize(vec![5i64, 6], 2)?
        .checkpoint(Some(dir.path().to_path_buf()))?;
    assert_eq!(ds.collect()?, vec![5, 6]);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}
