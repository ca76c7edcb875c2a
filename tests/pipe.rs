#![cfg(unix)]

use anyhow::Result;
use millrace::*;

#[test]
fn pipe_through_cat_is_identity() -> Result<()> {
    let ctx = Context::default();
    let data: Vec<String> = (0..100).map(|i| format!("line-{i}")).collect();
    let out = ctx
        .parallelize(data.clone(), 3)?
        .pipe(&["cat"], true)
        .collect()?;
    assert_eq!(out, data);
    Ok(())
}

#[test]
fn pipe_transforms_records() -> Result<()> {
    let ctx = Context::default();
    let out = ctx
        .parallelize(vec!["a".to_string(), "b".to_string()], 1)?
        .pipe(&["tr", "a-z", "A-Z"], true)
        .collect()?;
    assert_eq!(out, vec!["A", "B"]);
    Ok(())
}

#[test]
fn broken_pipe_from_an_early_exit_is_not_fatal() -> Result<()> {
    let ctx = Context::default();
    let data: Vec<String> = (0..100_000).map(|i| format!("line-{i}")).collect();
    // `head` closes stdin after one line; the feeder sees a broken pipe,
    // which must not fail the task.
    let out = ctx
        .parallelize(data, 1)?
        .pipe(&["head", "-n", "1"], true)
        .collect()?;
    assert_eq!(out, vec!["line-0"]);
    Ok(())
}
