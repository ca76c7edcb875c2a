use anyhow::Result;
use millrace::*;

#[test]
fn sort_small_dataset() -> Result<()> {
    let ctx = Context::default();
    let got = ctx.parallelize(vec![5, 2, 8, 1, 4], 2)?.sort(false, None)?.collect()?;
    assert_eq!(got, vec![1, 2, 4, 5, 8]);
    Ok(())
}

#[test]
fn sort_reverse() -> Result<()> {
    let ctx = Context::default();
    let got = ctx
        .parallelize(vec![5, 2, 8, 1, 4], 2)?
        .sort(true, None)?
        .collect()?;
    assert_eq!(got, vec![8, 5, 4, 2, 1]);
    Ok(())
}

#[test]
fn sort_single_split_short_circuits_locally() -> Result<()> {
    let ctx = Context::default();
    let ds = ctx.parallelize(vec![3, 1, 2], 1)?.sort(false, None)?;
    assert_eq!(ds.num_splits(), 1);
    assert_eq!(ds.collect()?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn sort_large_dataset_across_partitions() -> Result<()> {
    let ctx = Context::default();
    let data: Vec<i64> = (0..10_000)
        .map(|i| (i * 0x9e37) % 7919)
        .collect();
    let mut expect = data.clone();
    expect.sort();
    let got = ctx
        .parallelize(data, 8)?
        .sort(false, Some(4))?
        .collect()?;
    assert_eq!(got, expect);
    Ok(())
}

#[test]
fn sort_by_derived_key() -> Result<()> {
    let ctx = Context::default();
    let words = vec![
        "pear".to_string(),
        "fig".to_string(),
        "banana".to_string(),
        "kiwi".to_string(),
    ];
    let got = ctx
        .parallelize(words, 2)?
        .sort_by(|w| w.len(), false, None)?
        .collect()?;
    let lens: Vec<usize> = got.iter().map(String::len).collect();
    assert_eq!(lens, vec![3, 4, 4, 6]);
    Ok(())
}

#[test]
fn sort_empty_dataset() -> Result<()> {
    let ctx = Context::default();
    let got = ctx
        .parallelize(Vec::<i64>::new(), 1)?
        .sort(false, None)?
        .collect()?;
    assert!(got.is_empty());
    Ok(())
}
