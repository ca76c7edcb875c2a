use anyhow::Result;
use millrace::*;
use std::io::Write;

fn lines(n: usize) -> Vec<String> {
    // Pseudo-random content so the data does not compress into nothing.
    (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            format!("line-{i:06}-{h:016x}")
        })
        .collect()
}

#[test]
fn write_then_read_roundtrip() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(1000);
    let published =
        ctx.parallelize(data.clone(), 3)?
            .save_as_text_file(dir.path(), "", true, false)?;
    assert_eq!(published.len(), 3);
    assert!(dir.path().join("0000").exists());

    let mut back = Vec::new();
    for path in &published {
        back.extend(ctx.text_file(path)?.collect()?);
    }
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn split_reads_equal_whole_file_reads() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(5000);
    ctx.parallelize(data.clone(), 1)?
        .save_as_text_file(dir.path(), "", true, false)?;
    let path = dir.path().join("0000");

    for n in [1usize, 2, 4, 13, 64] {
        let got = ctx
            .text_file_with(&path, Some(n), None)?
            .collect()?;
        assert_eq!(got, data, "with {n} splits");
    }
    Ok(())
}

#[test]
fn final_line_without_newline_is_still_emitted() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("raw.txt");
    let mut f = std::fs::File::create(&path)?;
    f.write_all(b"alpha\nbeta\ngamma")?;
    drop(f);

    for n in [1usize, 2, 4] {
        let got = ctx.text_file_with(&path, Some(n), None)?.collect()?;
        assert_eq!(got, vec!["alpha", "beta", "gamma"], "with {n} splits");
    }
    Ok(())
}

#[test]
fn empty_partitions_publish_nothing() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let published = ctx
        .parallelize(Vec::<String>::new(), 1)?
        .save_as_text_file(dir.path(), "", true, false)?;
    assert!(published.is_empty());
    // The staged temp file must not linger either.
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn partial_text_file_reads_a_byte_range() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("part.txt");
    std::fs::write(&path, b"aa\nbb\ncc\ndd\n")?;

    // Start inside the second line: it belongs to the owner of the byte
    // before, so reading resumes at the third line.
    let got = ctx.partial_text_file(&path, 4, 12, None)?.collect()?;
    assert_eq!(got, vec!["cc", "dd"]);

    // From zero the range owner reads from the very first byte.
    let all = ctx.partial_text_file(&path, 0, 12, None)?.collect()?;
    assert_eq!(all, vec!["aa", "bb", "cc", "dd"]);
    Ok(())
}

#[test]
fn glob_union_reads_files_in_sorted_order() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("b.txt"), b"three\nfour\n")?;
    std::fs::write(dir.path().join("a.txt"), b"one\ntwo\n")?;
    let pattern = format!("{}/*.txt", dir.path().display());
    let got = ctx.text_files(&pattern)?.collect()?;
    assert_eq!(got, vec!["one", "two", "three", "four"]);
    Ok(())
}

#[test]
fn multi_output_partitions_by_key() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let pairs = vec![
        ("red".to_string(), "r1".to_string()),
        ("blue".to_string(), "b1".to_string()),
        ("red".to_string(), "r2".to_string()),
    ];
    let published = ctx
        .parallelize(pairs, 1)?
        .save_as_text_file_by_key(dir.path(), "", true, false)?;
    assert_eq!(published.len(), 2);

    let red = ctx.text_file(dir.path().join("red").join("0000"))?.collect()?;
    assert_eq!(red, vec!["r1", "r2"]);
    let blue = ctx.text_file(dir.path().join("blue").join("0000"))?.collect()?;
    assert_eq!(blue, vec!["b1"]);
    Ok(())
}

#[cfg(feature = "io-csv")]
#[test]
fn csv_rows_roundtrip() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let rows = vec![
        vec!["a".to_string(), "1".to_string()],
        vec!["quoted,comma".to_string(), "2".to_string()],
        vec!["b".to_string(), "3".to_string()],
    ];
    let published = ctx
        .parallelize(rows.clone(), 1)?
        .save_as_csv_file(dir.path(), true, false)?;
    assert_eq!(published.len(), 1);

    let back = ctx.csv_file(&published[0])?.collect()?;
    assert_eq!(back, rows);
    Ok(())
}
