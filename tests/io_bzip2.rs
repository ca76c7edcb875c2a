#![cfg(feature = "io-bzip2")]

use anyhow::Result;
use millrace::*;

fn lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let a = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            format!("{i:06}:{a:016x}")
        })
        .collect()
}

fn write_bzip2(
    ctx: &Context,
    dir: &std::path::Path,
    data: Vec<String>,
) -> Result<std::path::PathBuf> {
    let published = ctx
        .parallelize(data, 1)?
        .save_as_bzip2_text_file(dir, "", true)?;
    assert_eq!(published.len(), 1);
    Ok(std::path::PathBuf::from(&published[0]))
}

#[test]
fn roundtrip_small_file() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let path = write_bzip2(&ctx, dir.path(), data.clone())?;
    assert!(path.to_string_lossy().ends_with(".bz2"));

    let got = ctx.bzip2_file(&path, None)?.collect()?;
    assert_eq!(got, data);
    Ok(())
}

#[test]
fn split_reads_equal_whole_file_reads() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(60_000);
    let path = write_bzip2(&ctx, dir.path(), data.clone())?;
    let size = std::fs::metadata(&path)?.len();

    // The writer emits one complete stream per 256 KiB of input, so the
    // file holds several block signatures.
    let raw = std::fs::read(&path)?;
    let signature = &raw[..10];
    let streams = raw
        .windows(10)
        .filter(|w| *w == signature)
        .count();
    assert!(streams >= 3, "only {streams} streams");

    for n in [1u64, 2, 4, 13, 64] {
        let got = ctx
            .bzip2_file(&path, Some(size.div_ceil(n)))?
            .collect()?;
        assert_eq!(got.len(), data.len(), "with {n} splits");
        assert_eq!(got, data, "with {n} splits");
    }
    Ok(())
}

#[test]
fn single_stream_file_degrades_to_one_split() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("single.bz2");
    let data = vec!["one".to_string(), "two".to_string(), "three".to_string()];
    {
        use std::io::Write;
        let file = std::fs::File::create(&path)?;
        let mut enc = bzip2::write::BzEncoder::new(file, bzip2::Compression::best());
        for line in &data {
            enc.write_all(line.as_bytes())?;
            enc.write_all(b"\n")?;
        }
        enc.finish()?;
    }

    // Even with many nominal splits, only the one containing the stream
    // start yields records.
    let size = std::fs::metadata(&path)?.len();
    let got = ctx
        .bzip2_file(&path, Some(size.div_ceil(4).max(1)))?
        .collect()?;
    assert_eq!(got, data);
    Ok(())
}
