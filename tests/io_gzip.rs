#![cfg(feature = "io-gzip")]

use anyhow::Result;
use millrace::*;

fn lines(n: usize) -> Vec<String> {
    // Hex-heavy content keeps the compression ratio modest so multi-split
    // reads exercise several sync blocks.
    (0..n)
        .map(|i| {
            let a = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let b = (i as u64).wrapping_mul(0xc2b2_ae3d_27d4_eb4f);
            format!("{i:06}:{a:016x}{b:016x}")
        })
        .collect()
}

fn write_gzip(ctx: &Context, dir: &std::path::Path, data: Vec<String>) -> Result<std::path::PathBuf> {
    let published = ctx
        .parallelize(data, 1)?
        .save_as_text_file(dir, "", true, true)?;
    assert_eq!(published.len(), 1);
    Ok(std::path::PathBuf::from(&published[0]))
}

#[test]
fn tiny_file_reads_back_with_three_splits() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let path = write_gzip(&ctx, dir.path(), data.clone())?;
    assert!(path.to_string_lossy().ends_with(".gz"));

    let size = std::fs::metadata(&path)?.len();
    let got = ctx.gzip_file(&path, Some(size.div_ceil(3)))?.collect()?;
    assert_eq!(got, data);
    Ok(())
}

#[test]
fn split_reads_equal_whole_file_reads() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(40_000);
    let path = write_gzip(&ctx, dir.path(), data.clone())?;
    let size = std::fs::metadata(&path)?.len();
    // The writer flushes every 256 KiB of input, so this file holds several
    // sync blocks.
    assert!(size > 512 << 10, "compressed size {size}");

    for n in [1u64, 2, 4, 13, 64] {
        let ds = ctx.gzip_file(&path, Some(size.div_ceil(n)))?;
        assert_eq!(ds.num_splits() as u64, n);
        let got = ds.collect()?;
        assert_eq!(got.len(), data.len(), "with {n} splits");
        assert_eq!(got, data, "with {n} splits");
    }
    Ok(())
}

#[test]
fn concatenated_members_read_as_one_stream() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let first = write_gzip(&ctx, &dir.path().join("a"), vec!["one".to_string(), "two".to_string()])?;
    let second = write_gzip(&ctx, &dir.path().join("b"), vec!["three".to_string()])?;

    let mut joined = std::fs::read(first)?;
    joined.extend(std::fs::read(second)?);
    let path = dir.path().join("joined.gz");
    std::fs::write(&path, joined)?;

    let got = ctx.gzip_file(&path, None)?.collect()?;
    assert_eq!(got, vec!["one", "two", "three"]);
    Ok(())
}

fn find_sync_markers(bytes: &[u8]) -> Vec<usize> {
    bytes
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == [0x00, 0x00, 0xff, 0xff])
        .map(|(i, _)| i)
        .collect()
}

#[test]
fn corruption_is_fatal_at_zero_tolerance() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(40_000);
    let path = write_gzip(&ctx, dir.path(), data)?;

    let mut bytes = std::fs::read(&path)?;
    let markers = find_sync_markers(&bytes);
    let target = markers
        .iter()
        .find(|m| **m > (64 << 10))
        .copied()
        .expect("a sync marker past the first chunk");
    // Zeroing the bytes after a sync point forges an invalid stored block.
    for b in &mut bytes[target + 4..target + 12] {
        *b = 0;
    }
    let corrupt = dir.path().join("corrupt.gz");
    std::fs::write(&corrupt, bytes)?;

    let res = ctx.gzip_file(&corrupt, None)?.collect();
    assert!(res.is_err());
    Ok(())
}

#[test]
fn corruption_drops_a_bounded_block_when_tolerated() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = lines(40_000);
    let path = write_gzip(&ctx, dir.path(), data.clone())?;

    let mut bytes = std::fs::read(&path)?;
    let markers = find_sync_markers(&bytes);
    let target = markers
        .iter()
        .find(|m| **m > (64 << 10))
        .copied()
        .expect("a sync marker past the first chunk");
    for b in &mut bytes[target + 4..target + 12] {
        *b = 0;
    }
    let corrupt = dir.path().join("corrupt.gz");
    std::fs::write(&corrupt, bytes)?;

    let got = ctx.gzip_file(&corrupt, None)?.with_err(1.0).collect()?;
    assert!(!got.is_empty());
    assert!(got.len() < data.len());

    // The surviving records are a prefix plus a suffix of the original: the
    // reader loses at most the region between the corrupt chunk and the
    // next sync boundary.
    let prefix = got
        .iter()
        .zip(data.iter())
        .take_while(|(a, b)| a == b)
        .count();
    assert!(prefix > 0, "nothing decoded before the corruption");
    let tail = got.len() - prefix;
    assert_eq!(
        &got[prefix..],
        &data[data.len() - tail..],
        "tail after resync must match the original"
    );
    Ok(())
}
