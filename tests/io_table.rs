#![cfg(feature = "io-table")]

use anyhow::Result;
use millrace::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Event {
    id: u64,
    name: String,
    tags: Vec<String>,
}

fn events(n: usize) -> Vec<Event> {
    (0..n as u64)
        .map(|i| Event {
            id: i,
            name: format!("event-{i:06}-{:016x}", i.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
            tags: vec![format!("t{}", i % 7), format!("u{}", i % 3)],
        })
        .collect()
}

#[test]
fn roundtrip_uncompressed_blocks() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = events(500);
    let published = ctx
        .parallelize(data.clone(), 2)?
        .save_as_table_file(dir.path(), true, false)?;
    assert_eq!(published.len(), 2);
    assert!(published[0].ends_with(".tab"));

    let mut back = Vec::new();
    for path in &published {
        back.extend(ctx.table_file::<Event>(path, None)?.collect()?);
    }
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn roundtrip_compressed_blocks() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = events(500);
    let published = ctx
        .parallelize(data.clone(), 1)?
        .save_as_table_file(dir.path(), true, true)?;
    let back = ctx.table_file::<Event>(&published[0], None)?.collect()?;
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn split_reads_equal_whole_file_reads() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    // Enough payload for several 256 KiB blocks.
    let data = events(20_000);
    let published = ctx
        .parallelize(data.clone(), 1)?
        .save_as_table_file(dir.path(), true, false)?;
    let path = &published[0];
    let size = std::fs::metadata(path)?.len();

    for n in [1u64, 2, 4, 13, 64] {
        let got = ctx
            .table_file::<Event>(path, Some(size.div_ceil(n)))?
            .collect()?;
        assert_eq!(got.len(), data.len(), "with {n} splits");
        assert_eq!(got, data, "with {n} splits");
    }
    Ok(())
}
