use anyhow::Result;
use millrace::*;

const RECORD_LEN: usize = 24;

fn records(n: usize) -> Vec<Vec<u8>> {
    (0..n as u64)
        .map(|i| {
            let mut rec = Vec::with_capacity(RECORD_LEN);
            rec.extend_from_slice(&i.to_le_bytes());
            rec.extend_from_slice(&i.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_le_bytes());
            rec.extend_from_slice(&i.wrapping_mul(0xc2b2_ae3d_27d4_eb4f).to_le_bytes());
            rec
        })
        .collect()
}

#[test]
fn roundtrip_fixed_records() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = records(1000);
    let published = ctx
        .parallelize(data.clone(), 2)?
        .save_as_binary_file(dir.path(), RECORD_LEN, true)?;
    assert_eq!(published.len(), 2);
    assert!(published[0].ends_with(".bin"));

    let mut back = Vec::new();
    for path in &published {
        back.extend(ctx.binary_file(path, RECORD_LEN, None)?.collect()?);
    }
    assert_eq!(back, data);
    Ok(())
}

#[test]
fn split_size_rounds_down_to_whole_records() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let data = records(10_000);
    let published = ctx
        .parallelize(data.clone(), 1)?
        .save_as_binary_file(dir.path(), RECORD_LEN, true)?;
    let path = &published[0];
    let size = std::fs::metadata(path)?.len();
    assert_eq!(size as usize, 10_000 * RECORD_LEN);

    for n in [1u64, 2, 4, 13, 64] {
        // A deliberately unaligned split size: the reader must still see
        // every record exactly once.
        let got = ctx
            .binary_file(path, RECORD_LEN, Some(size.div_ceil(n) + 5))?
            .collect()?;
        assert_eq!(got.len(), data.len(), "with {n} splits");
        assert_eq!(got, data, "with {n} splits");
    }
    Ok(())
}

#[test]
fn mismatched_record_length_is_rejected() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let res = ctx
        .parallelize(vec![vec![1u8, 2, 3]], 1)?
        .save_as_binary_file(dir.path(), RECORD_LEN, true);
    assert!(res.is_err());
    Ok(())
}
