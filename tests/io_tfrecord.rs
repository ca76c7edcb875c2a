use anyhow::Result;
use millrace::*;

fn payloads(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            format!("record-{i:05}-{h:016x}").into_bytes()
        })
        .collect()
}

#[test]
fn writer_emits_masked_crc_framing() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let records = vec![b"x".to_vec(), b"yy".to_vec(), b"zzz".to_vec()];
    let published = ctx
        .parallelize(records.clone(), 1)?
        .save_as_tfrecord_file(dir.path(), true, false)?;
    assert_eq!(published.len(), 1);
    assert!(published[0].ends_with(".tfrecords"));

    let bytes = std::fs::read(&published[0])?;
    // First frame: u64 length 1, then the masked CRC of those 8 bytes.
    assert_eq!(&bytes[..8], &1u64.to_le_bytes());
    assert_eq!(
        &bytes[8..12],
        &masked_crc32c(&1u64.to_le_bytes()).to_le_bytes()
    );
    assert_eq!(bytes[12], b'x');
    assert_eq!(&bytes[13..17], &masked_crc32c(b"x").to_le_bytes());

    let back = ctx.tfrecord_file(&published[0], None)?.collect()?;
    assert_eq!(back, records);
    Ok(())
}

#[test]
fn split_reads_equal_whole_file_reads() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let records = payloads(20_000);
    let published = ctx
        .parallelize(records.clone(), 1)?
        .save_as_tfrecord_file(dir.path(), true, false)?;
    let path = &published[0];
    let size = std::fs::metadata(path)?.len();

    for n in [1u64, 2, 4, 13, 64] {
        let got = ctx
            .tfrecord_file(path, Some(size.div_ceil(n)))?
            .collect()?;
        assert_eq!(got.len(), records.len(), "with {n} splits");
        assert_eq!(got, records, "with {n} splits");
    }
    Ok(())
}

#[test]
fn resync_skips_junk_prefixes() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let records = payloads(50);
    let published = ctx
        .parallelize(records.clone(), 1)?
        .save_as_tfrecord_file(dir.path(), true, false)?;
    let clean = std::fs::read(&published[0])?;

    for junk_len in [0usize, 1, 7, 12, 64, 128] {
        let mut bytes = vec![0xABu8; junk_len];
        bytes.extend_from_slice(&clean);
        let path = dir.path().join(format!("junk-{junk_len}.tfrecords"));
        std::fs::write(&path, bytes)?;

        let got = ctx.tfrecord_file(&path, None)?.collect()?;
        assert_eq!(got, records, "with {junk_len} junk bytes");
    }
    Ok(())
}

#[test]
fn length_mask_mismatch_ends_the_valid_data() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let records = payloads(10);
    let published = ctx
        .parallelize(records.clone(), 1)?
        .save_as_tfrecord_file(dir.path(), true, false)?;
    let mut bytes = std::fs::read(&published[0])?;

    // Corrupt the length mask of the 6th frame: everything after it is
    // treated as the end of valid data.
    let frame = records[0].len() + 16;
    let at = frame * 5 + 8;
    bytes[at] ^= 0xFF;
    let path = dir.path().join("cut.tfrecords");
    std::fs::write(&path, bytes)?;

    let got = ctx.tfrecord_file(&path, None)?.collect()?;
    assert_eq!(got, records[..5].to_vec());
    Ok(())
}

#[cfg(feature = "io-gzip")]
#[test]
fn gzipped_tfrecords_roundtrip_with_splits() -> Result<()> {
    let ctx = Context::default();
    let dir = tempfile::tempdir()?;
    let records = payloads(20_000);
    let published = ctx
        .parallelize(records.clone(), 1)?
        .save_as_tfrecord_file(dir.path(), true, true)?;
    assert!(published[0].ends_with(".tfrecords.gz"));
    let size = std::fs::metadata(&published[0])?.len();

    for n in [1u64, 3, 8] {
        let got = ctx
            .tfrecord_file(&published[0], Some(size.div_ceil(n)))?
            .collect()?;
        assert_eq!(got.len(), records.len(), "with {n} splits");
        assert_eq!(got, records, "with {n} splits");
    }
    Ok(())
}
