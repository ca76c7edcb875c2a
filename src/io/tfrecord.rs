//! Length-prefixed, CRC-checked record files (TFRecord framing).
//!
//! Each record is framed as
//! `u64 length LE | u32 masked_crc32c(length bytes) | payload | u32
//! masked_crc32c(payload)` where the mask is
//! `((crc >> 15) | (crc << 17)) + 0xa282ead8 mod 2^32` over CRC-32C.
//!
//! Split 0 starts at byte 0; a later split resynchronises by scanning forward
//! one byte at a time for a 12-byte window whose length mask verifies —
//! bytes before that point belong to the previous split. A record whose
//! header begins before the split's `end` belongs to the split even if its
//! payload extends past `end`. A length-mask mismatch after resync means the
//! end of valid data; a payload-mask mismatch is logged and the scanner
//! resynchronises past the bad header.

use crate::context::Context;
use crate::dataset::{Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs::{self, SeekableFile};
use crate::split::{RangeSplit, Split};
use anyhow::{Result, anyhow};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 64 << 20;
const HEADER_LEN: usize = 12;
/// Window size for the resync scan.
const READ_SIZE: usize = 1 << 10;

/// The TFRecord CRC mask over CRC-32C (Castagnoli).
pub fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(bytes);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Encode one record with the masked-CRC framing.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let len_bytes = (payload.len() as u64).to_le_bytes();
    let mut out = Vec::with_capacity(payload.len() + 16);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&masked_crc32c(&len_bytes).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&masked_crc32c(payload).to_le_bytes());
    out
}

/// Parse a candidate 12-byte header, returning the payload length when the
/// length mask verifies.
pub(crate) fn check_header(buf: &[u8]) -> Option<u64> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u64::from_le_bytes(buf[..8].try_into().ok()?);
    let expected = u32::from_le_bytes(buf[8..12].try_into().ok()?);
    (masked_crc32c(&buf[..8]) == expected).then_some(len)
}

/// TFRecord file split into byte ranges. Yields raw payload bytes.
pub struct TfRecordDataset {
    core: DatasetCore,
    path: PathBuf,
    ranges: Vec<(u64, u64)>,
    split_size: u64,
    gzipped: bool,
}

#[track_caller]
pub fn tfrecord_file(
    ctx: &Context,
    path: &Path,
    split_size: Option<u64>,
) -> Result<Dataset<Vec<u8>>> {
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let gzipped = path.extension().is_some_and(|e| e == "gz");
    let default = if gzipped {
        crate::io::gzip_default_split_size()
    } else {
        DEFAULT_SPLIT_SIZE
    };
    let split_size = split_size.unwrap_or(default).max(1);
    let ranges = fs::range_splits(size, split_size);
    Ok(Dataset::from_node(Arc::new(TfRecordDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        ranges,
        split_size,
        gzipped,
    })))
}

impl DatasetNode<Vec<u8>> for TfRecordDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<TfRecordFile {}>", self.path.display())
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.ranges
            .iter()
            .enumerate()
            .map(|(i, &(begin, end))| {
                Arc::new(RangeSplit {
                    index: i,
                    begin,
                    end,
                }) as Arc<dyn Split>
            })
            .collect()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<Vec<u8>>> {
        let rs = split
            .as_any()
            .downcast_ref::<RangeSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        let file = fs::open_file(&self.core.ctx.fs(), &self.path)?;
        if self.gzipped {
            self.compute_gz(file, rs)
        } else {
            Ok(Box::new(RawFrameIter::open(
                file,
                rs.begin,
                rs.end,
                self.path.clone(),
            )?))
        }
    }
}

#[cfg(feature = "io-gzip")]
impl TfRecordDataset {
    fn compute_gz(
        &self,
        mut file: Box<dyn SeekableFile>,
        rs: &RangeSplit,
    ) -> Result<PartIter<Vec<u8>>> {
        use crate::io::gzip::{GzChunkIter, split_block_range};
        let Some((start, end)) = split_block_range(file.as_mut(), rs.index, self.split_size)?
        else {
            return Ok(Box::new(std::iter::empty()));
        };
        let chunks = GzChunkIter::new(file, start, end, self.core.err(), &self.path)?;
        Ok(Box::new(GzFrameIter {
            chunks,
            buf: Vec::new(),
            synced: false,
            path: self.path.clone(),
        }))
    }
}

#[cfg(not(feature = "io-gzip"))]
impl TfRecordDataset {
    fn compute_gz(
        &self,
        _file: Box<dyn SeekableFile>,
        _rs: &RangeSplit,
    ) -> Result<PartIter<Vec<u8>>> {
        Err(anyhow!(
            "reading {}: gzip support is not enabled (feature `io-gzip`)",
            self.path.display()
        ))
    }
}

/// Frame reader over a raw byte range.
struct RawFrameIter {
    file: Box<dyn SeekableFile>,
    pos: u64,
    end: u64,
    path: PathBuf,
    done: bool,
}

impl RawFrameIter {
    fn open(file: Box<dyn SeekableFile>, begin: u64, end: u64, path: PathBuf) -> Result<Self> {
        let mut it = Self {
            file,
            pos: begin,
            end,
            path,
            done: false,
        };
        if !it.resync(begin)? {
            it.done = true;
        }
        Ok(it)
    }

    /// Scan forward from `from` for a verifying header strictly before
    /// `end`. Returns false when none exists.
    fn resync(&mut self, from: u64) -> Result<bool> {
        let mut at = from;
        let mut window: Vec<u8> = Vec::new();
        self.file.seek(SeekFrom::Start(at))?;
        loop {
            if at >= self.end {
                return Ok(false);
            }
            // Keep at least HEADER_LEN bytes of lookahead past `end` so a
            // header starting just before the boundary can verify.
            while window.len() < READ_SIZE {
                let mut chunk = vec![0u8; READ_SIZE - window.len()];
                let got = self.file.read(&mut chunk)?;
                if got == 0 {
                    break;
                }
                window.extend_from_slice(&chunk[..got]);
            }
            if window.len() < HEADER_LEN {
                return Ok(false);
            }
            let scan_max = window.len() - (HEADER_LEN - 1);
            for i in 0..scan_max {
                if at + i as u64 >= self.end {
                    return Ok(false);
                }
                if check_header(&window[i..i + HEADER_LEN]).is_some() {
                    self.pos = at + i as u64;
                    self.file.seek(SeekFrom::Start(self.pos))?;
                    return Ok(true);
                }
            }
            at += scan_max as u64;
            window.drain(..scan_max);
        }
    }

    fn read_exact_opt(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.file.read(&mut buf[filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        if filled < n {
            buf.truncate(filled);
            if filled == 0 {
                return Ok(None);
            }
            return Err(anyhow!(
                "truncated record in {}: wanted {n} bytes, got {filled}",
                self.path.display()
            ));
        }
        Ok(Some(buf))
    }
}

impl Iterator for RawFrameIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.end {
                return None;
            }
            let header = match self.read_exact_opt(HEADER_LEN) {
                Ok(Some(h)) => h,
                // Clean EOF or a short trailing header: end of valid data.
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) if e.downcast_ref::<std::io::Error>().is_none() => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let Some(len) = check_header(&header) else {
                // Length mask does not verify: end of valid data.
                self.done = true;
                return None;
            };
            let body = match self.read_exact_opt(len as usize + 4) {
                Ok(Some(b)) => b,
                Ok(None) | Err(_) => {
                    self.done = true;
                    return Some(Err(anyhow!(
                        "truncated record payload in {}",
                        self.path.display()
                    )));
                }
            };
            let payload = &body[..len as usize];
            let expected = u32::from_le_bytes([
                body[len as usize],
                body[len as usize + 1],
                body[len as usize + 2],
                body[len as usize + 3],
            ]);
            if masked_crc32c(payload) == expected {
                self.pos += HEADER_LEN as u64 + len + 4;
                return Some(Ok(payload.to_vec()));
            }
            log::error!(
                "tfrecord payload checksum mismatch in {}; resynchronising",
                self.path.display()
            );
            let from = self.pos + 1;
            match self.resync(from) {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Frame reader over decompressed sync-block chunks of a gzipped file.
/// Frames straddling block boundaries are buffered until complete.
#[cfg(feature = "io-gzip")]
struct GzFrameIter {
    chunks: crate::io::gzip::GzChunkIter,
    buf: Vec<u8>,
    synced: bool,
    path: PathBuf,
}

#[cfg(feature = "io-gzip")]
impl Iterator for GzFrameIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Resync within the buffered bytes.
            if !self.synced {
                let mut i = 0;
                while i + HEADER_LEN <= self.buf.len() {
                    if check_header(&self.buf[i..i + HEADER_LEN]).is_some() {
                        break;
                    }
                    i += 1;
                }
                self.buf.drain(..i);
                if self.buf.len() >= HEADER_LEN {
                    self.synced = true;
                }
            }
            if self.synced && self.buf.len() >= HEADER_LEN {
                match check_header(&self.buf[..HEADER_LEN]) {
                    None => {
                        // End of valid frames in this region; rescan.
                        self.synced = false;
                        self.buf.drain(..1);
                        continue;
                    }
                    Some(len) => {
                        let total = HEADER_LEN + len as usize + 4;
                        if self.buf.len() >= total {
                            let payload = self.buf[HEADER_LEN..HEADER_LEN + len as usize].to_vec();
                            let expected = u32::from_le_bytes([
                                self.buf[total - 4],
                                self.buf[total - 3],
                                self.buf[total - 2],
                                self.buf[total - 1],
                            ]);
                            self.buf.drain(..total);
                            if masked_crc32c(&payload) == expected {
                                return Some(Ok(payload));
                            }
                            log::error!(
                                "tfrecord payload checksum mismatch in {}; resynchronising",
                                self.path.display()
                            );
                            self.synced = false;
                            continue;
                        }
                    }
                }
            }
            // Need more decompressed bytes.
            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    if chunk.resynced {
                        self.buf.clear();
                        self.synced = false;
                    }
                    self.buf.extend_from_slice(&chunk.data);
                }
                Some(Err(e)) => return Some(Err(e)),
                // Dangling partial frame at the end of the range belongs to
                // no split; the writer aligns frames to flush boundaries.
                None => return None,
            }
        }
    }
}
