//! File-system seam.
//!
//! Split readers consume files through this pluggable trait pair so the same
//! reader logic works against local disk and distributed stores. A file is a
//! seekable byte stream with a known length and, for distributed
//! implementations, per-chunk host hints that flow into split preferred
//! locations (resolving raw addresses to hostnames is the implementation's
//! concern).

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

/// Chunk granularity assumed by locality mapping.
pub const CHUNKSIZE: u64 = 64 << 20;

/// A pluggable file store.
pub trait Fs: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn SeekableFile>>;
}

/// A seekable input file.
pub trait SeekableFile: Read + Seek + Send {
    /// Total length in bytes.
    fn length(&self) -> u64;

    /// Hosts holding the chunk at `chunk_index`, best-effort.
    fn locs(&self, _chunk_index: u64) -> Vec<String> {
        Vec::new()
    }
}

/// Local-disk implementation.
pub struct LocalFs;

impl Fs for LocalFs {
    fn open(&self, path: &Path) -> Result<Box<dyn SeekableFile>> {
        let file =
            File::open(path).with_context(|| format!("open file {}", path.display()))?;
        let length = file
            .metadata()
            .with_context(|| format!("stat file {}", path.display()))?
            .len();
        Ok(Box::new(LocalFile { file, length }))
    }
}

struct LocalFile {
    file: File,
    length: u64,
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalFile {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SeekableFile for LocalFile {
    fn length(&self) -> u64 {
        self.length
    }
}

/// Open a file through a store handle.
pub fn open_file(fs: &Arc<dyn Fs>, path: &Path) -> Result<Box<dyn SeekableFile>> {
    fs.open(path)
}

/// Byte-range split table for a file of `size` bytes: `ceil(size /
/// split_size)` ranges of `split_size` bytes, the last one short.
pub fn range_splits(size: u64, split_size: u64) -> Vec<(u64, u64)> {
    let split_size = split_size.max(1);
    let mut out = Vec::new();
    let mut begin = 0;
    while begin < size {
        let end = (begin + split_size).min(size);
        out.push((begin, end));
        begin = end;
    }
    if out.is_empty() {
        out.push((0, 0));
    }
    out
}

/// Resolve an explicit split count / size pair the way the readers do:
/// explicit size wins, else `size / num_splits`, else the format default.
pub fn effective_split_size(
    size: u64,
    num_splits: Option<usize>,
    split_size: Option<u64>,
    default: u64,
) -> u64 {
    match (split_size, num_splits) {
        (Some(s), _) => s.max(1),
        (None, Some(n)) if n > 0 => {
            let s = size / n as u64;
            if s == 0 { default } else { s }
        }
        _ => default,
    }
}

/// Preferred hosts for a byte-range split, unioned over the chunks the range
/// touches.
pub fn range_locs(file: &dyn SeekableFile, begin: u64, end: u64) -> Vec<String> {
    let first = begin / CHUNKSIZE;
    let last = end.div_ceil(CHUNKSIZE).max(first + 1);
    let mut hosts = Vec::new();
    for chunk in first..last {
        hosts.extend(file.locs(chunk));
    }
    hosts
}
