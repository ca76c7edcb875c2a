//! Block-aligned bzip2 text files.
//!
//! Works on files whose compressed blocks are complete bzip2 streams laid
//! end to end (pbzip2 and [`Bzip2BlockWriter`] both produce this shape; a
//! plain single-stream file degrades to one effective split). The first ten
//! bytes of the file — stream header plus block magic — are the signature
//! every block starts with, so a split can scan forward to the next block
//! boundary at or after its nominal begin and decompress whole blocks
//! independently. Lines straddling a split boundary are recovered by probing
//! earlier block offsets, symmetric to the gzip reader.

use crate::context::Context;
use crate::dataset::{Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs::{self, SeekableFile};
use crate::split::{IndexSplit, Split, index_splits};
use anyhow::{Result, anyhow};
use bzip2::read::MultiBzDecoder;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 32 << 20;
/// Scan stride while hunting for the next block signature, and the stride of
/// the straddle probe. Matches the smallest bzip2 block size.
pub const BLOCK_SIZE: u64 = 9000;
/// How many preceding block offsets the straddle probe inspects.
pub const PROBE_BLOCKS: u64 = 100;

const MAGIC_LEN: usize = 10;

/// Block-aligned bzip2 text file.
pub struct Bzip2FileDataset {
    core: DatasetCore,
    path: PathBuf,
    split_size: u64,
    num_splits: usize,
}

#[track_caller]
pub fn bzip2_file(ctx: &Context, path: &Path, split_size: Option<u64>) -> Result<Dataset<String>> {
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let split_size = split_size.unwrap_or(DEFAULT_SPLIT_SIZE).max(1);
    let num_splits = size.div_ceil(split_size).max(1) as usize;
    Ok(Dataset::from_node(Arc::new(Bzip2FileDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        split_size,
        num_splits,
    })))
}

fn read_up_to(f: &mut dyn SeekableFile, n: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let got = f.read(&mut buf[filled..])?;
        if got == 0 {
            break;
        }
        filled += got;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// File offset of the next block signature at or after `pos`, if any.
fn find_magic(f: &mut dyn SeekableFile, mut pos: u64, magic: &[u8]) -> Result<Option<u64>> {
    f.seek(SeekFrom::Start(pos))?;
    let mut block = read_up_to(f, 32 << 10)?;
    if block.len() < magic.len() {
        return Ok(None);
    }
    loop {
        if let Some(p) = find_sub(&block, magic) {
            return Ok(Some(pos + p as u64));
        }
        pos += (block.len() - magic.len() + 1) as u64;
        let keep = block.len() - (magic.len() - 1);
        block.drain(..keep);
        let more = read_up_to(f, 32 << 10)?;
        if more.is_empty() {
            return Ok(None);
        }
        block.extend_from_slice(&more);
    }
}

// MultiBzDecoder: the probe window may span several complete streams.
fn decompress_stream(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiBzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| anyhow!("bzip2 decompress: {e}"))?;
    Ok(out)
}

impl Bzip2FileDataset {
    /// Recover the fragment of a line begun in the previous split by probing
    /// earlier offsets for a decodable block.
    fn straddle_fragment(
        &self,
        f: &mut dyn SeekableFile,
        first: u64,
        magic: &[u8],
    ) -> Result<Vec<u8>> {
        for i in 1..=PROBE_BLOCKS {
            if first < i * BLOCK_SIZE {
                break;
            }
            let pos = first - i * BLOCK_SIZE;
            f.seek(SeekFrom::Start(pos))?;
            let window = read_up_to(f, (first - pos) as usize)?;
            if let Some(np) = find_sub(&window, magic)
                && let Ok(out) = decompress_stream(&window[np..])
            {
                let fragment = match out.iter().rposition(|b| *b == b'\n') {
                    Some(nl) => out[nl + 1..].to_vec(),
                    None => out,
                };
                return Ok(fragment);
            }
        }
        Ok(Vec::new())
    }
}

impl DatasetNode<String> for Bzip2FileDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Bzip2File {}>", self.path.display())
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        index_splits(self.num_splits)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<String>> {
        let idx = split
            .as_any()
            .downcast_ref::<IndexSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?
            .index;
        let mut file = fs::open_file(&self.core.ctx.fs(), &self.path)?;
        file.seek(SeekFrom::Start(0))?;
        let magic = read_up_to(file.as_mut(), MAGIC_LEN)?;
        if magic.len() < MAGIC_LEN {
            return Ok(Box::new(std::iter::empty()));
        }

        let begin = idx as u64 * self.split_size;
        let nominal_end = begin + self.split_size;
        let Some(first) = find_magic(file.as_mut(), begin, &magic)? else {
            return Ok(Box::new(std::iter::empty()));
        };
        if first >= nominal_end {
            return Ok(Box::new(std::iter::empty()));
        }
        // The last owned block starts before the nominal end and runs to the
        // next signature (or EOF).
        let end = match find_magic(file.as_mut(), nominal_end, &magic)? {
            Some(e) => e,
            None => file.length(),
        };

        let carry = if idx == 0 {
            Vec::new()
        } else {
            self.straddle_fragment(file.as_mut(), first, &magic)?
        };

        file.seek(SeekFrom::Start(first))?;
        let data = read_up_to(file.as_mut(), (end - first) as usize)?;

        Ok(Box::new(Bz2LineIter {
            data,
            magic: magic.to_vec(),
            path: self.path.clone(),
            offset: 0,
            carry,
            pending: std::collections::VecDeque::new(),
            done: false,
        }))
    }
}

/// Splits the owned byte range on block signatures, decompressing each block
/// independently and assembling lines across block boundaries. Undecodable
/// candidates (signature bytes occurring inside compressed data) are dropped
/// with a logged byte count.
struct Bz2LineIter {
    data: Vec<u8>,
    magic: Vec<u8>,
    path: PathBuf,
    offset: usize,
    carry: Vec<u8>,
    pending: std::collections::VecDeque<Result<String>>,
    done: bool,
}

impl Bz2LineIter {
    fn ingest_block(&mut self) {
        if self.offset >= self.data.len() {
            self.done = true;
            return;
        }
        let rest = &self.data[self.offset..];
        let seg_len = match find_sub(&rest[self.magic.len().min(rest.len())..], &self.magic) {
            Some(p) => p + self.magic.len(),
            None => rest.len(),
        };
        let segment = &rest[..seg_len];
        match decompress_stream(segment) {
            Ok(out) => {
                let mut bytes = out.as_slice();
                while let Some(nl) = bytes.iter().position(|b| *b == b'\n') {
                    let mut line = std::mem::take(&mut self.carry);
                    line.extend_from_slice(&bytes[..nl]);
                    bytes = &bytes[nl + 1..];
                    self.pending.push_back(
                        String::from_utf8(line).map_err(|e| anyhow!("invalid utf-8 line: {e}")),
                    );
                }
                self.carry.extend_from_slice(bytes);
            }
            Err(_) => {
                log::warn!(
                    "drop undecodable bzip2 block candidate ({} bytes) in {}",
                    seg_len,
                    self.path.display()
                );
            }
        }
        self.offset += seg_len;
        if self.offset >= self.data.len() {
            self.done = true;
        }
    }
}

impl Iterator for Bz2LineIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.done {
                // A trailing fragment without a newline belongs to the next
                // split's recovery probe.
                return None;
            }
            self.ingest_block();
        }
    }
}

/// Writer producing pbzip2-shaped output: one complete bzip2 stream per
/// 256 KiB of input, so the reader can split the result.
pub struct Bzip2BlockWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

const WRITE_BLOCK: usize = 256 << 10;

impl<W: Write> Bzip2BlockWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    fn emit_stream(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut enc = bzip2::write::BzEncoder::new(&mut self.inner, bzip2::Compression::best());
        enc.write_all(&self.buf)?;
        enc.finish()?;
        self.buf.clear();
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<W> {
        self.emit_stream()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Bzip2BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= WRITE_BLOCK {
            self.emit_stream()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.emit_stream()?;
        self.inner.flush()
    }
}
