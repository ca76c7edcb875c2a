//! Seekable gzip: sync-block scanning, split reading and re-splittable
//! writing.
//!
//! The reader assumes input produced with periodic sync flushes (our own
//! writer, or `pigz -i`): every flush emits the empty stored block marker
//! `00 00 FF FF` and resets the DEFLATE history, so decompression can start
//! at any validated marker. [`find_block`] locates the next such boundary;
//! candidates are verified by actually inflating the bytes that follow
//! (false markers appear inside compressed data) and accepting only streams
//! that produce output with at most 8 trailing unused bytes.
//!
//! A split covers the validated boundaries enclosing its nominal byte range.
//! Decompression proceeds in 64 KiB chunks; a corrupt chunk is fatal when the
//! dataset's error tolerance is effectively zero, otherwise the reader skips
//! to the next boundary and logs the number of bytes dropped. Concatenated
//! gzip members are handled by skipping the next member header whenever a
//! stream ends with unconsumed bytes remaining.

use crate::context::Context;
use crate::dataset::{Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs::{self, SeekableFile};
use crate::split::{IndexSplit, Split, index_splits};
use anyhow::{Result, anyhow, bail};
use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 32 << 20;
/// Chunk size for streaming decompression, and the stride of the
/// line-straddle probe.
pub const BLOCK_SIZE: u64 = 64 << 10;
/// How many preceding blocks the straddle probe inspects before giving up.
pub const GZIP_PROBE_BLOCKS: u64 = 100;
/// Input bytes between sync flushes emitted by [`SyncGzWriter`].
pub const FLUSH_INTERVAL: usize = 256 << 10;

const SYNC_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const SCAN_WINDOW: usize = 32 << 10;

// ---------------------------------------------------------------------------
// boundary scanning
// ---------------------------------------------------------------------------

fn read_up_to(f: &mut dyn SeekableFile, n: usize) -> io::Result<Vec<u8>> {
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

/// Inflate `input` with a fresh raw-DEFLATE state; true when it looks like a
/// valid block start (produces output, with at most 8 trailing unused bytes
/// if the stream ends).
fn validates_as_block_start(input: &[u8]) -> bool {
    let mut dz = Decompress::new(false);
    let mut scratch = vec![0u8; 64 << 10];
    let mut consumed = 0usize;
    let mut produced = 0u64;
    loop {
        let before_in = dz.total_in();
        let before_out = dz.total_out();
        let status = match dz.decompress(&input[consumed..], &mut scratch, FlushDecompress::None) {
            Ok(s) => s,
            Err(_) => return false,
        };
        consumed += (dz.total_in() - before_in) as usize;
        produced += dz.total_out() - before_out;
        match status {
            Status::StreamEnd => {
                let unused = input.len() - consumed;
                return produced > 0 && unused <= 8;
            }
            Status::Ok | Status::BufError => {
                if consumed >= input.len() || dz.total_out() == before_out {
                    return produced > 0;
                }
            }
        }
    }
}

/// Find the next validated sync-block boundary at or after `pos`. Returns the
/// end-of-file offset when no boundary exists.
pub fn find_block(f: &mut dyn SeekableFile, mut pos: u64) -> Result<u64> {
    f.seek(SeekFrom::Start(pos))?;
    let mut block = read_up_to(f, SCAN_WINDOW)?;
    if block.len() < 4 {
        return Ok(f.seek(SeekFrom::End(0))?);
    }
    loop {
        let mut hit = find_sub(&block, &SYNC_MARKER);
        while hit.is_none() {
            pos += block.len().saturating_sub(3) as u64;
            let keep = block.len().saturating_sub(3);
            let mut next = block.split_off(keep);
            std::mem::swap(&mut block, &mut next);
            block.extend_from_slice(&read_up_to(f, SCAN_WINDOW)?);
            if block.len() < 4 {
                return Ok(pos + 3);
            }
            hit = find_sub(&block, &SYNC_MARKER);
        }
        let p = hit.unwrap_or(0);
        pos += (p + 4) as u64;
        block.drain(..p + 4);
        if block.len() < 4096 {
            block.extend_from_slice(&read_up_to(f, 4096)?);
            if block.is_empty() {
                return Ok(pos);
            }
        }
        if validates_as_block_start(&block) {
            return Ok(pos);
        }
    }
}

/// Length of the gzip member header starting at `header[0]`.
fn gzip_header_len(h: &[u8]) -> Result<usize> {
    if h.len() < 10 || h[0] != 0x1f || h[1] != 0x8b {
        bail!("not a gzip member header");
    }
    if h[2] != 8 {
        bail!("unsupported gzip compression method {}", h[2]);
    }
    let flg = h[3];
    let mut i = 10usize;
    if flg & 0x04 != 0 {
        if h.len() < i + 2 {
            bail!("truncated gzip header");
        }
        let xlen = u16::from_le_bytes([h[i], h[i + 1]]) as usize;
        i += 2 + xlen;
    }
    for flag in [0x08u8, 0x10] {
        if flg & flag != 0 {
            while i < h.len() && h[i] != 0 {
                i += 1;
            }
            i += 1; // the NUL
        }
    }
    if flg & 0x02 != 0 {
        i += 2;
    }
    if i > h.len() {
        bail!("truncated gzip header");
    }
    Ok(i)
}

/// Skip the gzip member header at `start`, returning the offset of the first
/// DEFLATE byte.
pub fn skip_gzip_header(f: &mut dyn SeekableFile, start: u64) -> Result<u64> {
    f.seek(SeekFrom::Start(start))?;
    let head = read_up_to(f, 64 << 10)?;
    Ok(start + gzip_header_len(&head)? as u64)
}

/// The `[start, end)` compressed byte range a split owns, or `None` when the
/// split is empty (its first boundary lies past its nominal end).
pub(crate) fn split_block_range(
    f: &mut dyn SeekableFile,
    index: usize,
    split_size: u64,
) -> Result<Option<(u64, u64)>> {
    let nominal = index as u64 * split_size;
    let start = if index == 0 {
        skip_gzip_header(f, 0)?
    } else {
        let start = find_block(f, nominal)?;
        if start >= nominal + split_size {
            return Ok(None);
        }
        start
    };
    let end = find_block(f, nominal + split_size)?;
    Ok(Some((start, end)))
}

// ---------------------------------------------------------------------------
// chunked split decompression
// ---------------------------------------------------------------------------

/// One decompressed chunk of a split.
pub(crate) struct GzChunk {
    pub data: Vec<u8>,
    /// True when this chunk is the first after a corruption resync; any
    /// record state carried across the gap must be discarded.
    pub resynced: bool,
}

/// Streams the decompressed bytes of `[pos, end)` in 64 KiB chunks, with
/// corruption recovery and concatenated-member handling.
pub(crate) struct GzChunkIter {
    file: Box<dyn SeekableFile>,
    path: PathBuf,
    pos: u64,
    end: u64,
    dz: Decompress,
    err_tolerant: bool,
    resync_pending: bool,
    done: bool,
}

impl GzChunkIter {
    pub(crate) fn new(
        mut file: Box<dyn SeekableFile>,
        start: u64,
        end: u64,
        err: f64,
        path: &Path,
    ) -> Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pos: start,
            end,
            dz: Decompress::new(false),
            err_tolerant: err >= 1e-6,
            resync_pending: false,
            done: false,
        })
    }

    fn inflate(&mut self, input: &[u8]) -> std::result::Result<(Vec<u8>, bool, usize), ()> {
        let mut out = Vec::new();
        let mut scratch = vec![0u8; 64 << 10];
        let mut consumed = 0usize;
        loop {
            let before_in = self.dz.total_in();
            let before_out = self.dz.total_out();
            let status = self
                .dz
                .decompress(&input[consumed..], &mut scratch, FlushDecompress::None)
                .map_err(|_| ())?;
            consumed += (self.dz.total_in() - before_in) as usize;
            let produced = (self.dz.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);
            match status {
                Status::StreamEnd => return Ok((out, true, consumed)),
                Status::Ok | Status::BufError => {
                    if consumed >= input.len() || (produced == 0 && consumed == 0) {
                        return Ok((out, false, consumed));
                    }
                }
            }
        }
    }

    /// Move past the 8-byte trailer and the following member header, resetting
    /// the DEFLATE state. `trailer_at` is the file offset of the first
    /// unconsumed byte. Returns false at end of data.
    fn enter_next_member(&mut self, trailer_at: u64) -> Result<bool> {
        let header_at = trailer_at + 8;
        if header_at >= self.file.length() {
            return Ok(false);
        }
        match skip_gzip_header(self.file.as_mut(), header_at) {
            Ok(data_at) => {
                self.dz = Decompress::new(false);
                self.pos = data_at;
                self.file.seek(SeekFrom::Start(data_at))?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

impl Iterator for GzChunkIter {
    type Item = Result<GzChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.end {
                return None;
            }
            let want = (self.end - self.pos).min(BLOCK_SIZE) as usize;
            let chunk = match read_up_to(self.file.as_mut(), want) {
                Ok(c) => c,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if chunk.is_empty() {
                self.done = true;
                return None;
            }
            self.pos += chunk.len() as u64;

            match self.inflate(&chunk) {
                Err(()) => {
                    if !self.err_tolerant {
                        self.done = true;
                        log::error!("failed to decompress file: {}", self.path.display());
                        return Some(Err(anyhow!(
                            "corrupt gzip block in {}",
                            self.path.display()
                        )));
                    }
                    let old = self.pos;
                    let next = match find_block(self.file.as_mut(), self.pos) {
                        Ok(b) => b,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    log::error!(
                        "drop corrupted block ({} bytes) in {}",
                        next - old + chunk.len() as u64,
                        self.path.display()
                    );
                    if let Err(e) = self.file.seek(SeekFrom::Start(next)) {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                    self.pos = next;
                    self.dz = Decompress::new(false);
                    self.resync_pending = true;
                    continue;
                }
                Ok((data, stream_end, consumed)) => {
                    if stream_end {
                        let trailer_at = self.pos - (chunk.len() - consumed) as u64;
                        match self.enter_next_member(trailer_at) {
                            Ok(true) => {}
                            Ok(false) => self.done = true,
                            Err(e) => {
                                self.done = true;
                                return Some(Err(e));
                            }
                        }
                    }
                    if data.is_empty() {
                        continue;
                    }
                    let resynced = self.resync_pending;
                    self.resync_pending = false;
                    return Some(Ok(GzChunk { data, resynced }));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// line dataset
// ---------------------------------------------------------------------------

/// Sync-flushed gzip text file, split on validated block boundaries.
pub struct GzipFileDataset {
    core: DatasetCore,
    path: PathBuf,
    split_size: u64,
    num_splits: usize,
}

#[track_caller]
pub fn gzip_file(ctx: &Context, path: &Path, split_size: Option<u64>) -> Result<Dataset<String>> {
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let split_size = split_size.unwrap_or(DEFAULT_SPLIT_SIZE).max(1);
    let num_splits = size.div_ceil(split_size).max(1) as usize;
    Ok(Dataset::from_node(Arc::new(GzipFileDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        split_size,
        num_splits,
    })))
}

impl GzipFileDataset {
    /// Recover the fragment of a line that starts in the previous split:
    /// probe up to [`GZIP_PROBE_BLOCKS`] earlier block offsets for a boundary
    /// whose decompression contains a newline; the bytes after the last
    /// newline prefix this split's first line.
    fn straddle_fragment(&self, f: &mut dyn SeekableFile, start: u64) -> Result<Vec<u8>> {
        for i in 1..=GZIP_PROBE_BLOCKS {
            if start <= i * BLOCK_SIZE + 4 {
                break;
            }
            let probe_at = start - i * BLOCK_SIZE;
            let boundary = find_block(f, probe_at)?;
            if boundary >= start {
                continue;
            }
            f.seek(SeekFrom::Start(boundary))?;
            let data = read_up_to(f, (start - boundary) as usize)?;
            let mut dz = Decompress::new(false);
            let mut scratch = vec![0u8; 64 << 10];
            let mut out = Vec::new();
            let mut consumed = 0usize;
            loop {
                let before_in = dz.total_in();
                let before_out = dz.total_out();
                let status =
                    match dz.decompress(&data[consumed..], &mut scratch, FlushDecompress::None) {
                        Ok(s) => s,
                        Err(_) => break,
                    };
                consumed += (dz.total_in() - before_in) as usize;
                let produced = (dz.total_out() - before_out) as usize;
                out.extend_from_slice(&scratch[..produced]);
                if matches!(status, Status::StreamEnd)
                    || consumed >= data.len()
                    || (produced == 0 && consumed == 0)
                {
                    break;
                }
            }
            if let Some(nl) = out.iter().rposition(|b| *b == b'\n') {
                return Ok(out[nl + 1..].to_vec());
            }
        }
        Ok(Vec::new())
    }
}

impl DatasetNode<String> for GzipFileDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<GzipFile {}>", self.path.display())
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
        let Some((start, end)) = split_block_range(file.as_mut(), idx, self.split_size)? else {
            return Ok(Box::new(std::iter::empty()));
        };
        let fragment = if idx == 0 {
            Vec::new()
        } else {
            self.straddle_fragment(file.as_mut(), start)?
        };
        let chunks = GzChunkIter::new(file, start, end, self.core.err(), &self.path)?;
        Ok(Box::new(GzLineIter {
            chunks,
            carry: fragment,
            skip_first: false,
            pending: std::collections::VecDeque::new(),
        }))
    }
}

/// Assembles lines from decompressed chunks, carrying partial lines across
/// chunk boundaries and dropping the torn line after a corruption resync.
struct GzLineIter {
    chunks: GzChunkIter,
    carry: Vec<u8>,
    skip_first: bool,
    pending: std::collections::VecDeque<Result<String>>,
}

impl GzLineIter {
    fn ingest(&mut self, chunk: GzChunk) {
        if chunk.resynced {
            self.carry.clear();
            self.skip_first = true;
        }
        let mut data = chunk.data.as_slice();
        while let Some(nl) = data.iter().position(|b| *b == b'\n') {
            let mut line = std::mem::take(&mut self.carry);
            line.extend_from_slice(&data[..nl]);
            data = &data[nl + 1..];
            if self.skip_first {
                self.skip_first = false;
                continue;
            }
            self.pending.push_back(
                String::from_utf8(line).map_err(|e| anyhow!("invalid utf-8 line: {e}")),
            );
        }
        self.carry.extend_from_slice(data);
    }
}

impl Iterator for GzLineIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            match self.chunks.next() {
                Some(Ok(chunk)) => self.ingest(chunk),
                Some(Err(e)) => return Some(Err(e)),
                // A trailing fragment without a newline belongs to no split;
                // the writer always terminates the final line.
                None => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// re-splittable writer
// ---------------------------------------------------------------------------

/// Gzip writer emitting a full sync flush (history reset) every
/// [`FLUSH_INTERVAL`] input bytes, so its output can be re-split by
/// [`find_block`].
pub struct SyncGzWriter<W: Write> {
    inner: W,
    comp: Compress,
    crc: Crc,
    since_flush: usize,
    header_written: bool,
    finished: bool,
}

impl<W: Write> SyncGzWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            comp: Compress::new(Compression::default(), false),
            crc: Crc::new(),
            since_flush: 0,
            header_written: false,
            finished: false,
        }
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            // id1 id2 cm flg mtime(4) xfl os
            self.inner
                .write_all(&[0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff])?;
            self.header_written = true;
        }
        Ok(())
    }

    fn run(&mut self, mut input: &[u8], flush: FlushCompress) -> io::Result<()> {
        let mut scratch = vec![0u8; 32 << 10];
        loop {
            let before_in = self.comp.total_in();
            let before_out = self.comp.total_out();
            let status = self
                .comp
                .compress(input, &mut scratch, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.comp.total_in() - before_in) as usize;
            let produced = (self.comp.total_out() - before_out) as usize;
            self.inner.write_all(&scratch[..produced])?;
            input = &input[consumed..];
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if input.is_empty() && produced < scratch.len() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Emit a sync boundary and reset the compressor history.
    pub fn sync_block(&mut self) -> io::Result<()> {
        self.write_header()?;
        self.run(&[], FlushCompress::Full)?;
        self.since_flush = 0;
        Ok(())
    }

    /// Finish the gzip member and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.finish_in_place()?;
        Ok(self.inner)
    }

    fn finish_in_place(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.write_header()?;
        self.run(&[], FlushCompress::Finish)?;
        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&self.crc.sum().to_le_bytes());
        trailer[4..].copy_from_slice(&(self.crc.amount()).to_le_bytes());
        self.inner.write_all(&trailer)?;
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }
}

impl<W: Write> Write for SyncGzWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_header()?;
        self.run(buf, FlushCompress::None)?;
        self.crc.update(buf);
        self.since_flush += buf.len();
        if self.since_flush >= FLUSH_INTERVAL {
            self.sync_block()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_block()?;
        self.inner.flush()
    }
}
