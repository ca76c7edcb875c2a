//! Block-table files of msgpack records.
//!
//! Layout: the 8-byte MAGIC `00 DE 00 AD FF BE FF EF`, then per block a
//! `u32 compressed | u32 record_count | u32 byte_size` header (little
//! endian) followed by `byte_size` payload bytes — a concatenation of
//! msgpack-encoded records, zlib-compressed when the flag is non-zero. A
//! split scans for the MAGIC at or after its `begin` and parses whole blocks
//! until the cursor reaches its `end`.

use crate::context::Context;
use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs::{self, SeekableFile};
use crate::split::{RangeSplit, Split};
use anyhow::{Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 32 << 20;
/// Uncompressed payload bytes buffered per block by the writer.
pub const BLOCK_SIZE: usize = 256 << 10;

pub const MAGIC: [u8; 8] = [0x00, 0xDE, 0x00, 0xAD, 0xFF, 0xBE, 0xFF, 0xEF];
const HDR_SIZE: usize = 12;

/// Typed block-table file.
pub struct TableFileDataset<T> {
    core: DatasetCore,
    path: PathBuf,
    ranges: Vec<(u64, u64)>,
    _t: PhantomData<fn() -> T>,
}

#[track_caller]
pub fn table_file<T>(ctx: &Context, path: &Path, split_size: Option<u64>) -> Result<Dataset<T>>
where
    T: Data + Serialize + DeserializeOwned,
{
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let split_size = split_size.unwrap_or(DEFAULT_SPLIT_SIZE).max(1);
    let ranges = fs::range_splits(size, split_size);
    Ok(Dataset::from_node(Arc::new(TableFileDataset::<T> {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        ranges,
        _t: PhantomData,
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

/// Offset of the next MAGIC at or after `pos`, if any.
fn find_magic(f: &mut dyn SeekableFile, mut pos: u64) -> Result<Option<u64>> {
    f.seek(SeekFrom::Start(pos))?;
    let mut block = read_up_to(f, 32 << 10)?;
    if block.len() < MAGIC.len() {
        return Ok(None);
    }
    loop {
        if let Some(p) = block.windows(MAGIC.len()).position(|w| w == MAGIC) {
            return Ok(Some(pos + p as u64));
        }
        pos += (block.len() - MAGIC.len() + 1) as u64;
        let keep = block.len() - (MAGIC.len() - 1);
        block.drain(..keep);
        let more = read_up_to(f, 32 << 10)?;
        if more.is_empty() {
            return Ok(None);
        }
        block.extend_from_slice(&more);
    }
}

impl<T> DatasetNode<T> for TableFileDataset<T>
where
    T: Data + Serialize + DeserializeOwned,
{
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<TableFile {}>", self.path.display())
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

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let rs = split
            .as_any()
            .downcast_ref::<RangeSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        let mut file = fs::open_file(&self.core.ctx.fs(), &self.path)?;
        let Some(start) = find_magic(file.as_mut(), rs.begin)? else {
            return Ok(Box::new(std::iter::empty()));
        };
        if start >= rs.end {
            return Ok(Box::new(std::iter::empty()));
        }
        file.seek(SeekFrom::Start(start))?;
        Ok(Box::new(TableBlockIter::<T> {
            file,
            pos: start,
            end: rs.end,
            path: self.path.clone(),
            pending: Vec::new().into_iter(),
            done: false,
            _t: PhantomData,
        }))
    }
}

struct TableBlockIter<T> {
    file: Box<dyn SeekableFile>,
    pos: u64,
    end: u64,
    path: PathBuf,
    pending: std::vec::IntoIter<Result<T>>,
    done: bool,
    _t: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TableBlockIter<T> {
    fn read_block(&mut self) -> Result<bool> {
        if self.pos >= self.end {
            return Ok(false);
        }
        let magic = read_up_to(self.file.as_mut(), MAGIC.len())?;
        if magic != MAGIC {
            return Ok(false);
        }
        let hdr = read_up_to(self.file.as_mut(), HDR_SIZE)?;
        if hdr.len() < HDR_SIZE {
            bail!("truncated block header in {}", self.path.display());
        }
        let compressed = u32::from_le_bytes(hdr[0..4].try_into().expect("sized"));
        let count = u32::from_le_bytes(hdr[4..8].try_into().expect("sized"));
        let size = u32::from_le_bytes(hdr[8..12].try_into().expect("sized")) as usize;
        let payload = read_up_to(self.file.as_mut(), size)?;
        if payload.len() < size {
            bail!("unexpected end of block in {}", self.path.display());
        }
        let raw = if compressed != 0 {
            decompress_zlib(&payload)?
        } else {
            payload
        };
        let mut records = Vec::with_capacity(count as usize);
        let mut de = rmp_serde::Deserializer::new(raw.as_slice());
        for _ in 0..count {
            let rec = T::deserialize(&mut de)
                .map_err(|e| anyhow!("decode table record in {}: {e}", self.path.display()));
            records.push(rec);
        }
        self.pending = records.into_iter();
        self.pos += (MAGIC.len() + HDR_SIZE + size) as u64;
        Ok(true)
    }
}

impl<T: DeserializeOwned> Iterator for TableBlockIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            match self.read_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| anyhow!("zlib decompress table block: {e}"))?;
    Ok(out)
}

/// Buffering block writer used by `save_as_table_file`.
pub struct TableBlockWriter<'a, T> {
    out: &'a mut dyn Write,
    compress: bool,
    buf: Vec<u8>,
    count: u32,
    wrote_any: bool,
    _t: PhantomData<fn(T)>,
}

impl<'a, T: Serialize> TableBlockWriter<'a, T> {
    pub fn new(out: &'a mut dyn Write, compress: bool) -> Self {
        Self {
            out,
            compress,
            buf: Vec::new(),
            count: 0,
            wrote_any: false,
            _t: PhantomData,
        }
    }

    pub fn push(&mut self, record: &T) -> Result<()> {
        rmp_serde::encode::write(&mut self.buf, record)
            .map_err(|e| anyhow!("encode table record: {e}"))?;
        self.count += 1;
        if self.buf.len() > BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let payload = if self.compress {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
            enc.write_all(&self.buf)?;
            enc.finish()?
        } else {
            std::mem::take(&mut self.buf)
        };
        self.out.write_all(&MAGIC)?;
        self.out
            .write_all(&(u32::from(self.compress)).to_le_bytes())?;
        self.out.write_all(&self.count.to_le_bytes())?;
        self.out.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.out.write_all(&payload)?;
        self.buf.clear();
        self.count = 0;
        self.wrote_any = true;
        Ok(())
    }

    /// Flush the trailing partial block; true when any block was written.
    pub fn finish(mut self) -> Result<bool> {
        self.flush_block()?;
        Ok(self.wrote_any)
    }
}
