//! Split-oriented reader for line-delimited text files.
//!
//! Each split covers a byte range `[begin, end)`. The owner of split 0 reads
//! from `begin`; every later owner first consumes bytes up to and including
//! the next `\n` — that logical line belongs to the previous split — then
//! emits lines until the first newline at or past `end`, so a line straddling
//! a boundary is produced exactly once. Trailing newlines are stripped and a
//! final unterminated line is still emitted.

use crate::context::Context;
use crate::dataset::{Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs::{self, SeekableFile};
use crate::split::{RangeSplit, Split};
use anyhow::{Result, anyhow};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 64 << 20;

/// Line-delimited text file split into byte ranges.
pub struct TextFileDataset {
    core: DatasetCore,
    path: PathBuf,
    ranges: Vec<(u64, u64)>,
    locs: Vec<Vec<String>>,
}

#[track_caller]
pub fn text_file(
    ctx: &Context,
    path: &Path,
    num_splits: Option<usize>,
    split_size: Option<u64>,
) -> Result<Dataset<String>> {
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let split_size = fs::effective_split_size(size, num_splits, split_size, DEFAULT_SPLIT_SIZE);
    let ranges = fs::range_splits(size, split_size);
    let locs = ranges
        .iter()
        .map(|&(b, e)| fs::range_locs(file.as_ref(), b, e))
        .collect();
    Ok(Dataset::from_node(Arc::new(TextFileDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        ranges,
        locs,
    })))
}

/// Byte sub-range `[first, last)` of a text file, split on `split_size`
/// aligned edges so co-ranged readers agree on boundaries.
#[track_caller]
pub fn partial_text_file(
    ctx: &Context,
    path: &Path,
    first: u64,
    last: u64,
    split_size: Option<u64>,
) -> Result<Dataset<String>> {
    let file = fs::open_file(&ctx.fs(), path)?;
    let last = last.min(file.length());
    if first > last {
        return Err(anyhow!("invalid byte range [{first}, {last})"));
    }
    let split_size = split_size.unwrap_or(DEFAULT_SPLIT_SIZE).max(1);
    let mut ranges = Vec::new();
    if last - first <= split_size {
        ranges.push((first, last));
    } else {
        let first_edge = first / split_size * split_size + split_size;
        let last_edge = (last - 1) / split_size * split_size;
        ranges.push((first, first_edge));
        let mut begin = first_edge;
        while begin < last_edge {
            ranges.push((begin, begin + split_size));
            begin += split_size;
        }
        ranges.push((last_edge, last));
    }
    let locs = ranges
        .iter()
        .map(|&(b, e)| fs::range_locs(file.as_ref(), b, e))
        .collect();
    Ok(Dataset::from_node(Arc::new(TextFileDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        ranges,
        locs,
    })))
}

/// Union of every text file matching `pattern`, in sorted path order.
#[track_caller]
pub fn text_files(ctx: &Context, pattern: &str) -> Result<Dataset<String>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| anyhow!("bad glob pattern {pattern:?}: {e}"))?
        .filter_map(|p| p.ok())
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(anyhow!("no files match {pattern:?}"));
    }
    let parts = paths
        .iter()
        .map(|p| text_file(ctx, p, None, None))
        .collect::<Result<Vec<_>>>()?;
    Ok(crate::ops::merge::union_datasets(ctx, &parts))
}

impl DatasetNode<String> for TextFileDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<TextFile {}>", self.path.display())
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

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        self.locs.get(split.index()).cloned().unwrap_or_default()
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<String>> {
        let rs = split
            .as_any()
            .downcast_ref::<RangeSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        let file = fs::open_file(&self.core.ctx.fs(), &self.path)?;
        match LineRangeIter::open(file, rs.begin, rs.end)? {
            Some(iter) => Ok(Box::new(iter)),
            None => Ok(Box::new(std::iter::empty())),
        }
    }
}

/// Lines of `[begin, end)` with the boundary handling described above.
pub(crate) struct LineRangeIter {
    reader: BufReader<Box<dyn SeekableFile>>,
    pos: u64,
    end: u64,
    done: bool,
}

impl LineRangeIter {
    /// Position the reader, consuming the partial first line of non-initial
    /// splits. Returns `None` when the adjusted start is at or past `end`.
    pub(crate) fn open(
        mut file: Box<dyn SeekableFile>,
        begin: u64,
        end: u64,
    ) -> Result<Option<Self>> {
        let mut pos = begin;
        if begin > 0 {
            file.seek(SeekFrom::Start(begin - 1))?;
        }
        let mut reader = BufReader::with_capacity(64 << 10, file);
        if begin > 0 {
            let mut skipped = Vec::new();
            let n = reader.read_until(b'\n', &mut skipped)? as u64;
            if n == 0 || !skipped.ends_with(b"\n") {
                return Ok(None); // no newline until EOF
            }
            pos = begin - 1 + n;
        }
        if pos >= end {
            return Ok(None);
        }
        Ok(Some(Self {
            reader,
            pos,
            end,
            done: false,
        }))
    }
}

impl Iterator for LineRangeIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.end {
            return None;
        }
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                self.pos += n as u64;
                if buf.ends_with(b"\n") {
                    buf.pop();
                }
                Some(String::from_utf8(buf).map_err(|e| anyhow!("invalid utf-8 line: {e}")))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}
