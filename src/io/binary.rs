//! Fixed-length binary record files.
//!
//! The split size is rounded down to a multiple of the record length, so
//! every split holds whole records and no cross-split fix-up is needed.
//! Records are raw byte vectors; typed decoding belongs in a `map`
//! downstream.

use crate::context::Context;
use crate::dataset::{Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::fs;
use crate::split::{RangeSplit, Split};
use anyhow::{Result, anyhow};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SPLIT_SIZE: u64 = 64 << 20;

/// Fixed-record binary file.
pub struct BinaryFileDataset {
    core: DatasetCore,
    path: PathBuf,
    record_len: usize,
    ranges: Vec<(u64, u64)>,
}

#[track_caller]
pub fn binary_file(
    ctx: &Context,
    path: &Path,
    record_len: usize,
    split_size: Option<u64>,
) -> Result<Dataset<Vec<u8>>> {
    if record_len == 0 {
        return Err(anyhow!("record length must be positive"));
    }
    let file = fs::open_file(&ctx.fs(), path)?;
    let size = file.length();
    let requested = split_size.unwrap_or(DEFAULT_SPLIT_SIZE);
    // Whole records per split.
    let split_size = (requested / record_len as u64).max(1) * record_len as u64;
    let ranges = fs::range_splits(size, split_size);
    Ok(Dataset::from_node(Arc::new(BinaryFileDataset {
        core: DatasetCore::new(ctx),
        path: path.to_path_buf(),
        record_len,
        ranges,
    })))
}

impl DatasetNode<Vec<u8>> for BinaryFileDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<BinaryFile({}) {}>", self.record_len, self.path.display())
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
        let mut file = fs::open_file(&self.core.ctx.fs(), &self.path)?;
        file.seek(SeekFrom::Start(rs.begin))?;
        let records = (rs.end - rs.begin) / self.record_len as u64;
        Ok(Box::new(BinaryRecordIter {
            file,
            record_len: self.record_len,
            remaining: records,
        }))
    }
}

struct BinaryRecordIter {
    file: Box<dyn fs::SeekableFile>,
    record_len: usize,
    remaining: u64,
}

impl Iterator for BinaryRecordIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut buf = vec![0u8; self.record_len];
        let mut filled = 0;
        while filled < self.record_len {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.remaining = 0;
                    // A short tail is not a record.
                    return None;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e.into()));
                }
            }
        }
        Some(Ok(buf))
    }
}
