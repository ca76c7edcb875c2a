//! CSV rows over line datasets.
//!
//! The split-oriented text readers deliver physical lines, so this layer
//! parses one CSV record per line (quoted embedded newlines cannot survive
//! byte-range splitting and are not supported). Parsing failures count
//! against the dataset's per-record error quota.

use crate::dataset::Dataset;
use anyhow::{Result, anyhow};

/// Parse each line of `lines` as one CSV record.
#[track_caller]
pub fn rows_from_lines(lines: &Dataset<String>) -> Dataset<Vec<String>> {
    lines.try_map(|line| parse_line(&line))
}

pub(crate) fn parse_line(line: &str) -> Result<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    let got = rdr
        .read_record(&mut record)
        .map_err(|e| anyhow!("parse csv line: {e}"))?;
    if !got {
        return Ok(Vec::new());
    }
    Ok(record.iter().map(String::from).collect())
}

impl Dataset<String> {
    /// Interpret each line as a CSV record.
    #[track_caller]
    pub fn from_csv(&self) -> Dataset<Vec<String>> {
        rows_from_lines(self)
    }
}

/// Encode one row as a CSV line (no trailing newline).
pub(crate) fn encode_row(row: &[String]) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(row)
        .map_err(|e| anyhow!("encode csv row: {e}"))?;
    let mut bytes = wtr
        .into_inner()
        .map_err(|e| anyhow!("flush csv row: {e}"))?;
    // csv terminates records; the caller appends its own newline.
    while bytes.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
        bytes.pop();
    }
    Ok(bytes)
}
