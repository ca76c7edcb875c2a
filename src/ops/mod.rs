//! Concrete transformations over datasets.
//!
//! Narrow operators live here; the wide (shuffle) operators live under
//! [`crate::shuffle`]. Record-wise fallible operators share the
//! [`ErrorQuota`] accounting: a failing record is dropped and logged, and the
//! operator aborts once failures exceed the dataset's tolerance.

pub mod cartesian;
pub mod map;
pub mod merge;
pub mod pipe;
pub mod sample;
pub mod sort;
pub mod source;

use anyhow::{Result, anyhow};

/// Per-partition error accounting for fallible record-wise operators.
///
/// A record error is admitted (dropped + warned) while
/// `errors <= 10 * err * total`, checked only after the first 100 records;
/// at end of stream the final ratio must satisfy `errors <= err * total`.
/// Abort messages carry counts only — never the offending record.
pub(crate) struct ErrorQuota {
    err: f64,
    total: u64,
    errors: u64,
    site: String,
}

impl ErrorQuota {
    pub(crate) fn new(err: f64, site: &str) -> Self {
        Self {
            err,
            total: 0,
            errors: 0,
            site: site.to_string(),
        }
    }

    pub(crate) fn saw_record(&mut self) {
        self.total += 1;
    }

    pub(crate) fn record_error(&mut self, e: anyhow::Error) -> Result<()> {
        self.errors += 1;
        log::warn!("ignored record at {}: {e}", self.site);
        if self.total > 100 && self.errors as f64 > self.total as f64 * self.err * 10.0 {
            return Err(self.too_many());
        }
        Ok(())
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.errors as f64 > self.total as f64 * self.err {
            return Err(self.too_many());
        }
        Ok(())
    }

    fn too_many(&self) -> anyhow::Error {
        anyhow!(
            "too many errors at {}: {}/{} records failed",
            self.site,
            self.errors,
            self.total
        )
    }
}
