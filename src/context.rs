//! The explicit engine context.
//!
//! A [`Context`] carries everything that would otherwise be process-global
//! state: the dataset- and shuffle-id counters, the configuration, the cache
//! tracker, the in-process shuffle service and the file-system seam. Every
//! dataset holds a clone; constructors thread it through explicitly so there
//! are no implicit globals anywhere in the engine.

use crate::broadcast::Broadcast;
use crate::cache::CacheTracker;
use crate::config::Config;
use crate::dataset::{Data, Dataset};
use crate::io::fs::{Fs, LocalFs};
use crate::ops::source::ParallelCollection;
use crate::shuffle::service::ShuffleService;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct ContextInner {
    config: Config,
    next_dataset_id: AtomicU64,
    next_shuffle_id: AtomicU64,
    cache: CacheTracker,
    shuffle: ShuffleService,
    fs: Arc<dyn Fs>,
}

/// Shared engine context. Cheap to clone; all clones share counters and
/// services.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self::with_fs(config, Arc::new(LocalFs))
    }

    /// A context reading through a custom file-system implementation.
    pub fn with_fs(config: Config, fs: Arc<dyn Fs>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                next_dataset_id: AtomicU64::new(0),
                next_shuffle_id: AtomicU64::new(0),
                cache: CacheTracker::default(),
                shuffle: ShuffleService::default(),
                fs,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheTracker {
        &self.inner.cache
    }

    pub fn shuffle_service(&self) -> &ShuffleService {
        &self.inner.shuffle
    }

    pub fn fs(&self) -> Arc<dyn Fs> {
        Arc::clone(&self.inner.fs)
    }

    pub(crate) fn new_dataset_id(&self) -> u64 {
        self.inner.next_dataset_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn new_shuffle_id(&self) -> u64 {
        self.inner.next_shuffle_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Distribute an in-memory collection over `num_slices` partitions.
    #[track_caller]
    pub fn parallelize<T: Data>(&self, data: Vec<T>, num_slices: usize) -> Result<Dataset<T>> {
        ParallelCollection::create(self, data, num_slices)
    }

    /// Broadcast a value to every task. The handle exposes the value and a
    /// serialized-size estimate used for task memory accounting.
    pub fn broadcast<T: Data + Serialize>(&self, value: T) -> Result<Broadcast<T>> {
        Broadcast::new(value)
    }

    /// Concatenation of several datasets, in order.
    #[track_caller]
    pub fn union_of<T: Data>(&self, datasets: &[Dataset<T>]) -> Dataset<T> {
        crate::ops::merge::union_datasets(self, datasets)
    }

    /// Line-delimited text file, split into byte ranges of the default split
    /// size (64 MiB).
    #[track_caller]
    pub fn text_file(&self, path: impl AsRef<std::path::Path>) -> Result<Dataset<String>> {
        crate::io::text::text_file(self, path.as_ref(), None, None)
    }

    /// Line-delimited text file with an explicit split count or size.
    #[track_caller]
    pub fn text_file_with(
        &self,
        path: impl AsRef<std::path::Path>,
        num_splits: Option<usize>,
        split_size: Option<u64>,
    ) -> Result<Dataset<String>> {
        crate::io::text::text_file(self, path.as_ref(), num_splits, split_size)
    }

    /// Union of all text files matching a glob pattern, sorted by path.
    #[track_caller]
    pub fn text_files(&self, pattern: &str) -> Result<Dataset<String>> {
        crate::io::text::text_files(self, pattern)
    }

    /// Byte sub-range `[first, last)` of a line-delimited text file.
    #[track_caller]
    pub fn partial_text_file(
        &self,
        path: impl AsRef<std::path::Path>,
        first: u64,
        last: u64,
        split_size: Option<u64>,
    ) -> Result<Dataset<String>> {
        crate::io::text::partial_text_file(self, path.as_ref(), first, last, split_size)
    }

    /// Seekable gzip text file produced with sync-flush block boundaries.
    #[cfg(feature = "io-gzip")]
    #[track_caller]
    pub fn gzip_file(
        &self,
        path: impl AsRef<std::path::Path>,
        split_size: Option<u64>,
    ) -> Result<Dataset<String>> {
        crate::io::gzip::gzip_file(self, path.as_ref(), split_size)
    }

    /// Block-aligned bzip2 text file (pbzip2-style concatenated streams).
    #[cfg(feature = "io-bzip2")]
    #[track_caller]
    pub fn bzip2_file(
        &self,
        path: impl AsRef<std::path::Path>,
        split_size: Option<u64>,
    ) -> Result<Dataset<String>> {
        crate::io::bzip2::bzip2_file(self, path.as_ref(), split_size)
    }

    /// Length-prefixed, CRC-checked record file (TFRecord framing).
    #[track_caller]
    pub fn tfrecord_file(
        &self,
        path: impl AsRef<std::path::Path>,
        split_size: Option<u64>,
    ) -> Result<Dataset<Vec<u8>>> {
        crate::io::tfrecord::tfrecord_file(self, path.as_ref(), split_size)
    }

    /// Block-table file of msgpack records.
    #[cfg(feature = "io-table")]
    #[track_caller]
    pub fn table_file<T>(
        &self,
        path: impl AsRef<std::path::Path>,
        split_size: Option<u64>,
    ) -> Result<Dataset<T>>
    where
        T: Data + Serialize + serde::de::DeserializeOwned,
    {
        crate::io::table::table_file(self, path.as_ref(), split_size)
    }

    /// Fixed-length binary records.
    #[track_caller]
    pub fn binary_file(
        &self,
        path: impl AsRef<std::path::Path>,
        record_len: usize,
        split_size: Option<u64>,
    ) -> Result<Dataset<Vec<u8>>> {
        crate::io::binary::binary_file(self, path.as_ref(), record_len, split_size)
    }

    /// CSV rows of a text file (one record per line).
    #[cfg(feature = "io-csv")]
    #[track_caller]
    pub fn csv_file(&self, path: impl AsRef<std::path::Path>) -> Result<Dataset<Vec<String>>> {
        Ok(crate::io::csv::rows_from_lines(&self.text_file(path)?))
    }

    /// A materialized checkpoint directory as a leaf dataset.
    #[track_caller]
    pub fn checkpoint_file<T>(&self, dir: impl AsRef<std::path::Path>) -> Result<Dataset<T>>
    where
        T: Data + Serialize + serde::de::DeserializeOwned,
    {
        crate::checkpoint::checkpoint_dataset(self, dir.as_ref())
    }
}
