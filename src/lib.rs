//! # Millrace
//!
//! A **partitioned, lazy batch data-processing engine**: describe a
//! computation as a DAG of immutable datasets and transformations, and let
//! terminal actions materialize it by running partition-sized tasks,
//! shuffling key/value data between partitions where needed, and optionally
//! caching or checkpointing intermediate results.
//!
//! ## Key features
//!
//! - **Lazy dataset algebra** — `map`, `filter`, `flat_map`, `union`, `zip`,
//!   `cartesian`, `sample`, `sort`, `enumerate`, and the keyed operators
//!   (`reduce_by_key`, `group_by_key`, `combine_by_key`, `cogroup`, joins).
//! - **Two shuffle strategies** — in-memory hash merge, or external-style
//!   sort merge with a k-way heap over key-sorted runs.
//! - **Splittable file formats** — the readers seek into the middle of
//!   line-text, sync-flushed gzip, block-aligned bzip2, TFRecord-framed and
//!   msgpack block-table files, resynchronise to the next valid boundary and
//!   produce exactly the stream a whole-file read would.
//! - **Atomic writers** — partition-per-file output published by atomic
//!   rename; compressed output keeps its block boundaries so a written
//!   directory can be re-read with any number of splits.
//! - **Explicit context** — ids, configuration, the cache tracker and the
//!   shuffle service all live in a [`Context`]; there are no hidden globals.
//!
//! ## Quick start
//!
//! ```no_run
//! use millrace::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let ctx = Context::default();
//!
//! // Word count.
//! let lines = ctx.parallelize(
//!     vec!["hello world".to_string(), "hello rust".to_string()],
//!     2,
//! )?;
//! let counts = lines
//!     .flat_map(|l| l.split_whitespace().map(String::from).collect::<Vec<_>>())
//!     .map(|w| (w, 1u64))
//!     .reduce_by_key(|a, b| a + b, ShuffleOpts::default())?
//!     .collect()?;
//! # let _ = counts;
//! # Ok(())
//! # }
//! ```
//!
//! Reading and writing splittable files:
//!
//! ```no_run
//! use millrace::*;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let ctx = Context::default();
//! let lines = ctx.text_file("/data/events.log")?;
//! lines
//!     .filter(|l| l.contains("ERROR"))
//!     .save_as_text_file("/data/errors", "", true, true)?; // gzip, splittable
//!
//! // Read back with as many splits as you like.
//! let again = ctx.gzip_file("/data/errors/0000.gz", None)?;
//! # let _ = again.count()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution model
//!
//! Datasets are immutable and lazy; a terminal action (`collect`, `count`,
//! `reduce`, `take`, `foreach`, `save_*`) hands the DAG to the local
//! scheduler, which evaluates one blocking iterator per partition on the
//! rayon pool. `iterator(split)` recursively pulls from parent partitions,
//! except across shuffle boundaries where it pulls from the shuffle
//! service. Caching, checkpointing and a deep-recursion guard wrap the
//! recursion transparently.
//!
//! ## Feature flags
//!
//! - `io-gzip` — seekable sync-flushed gzip reader/writer (default)
//! - `io-bzip2` — block-aligned bzip2 reader/writer (default)
//! - `io-table` — msgpack block-table reader/writer (default)
//! - `io-csv` — CSV rows over line datasets (default)

pub mod broadcast;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod dependency;
pub mod io;
pub mod keyed;
pub mod ops;
pub mod partitioner;
pub mod scheduler;
pub mod shuffle;
pub mod sketch;
pub mod split;
pub mod utils;

// General re-exports
pub use broadcast::Broadcast;
pub use config::Config;
pub use context::Context;
pub use dataset::{Data, Dataset, DatasetNode, Key, PartIter};
pub use dependency::Dependency;
pub use io::atomic::WriteOutcome;
pub use keyed::ShuffleOpts;
pub use partitioner::{HashPartitioner, Part, RangePartitioner};
pub use shuffle::aggregator::{AggKind, Aggregator, group_by_aggregator, merge_aggregator};
pub use shuffle::sorted::ValueStream;
pub use sketch::TDigest;
pub use split::Split;
pub use utils::portable_hash;

// Format helpers
pub use io::tfrecord::{encode_record, masked_crc32c};
