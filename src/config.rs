//! Engine configuration.
//!
//! A [`Config`] is a plain record of knobs consumed by the engine core. It is
//! carried by the [`Context`](crate::Context); there is no global state and no
//! CLI/env parsing here — embedders construct one and hand it over.

use std::path::PathBuf;

/// Tunables consumed by the engine core.
///
/// All fields have conservative defaults; construct with
/// `Config { err: 0.001, ..Default::default() }` style updates.
#[derive(Clone, Debug)]
pub struct Config {
    /// Per-record error tolerance in `[0, 1)` for fallible record-wise
    /// operators. `0.0` means the first bad record is fatal.
    pub err: f64,
    /// Default task memory budget in MiB. Only used as a scheduling hint.
    pub mem: u64,
    /// Directory for dataset checkpoints; `None` disables `checkpoint()`
    /// without an explicit path.
    pub checkpoint_dir: Option<PathBuf>,
    /// Default shuffle mode: `false` = hash-merge, `true` = sort-merge.
    pub sort_shuffle: bool,
    /// Recorded default for grouped shuffles that yield lazy value streams.
    /// The typed operators choose the shape explicitly (`group_by_key` vs
    /// `group_by_key_iter`); this default is carried for embedders and
    /// dependency metadata.
    pub iter_values: bool,
    /// Default minimum partition count for keyed operators.
    pub default_min_splits: usize,
    /// Default parallelism for operators that need a partition count and have
    /// no parent to inherit one from.
    pub default_parallelism: usize,
    /// Serialized-size threshold past which a distributed deployment would
    /// ship parallel-collection slices by broadcast instead of inline. The
    /// in-process engine always stores the collection once and shares it.
    pub data_limit: Option<usize>,
    /// Dataset-chain depth at which `iterator()` re-enters computation on a
    /// helper thread with a fresh stack.
    pub recursion_limit: usize,
    /// Cartesian replay spool stays in memory up to this many MiB before
    /// rolling to a temp file.
    pub spool_memory_mib: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            err: 0.0,
            mem: 100,
            checkpoint_dir: None,
            sort_shuffle: false,
            iter_values: false,
            default_min_splits: 2,
            default_parallelism: num_cpus::get().max(2),
            data_limit: None,
            recursion_limit: 1000,
            spool_memory_mib: 256,
        }
    }
}
