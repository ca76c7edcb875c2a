//! Dataset checkpointing.
//!
//! A checkpointed dataset materializes each partition to
//! `<dir>/<id>_<hash>/<index>` the first time it is computed; once every
//! partition file exists the node collapses into a leaf that reads the
//! directory, and the upstream dependency edges are dropped. Checkpoint files
//! are written through the atomic-rename primitive so readers never observe a
//! partial file, and a failed open is retried once after a second to ride out
//! directory-cache staleness on networked file systems.

use crate::dataset::{Data, Dataset, PartIter};
use crate::io::atomic::AtomicFile;
use crate::split::Split;
use anyhow::{Context as _, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

type WriteFn<T> = Arc<dyn Fn(&Path, &[T]) -> Result<()> + Send + Sync>;
type ReadFn<T> = Arc<dyn Fn(&Path) -> Result<Vec<T>> + Send + Sync>;

struct CkptInfo<T> {
    dir: PathBuf,
    splits: usize,
    promoted: bool,
    write: WriteFn<T>,
    read: ReadFn<T>,
}

impl<T> Clone for CkptInfo<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            splits: self.splits,
            promoted: self.promoted,
            write: Arc::clone(&self.write),
            read: Arc::clone(&self.read),
        }
    }
}

/// Per-dataset checkpoint state, shared by every clone of the handle.
pub struct CheckpointSlot<T> {
    info: RwLock<Option<CkptInfo<T>>>,
}

impl<T> CheckpointSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            info: RwLock::new(None),
        }
    }

    pub(crate) fn configured(&self) -> bool {
        self.info.read().unwrap().is_some()
    }

    pub(crate) fn promoted(&self) -> bool {
        self.info
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|i| i.promoted)
    }
}

impl<T: Data> CheckpointSlot<T> {
    /// The checkpoint-aware compute path for one split.
    pub(crate) fn iterate(&self, ds: &Dataset<T>, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let info = match self.info.read().unwrap().as_ref() {
            Some(i) => i.clone(),
            None => return ds.cached_compute(split),
        };
        let file = info.dir.join(split.index().to_string());
        if file.exists() {
            if !info.promoted {
                self.try_promote(&info);
            }
            let records = (info.read)(&file)?;
            return Ok(Box::new(records.into_iter().map(Ok)));
        }

        // First materialization of this split: compute, persist, replay.
        let records: Vec<T> = ds.node.compute(split)?.collect::<Result<_>>()?;
        (info.write)(&file, &records)?;
        self.try_promote(&info);
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn try_promote(&self, info: &CkptInfo<T>) {
        let complete = (0..info.splits).all(|i| info.dir.join(i.to_string()).exists());
        if complete
            && let Some(slot) = self.info.write().unwrap().as_mut()
        {
            slot.promoted = true;
        }
    }
}

impl<T: Data + Serialize + DeserializeOwned> Dataset<T> {
    /// Checkpoint this dataset under `path` (or the configured
    /// `checkpoint_dir`). Without either, a warning is logged and the dataset
    /// is returned unchanged.
    pub fn checkpoint(self, path: Option<PathBuf>) -> Result<Self> {
        let base = match path.or_else(|| self.context().config().checkpoint_dir.clone()) {
            Some(p) => p,
            None => {
                log::warn!(
                    "no checkpoint will be saved without a checkpoint dir; \
                     configure `checkpoint_dir` to enable checkpointing"
                );
                return Ok(self);
            }
        };
        let ident = format!("{}_{}", self.id(), label_hash(&self.node.label()));
        let dir = base.join(ident);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;

        let info = CkptInfo::<T> {
            dir,
            splits: self.num_splits(),
            promoted: false,
            write: Arc::new(|file, records| write_split(file, records)),
            read: Arc::new(|file| read_split(file)),
        };
        *self.ckpt.info.write().unwrap() = Some(info);
        Ok(self)
    }
}

/// Leaf dataset reading a materialized checkpoint directory.
pub struct CheckpointDataset<T> {
    core: crate::dataset::DatasetCore,
    dir: PathBuf,
    splits: usize,
    _t: std::marker::PhantomData<fn() -> T>,
}

/// Open a checkpoint directory written by [`Dataset::checkpoint`], validating
/// that it holds exactly the files `0..n-1`.
#[track_caller]
pub fn checkpoint_dataset<T>(ctx: &crate::context::Context, dir: &Path) -> Result<Dataset<T>>
where
    T: Data + Serialize + DeserializeOwned,
{
    let splits = generated_files(dir)?;
    if splits == 0 {
        return Err(anyhow!("empty checkpoint directory {}", dir.display()));
    }
    Ok(Dataset::from_node(Arc::new(CheckpointDataset::<T> {
        core: crate::dataset::DatasetCore::new(ctx),
        dir: dir.to_path_buf(),
        splits,
        _t: std::marker::PhantomData,
    })))
}

impl<T> crate::dataset::DatasetNode<T> for CheckpointDataset<T>
where
    T: Data + Serialize + DeserializeOwned,
{
    fn core(&self) -> &crate::dataset::DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Checkpoint {}>", self.dir.display())
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        crate::split::index_splits(self.splits)
    }

    fn dependencies(&self) -> Vec<crate::dependency::Dependency> {
        Vec::new()
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<T>> {
        let file = self.dir.join(split.index().to_string());
        let records = read_split::<T>(&file)?;
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

/// Read and validate a checkpoint directory: files must be named `0..n-1`
/// with no gaps.
pub fn generated_files(dir: &Path) -> Result<usize> {
    let mut indices: Vec<usize> = std::fs::read_dir(dir)
        .with_context(|| format!("read checkpoint dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    indices.sort_unstable();
    for (expect, got) in indices.iter().enumerate() {
        if *got != expect {
            return Err(anyhow!(
                "invalid checkpoint directory {}: missing split {expect}",
                dir.display()
            ));
        }
    }
    Ok(indices.len())
}

fn write_split<T: Serialize>(file: &Path, records: &[T]) -> Result<()> {
    let bytes =
        postcard::to_allocvec(records).map_err(|e| anyhow!("serialize checkpoint split: {e}"))?;
    let mut staged = AtomicFile::create(file)?;
    staged.writer().write_all(&bytes)?;
    staged.publish()?;
    Ok(())
}

fn read_split<T: DeserializeOwned>(file: &Path) -> Result<Vec<T>> {
    let bytes = match std::fs::read(file) {
        Ok(b) => b,
        Err(first) => {
            // Networked file systems may serve a stale directory for up to a
            // second after the atomic rename lands.
            std::thread::sleep(Duration::from_secs(1));
            std::fs::read(file).with_context(|| {
                format!("read checkpoint split {} (first error: {first})", file.display())
            })?
        }
    };
    postcard::from_bytes(&bytes).map_err(|e| anyhow!("decode checkpoint split: {e}"))
}

fn label_hash(label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}
