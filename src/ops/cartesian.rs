//! Cartesian product of two datasets.
//!
//! Child split `i * |right splits| + j` produces the cross product of left
//! split `i` and right split `j`. The right side is consumed once: during the
//! first left record it streams through while being copied into a
//! gzip-compressed spool (RAM up to the configured cap, then disk). Later
//! left records replay from the decoded in-memory list when the spool never
//! rolled, or re-decode from the spool file when it did.

use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::split::{PairSplit, Split};
use crate::utils::{SpoolContents, SpoolFile};
use anyhow::{Result, anyhow};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

pub struct CartesianDataset<A: Data, B: Data> {
    core: DatasetCore,
    left: Dataset<A>,
    right: Dataset<B>,
    spool_cap: usize,
}

impl<A> Dataset<A>
where
    A: Data,
{
    /// Cross product with `other`. The right side is spooled for replay, so
    /// its records must be serializable.
    #[track_caller]
    pub fn cartesian<B>(&self, other: &Dataset<B>) -> Dataset<(A, B)>
    where
        B: Data + Serialize + DeserializeOwned,
    {
        let ctx = self.context();
        let cfg = ctx.config();
        Dataset::from_node(Arc::new(CartesianDataset {
            core: DatasetCore::derived(self.core()),
            left: self.clone(),
            right: other.clone(),
            spool_cap: cfg.spool_memory_mib << 20,
        }))
    }
}

impl<A, B> DatasetNode<(A, B)> for CartesianDataset<A, B>
where
    A: Data,
    B: Data + Serialize + DeserializeOwned,
{
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Cartesian {:?} and {:?}>", self.left, self.right)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        let rights = self.right.splits();
        let mut out: Vec<Arc<dyn Split>> = Vec::new();
        for l in self.left.splits() {
            for r in &rights {
                out.push(Arc::new(PairSplit {
                    index: out.len(),
                    left: Arc::clone(&l),
                    right: Arc::clone(r),
                }));
            }
        }
        out
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let n = self.right.num_splits();
        vec![
            Dependency::Cartesian {
                parent: self.left.id(),
                right_splits: n,
            },
            Dependency::Cartesian {
                parent: self.right.id(),
                right_splits: n,
            },
        ]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        match split.as_any().downcast_ref::<PairSplit>() {
            Some(ps) => {
                let mut locs = self.left.preferred_locations(&ps.left);
                locs.extend(self.right.preferred_locations(&ps.right));
                locs
            }
            None => Vec::new(),
        }
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<(A, B)>> {
        let ps = split
            .as_any()
            .downcast_ref::<PairSplit>()
            .ok_or_else(|| anyhow!("unexpected split type for {}", self.label()))?;
        Ok(Box::new(CartesianIter::<A, B> {
            left: self.left.iterator(&ps.left)?,
            cur_left: None,
            right: RightSide::First {
                src: Some(self.right.iterator(&ps.right)?),
                enc: None,
                cap: self.spool_cap,
            },
        }))
    }
}

/// Replay source for the right-hand side.
enum RightSide<B> {
    /// First pass: stream the parent while teeing into the spool.
    First {
        src: Option<PartIter<B>>,
        enc: Option<GzEncoder<SpoolFile>>,
        cap: usize,
    },
    /// Spool never rolled to disk: replay the decoded list.
    Mem { cached: Arc<Vec<B>>, pos: usize },
    /// Spool rolled: re-decode from the file on every pass.
    Disk {
        file: File,
        dec: Option<GzDecoder<BufReader<File>>>,
    },
}

struct CartesianIter<A, B> {
    left: PartIter<A>,
    cur_left: Option<A>,
    right: RightSide<B>,
}

fn write_frame<B: Serialize>(enc: &mut impl Write, record: &B) -> Result<()> {
    let bytes =
        postcard::to_allocvec(record).map_err(|e| anyhow!("serialize spooled record: {e}"))?;
    enc.write_all(&(bytes.len() as u32).to_le_bytes())?;
    enc.write_all(&bytes)?;
    Ok(())
}

fn read_frame<B: DeserializeOwned>(dec: &mut impl Read) -> Result<Option<B>> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let got = dec.read(&mut len[filled..])?;
        if got == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(anyhow!("truncated spool frame"));
        }
        filled += got;
    }
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    dec.read_exact(&mut bytes)?;
    postcard::from_bytes(&bytes)
        .map(Some)
        .map_err(|e| anyhow!("decode spooled record: {e}"))
}

impl<A: Data, B: Data + Serialize + DeserializeOwned> CartesianIter<A, B> {
    /// Next right-hand record for the current pass, or `None` at the end of
    /// the pass.
    fn next_right(&mut self) -> Result<Option<B>> {
        match &mut self.right {
            RightSide::First { src, enc, cap } => {
                let iter = src.as_mut().ok_or_else(|| anyhow!("exhausted right source"))?;
                match iter.next() {
                    Some(Ok(v)) => {
                        let enc = match enc {
                            Some(e) => e,
                            None => enc.insert(GzEncoder::new(
                                SpoolFile::with_capacity(*cap),
                                Compression::fast(),
                            )),
                        };
                        write_frame(enc, &v)?;
                        Ok(Some(v))
                    }
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                }
            }
            RightSide::Mem { cached, pos } => {
                let item = cached.get(*pos).cloned();
                *pos += 1;
                Ok(item)
            }
            RightSide::Disk { file, dec } => {
                let dec = match dec {
                    Some(d) => d,
                    None => {
                        let mut clone = file.try_clone()?;
                        clone.seek(SeekFrom::Start(0))?;
                        dec.insert(GzDecoder::new(BufReader::new(clone)))
                    }
                };
                read_frame(dec)
            }
        }
    }

    /// End of a pass: seal the spool after the first pass, rewind otherwise.
    fn finish_pass(&mut self) -> Result<()> {
        match &mut self.right {
            RightSide::First { enc, .. } => {
                let contents = match enc.take() {
                    Some(enc) => enc
                        .finish()
                        .map_err(|e| anyhow!("finish spool: {e}"))?
                        .into_contents()?,
                    // Empty right side.
                    None => SpoolContents::Memory(Vec::new()),
                };
                if contents.is_memory() {
                    let mut contents = contents;
                    let mut dec = GzDecoder::new(contents.reader()?);
                    let mut cached = Vec::new();
                    while let Some(v) = read_frame::<B>(&mut dec)? {
                        cached.push(v);
                    }
                    self.right = RightSide::Mem {
                        cached: Arc::new(cached),
                        pos: 0,
                    };
                } else {
                    let SpoolContents::Disk(file) = contents else {
                        unreachable!("checked is_memory above");
                    };
                    self.right = RightSide::Disk { file, dec: None };
                }
            }
            RightSide::Mem { pos, .. } => *pos = 0,
            RightSide::Disk { dec, .. } => *dec = None,
        }
        Ok(())
    }
}

impl<A: Data, B: Data + Serialize + DeserializeOwned> Iterator for CartesianIter<A, B> {
    type Item = Result<(A, B)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cur_left.is_none() {
                match self.left.next() {
                    None => return None,
                    Some(Err(e)) => return Some(Err(e)),
                    Some(Ok(a)) => self.cur_left = Some(a),
                }
            }
            match self.next_right() {
                Err(e) => return Some(Err(e)),
                Ok(Some(b)) => {
                    let a = self.cur_left.clone().expect("current left set above");
                    return Some(Ok((a, b)));
                }
                Ok(None) => {
                    self.cur_left = None;
                    if let Err(e) = self.finish_pass() {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}
