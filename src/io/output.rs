//! Partition-per-file output datasets.
//!
//! Every writer creates (or, with `overwrite`, cleans) a target directory and
//! writes one file per partition named `"%04d%s"`. Data is staged through
//! the atomic-rename primitive; a partition that produces no records
//! discards its staged temp file and publishes nothing. Compressed text
//! output goes through the sync-flushing gzip writer, so written directories
//! can be read back with any number of splits.
//!
//! Each format writes one logical record per `write` call: the gzip writer
//! places its flush boundaries between calls, which keeps records from
//! straddling sync blocks in our own output.

use crate::dataset::{Data, Dataset, DatasetCore, DatasetNode, PartIter};
use crate::dependency::Dependency;
use crate::io::atomic::{AtomicFile, WriteOutcome};
use crate::split::Split;
use anyhow::{Context as _, Result, bail};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on simultaneously open files in the by-key writer.
pub const MAX_OPEN_FILES: usize = 512;
/// Per-key buffered bytes before the by-key writer opens the key's file.
const KEY_BLOCK_SIZE: usize = 256 << 10;

// ---------------------------------------------------------------------------
// shared machinery
// ---------------------------------------------------------------------------

/// How text-like output is encoded on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputCodec {
    Plain,
    /// Sync-flushed gzip; output stays splittable.
    Gzip,
    /// One bzip2 stream per 256 KiB block; output stays splittable.
    Bzip2,
}

impl OutputCodec {
    fn ext_suffix(self) -> &'static str {
        match self {
            OutputCodec::Plain => "",
            OutputCodec::Gzip => ".gz",
            OutputCodec::Bzip2 => ".bz2",
        }
    }
}

/// Format hook: stream all records of one partition into `out`, returning
/// whether anything was written.
pub(crate) trait PartitionFormat<T: Data>: Send + Sync + 'static {
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<T>>,
    ) -> Result<bool>;
}

fn normalize_ext(ext: &str, codec: OutputCodec) -> String {
    let mut ext = if ext.is_empty() || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    };
    if !ext.ends_with(codec.ext_suffix()) {
        ext.push_str(codec.ext_suffix());
    }
    ext
}

/// Create the output directory, or clean it when overwriting.
fn prepare_dir(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            bail!("output path {} must be a directory", path.display());
        }
        if overwrite {
            for entry in std::fs::read_dir(path)? {
                let p = entry?.path();
                if p.is_dir() {
                    std::fs::remove_dir_all(&p)
                        .with_context(|| format!("clean {}", p.display()))?;
                } else {
                    std::fs::remove_file(&p).with_context(|| format!("clean {}", p.display()))?;
                }
            }
        }
    } else {
        std::fs::create_dir_all(path)
            .with_context(|| format!("create output dir {}", path.display()))?;
    }
    Ok(())
}

/// One output file per parent partition; yields published paths.
struct OutputDataset<T: Data> {
    core: DatasetCore,
    prev: Dataset<T>,
    dir: PathBuf,
    ext: String,
    overwrite: bool,
    format: Arc<dyn PartitionFormat<T>>,
}

impl<T: Data> DatasetNode<String> for OutputDataset<T> {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<Output {} {:?}>", self.dir.display(), self.prev)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.prev.splits()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Narrow {
            parent: self.prev.id(),
        }]
    }

    fn preferred_locations(&self, split: &Arc<dyn Split>) -> Vec<String> {
        self.prev.preferred_locations(split)
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<String>> {
        let target = self
            .dir
            .join(format!("{:04}{}", split.index(), self.ext));
        if target.exists() && !self.overwrite {
            return Ok(Box::new(std::iter::empty()));
        }
        let mut staged = AtomicFile::create(&target)?;
        let mut records = self.prev.iterator(split)?;
        let had_data = self
            .format
            .write_partition(staged.writer(), &mut records)?;
        let outcome = if had_data {
            WriteOutcome::Published(staged.publish()?)
        } else {
            staged.discard();
            WriteOutcome::Empty
        };
        match outcome {
            WriteOutcome::Published(path) => {
                Ok(Box::new(std::iter::once(Ok(path.display().to_string()))))
            }
            WriteOutcome::Empty => Ok(Box::new(std::iter::empty())),
        }
    }
}

fn run_output<T: Data>(
    prev: &Dataset<T>,
    dir: &Path,
    ext: String,
    overwrite: bool,
    format: Arc<dyn PartitionFormat<T>>,
) -> Result<Vec<String>> {
    prepare_dir(dir, overwrite)?;
    let node = OutputDataset {
        core: DatasetCore::derived(prev.core()),
        prev: prev.clone(),
        dir: dir.to_path_buf(),
        ext,
        overwrite,
        format,
    };
    Dataset::from_node(Arc::new(node)).collect()
}

/// Wrap `out` with the requested codec and run `body` against it.
fn with_codec(
    out: &mut dyn Write,
    codec: OutputCodec,
    body: &mut dyn FnMut(&mut dyn Write) -> Result<bool>,
) -> Result<bool> {
    match codec {
        OutputCodec::Plain => body(out),
        #[cfg(feature = "io-gzip")]
        OutputCodec::Gzip => {
            let mut w = crate::io::gzip::SyncGzWriter::new(out);
            let had = body(&mut w)?;
            if had {
                w.finish()?;
            }
            Ok(had)
        }
        #[cfg(feature = "io-bzip2")]
        OutputCodec::Bzip2 => {
            let mut w = crate::io::bzip2::Bzip2BlockWriter::new(out);
            let had = body(&mut w)?;
            if had {
                w.finish()?;
            }
            Ok(had)
        }
        #[cfg(not(all(feature = "io-gzip", feature = "io-bzip2")))]
        #[allow(unreachable_patterns)]
        other => bail!("codec {other:?} is not enabled; missing io feature"),
    }
}

// ---------------------------------------------------------------------------
// formats
// ---------------------------------------------------------------------------

struct TextFormat {
    codec: OutputCodec,
}

impl PartitionFormat<String> for TextFormat {
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<String>>,
    ) -> Result<bool> {
        with_codec(out, self.codec, &mut |w| {
            let mut had = false;
            for line in &mut *records {
                let line = line?;
                let mut bytes = line.into_bytes();
                if !bytes.ends_with(b"\n") {
                    bytes.push(b'\n');
                }
                w.write_all(&bytes)?;
                had = true;
            }
            if had {
                w.flush()?;
            }
            Ok(had)
        })
    }
}

struct TfRecordFormat {
    codec: OutputCodec,
}

impl PartitionFormat<Vec<u8>> for TfRecordFormat {
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<Vec<u8>>>,
    ) -> Result<bool> {
        with_codec(out, self.codec, &mut |w| {
            let mut had = false;
            for payload in &mut *records {
                let frame = crate::io::tfrecord::encode_record(&payload?);
                w.write_all(&frame)?;
                had = true;
            }
            if had {
                w.flush()?;
            }
            Ok(had)
        })
    }
}

struct BinaryFormat {
    record_len: usize,
}

impl PartitionFormat<Vec<u8>> for BinaryFormat {
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<Vec<u8>>>,
    ) -> Result<bool> {
        let mut had = false;
        for record in records {
            let record = record?;
            if record.len() != self.record_len {
                bail!(
                    "binary record of {} bytes does not match record length {}",
                    record.len(),
                    self.record_len
                );
            }
            out.write_all(&record)?;
            had = true;
        }
        Ok(had)
    }
}

#[cfg(feature = "io-table")]
struct TableFormat<T> {
    compress: bool,
    _t: std::marker::PhantomData<fn(T)>,
}

#[cfg(feature = "io-table")]
impl<T> PartitionFormat<T> for TableFormat<T>
where
    T: Data + serde::Serialize,
{
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<T>>,
    ) -> Result<bool> {
        let mut w = crate::io::table::TableBlockWriter::new(out, self.compress);
        for record in records {
            w.push(&record?)?;
        }
        w.finish()
    }
}

#[cfg(feature = "io-csv")]
struct CsvFormat {
    codec: OutputCodec,
}

#[cfg(feature = "io-csv")]
impl PartitionFormat<Vec<String>> for CsvFormat {
    fn write_partition(
        &self,
        out: &mut dyn Write,
        records: &mut dyn Iterator<Item = Result<Vec<String>>>,
    ) -> Result<bool> {
        with_codec(out, self.codec, &mut |w| {
            let mut had = false;
            for row in &mut *records {
                let mut bytes = crate::io::csv::encode_row(&row?)?;
                bytes.push(b'\n');
                w.write_all(&bytes)?;
                had = true;
            }
            if had {
                w.flush()?;
            }
            Ok(had)
        })
    }
}

// ---------------------------------------------------------------------------
// save methods
// ---------------------------------------------------------------------------

impl Dataset<String> {
    /// Write one text file per partition under `path`. With `compress`, each
    /// file is sync-flushed gzip and remains splittable. Returns the
    /// published paths.
    #[track_caller]
    pub fn save_as_text_file(
        &self,
        path: impl AsRef<Path>,
        ext: &str,
        overwrite: bool,
        compress: bool,
    ) -> Result<Vec<String>> {
        let codec = if compress {
            OutputCodec::Gzip
        } else {
            OutputCodec::Plain
        };
        run_output(
            self,
            path.as_ref(),
            normalize_ext(ext, codec),
            overwrite,
            Arc::new(TextFormat { codec }),
        )
    }

    /// Write block-aligned bzip2 text files (one stream per 256 KiB block).
    #[cfg(feature = "io-bzip2")]
    #[track_caller]
    pub fn save_as_bzip2_text_file(
        &self,
        path: impl AsRef<Path>,
        ext: &str,
        overwrite: bool,
    ) -> Result<Vec<String>> {
        run_output(
            self,
            path.as_ref(),
            normalize_ext(ext, OutputCodec::Bzip2),
            overwrite,
            Arc::new(TextFormat {
                codec: OutputCodec::Bzip2,
            }),
        )
    }
}

impl Dataset<Vec<u8>> {
    /// Write TFRecord-framed files, one per partition.
    #[track_caller]
    pub fn save_as_tfrecord_file(
        &self,
        path: impl AsRef<Path>,
        overwrite: bool,
        compress: bool,
    ) -> Result<Vec<String>> {
        let codec = if compress {
            OutputCodec::Gzip
        } else {
            OutputCodec::Plain
        };
        run_output(
            self,
            path.as_ref(),
            normalize_ext(".tfrecords", codec),
            overwrite,
            Arc::new(TfRecordFormat { codec }),
        )
    }

    /// Write fixed-length binary records, one file per partition.
    #[track_caller]
    pub fn save_as_binary_file(
        &self,
        path: impl AsRef<Path>,
        record_len: usize,
        overwrite: bool,
    ) -> Result<Vec<String>> {
        run_output(
            self,
            path.as_ref(),
            normalize_ext(".bin", OutputCodec::Plain),
            overwrite,
            Arc::new(BinaryFormat { record_len }),
        )
    }
}

#[cfg(feature = "io-table")]
impl<T: Data + serde::Serialize + serde::de::DeserializeOwned> Dataset<T> {
    /// Write the block-table format, one file per partition.
    #[track_caller]
    pub fn save_as_table_file(
        &self,
        path: impl AsRef<Path>,
        overwrite: bool,
        compress: bool,
    ) -> Result<Vec<String>> {
        run_output(
            self,
            path.as_ref(),
            normalize_ext(".tab", OutputCodec::Plain),
            overwrite,
            Arc::new(TableFormat::<T> {
                compress,
                _t: std::marker::PhantomData,
            }),
        )
    }
}

#[cfg(feature = "io-csv")]
impl Dataset<Vec<String>> {
    /// Write CSV rows, one file per partition.
    #[track_caller]
    pub fn save_as_csv_file(
        &self,
        path: impl AsRef<Path>,
        overwrite: bool,
        compress: bool,
    ) -> Result<Vec<String>> {
        let codec = if compress {
            OutputCodec::Gzip
        } else {
            OutputCodec::Plain
        };
        run_output(
            self,
            path.as_ref(),
            normalize_ext(".csv", codec),
            overwrite,
            Arc::new(CsvFormat { codec }),
        )
    }
}

// ---------------------------------------------------------------------------
// by-key multi-output
// ---------------------------------------------------------------------------

impl Dataset<(String, String)> {
    /// Partition output by key: each `(key, value)` lands in
    /// `<path>/<key>/<partition><ext>`. At most [`MAX_OPEN_FILES`] files are
    /// open at once; the least-recently-written is flushed and closed when
    /// the cap is hit (compressed files are closed at a member boundary and
    /// appended to on demand).
    #[track_caller]
    pub fn save_as_text_file_by_key(
        &self,
        path: impl AsRef<Path>,
        ext: &str,
        overwrite: bool,
        compress: bool,
    ) -> Result<Vec<String>> {
        let dir = path.as_ref();
        prepare_dir(dir, overwrite)?;
        let codec = if compress {
            OutputCodec::Gzip
        } else {
            OutputCodec::Plain
        };
        let node = MultiOutputDataset {
            core: DatasetCore::derived(self.core()),
            prev: self.clone(),
            dir: dir.to_path_buf(),
            ext: normalize_ext(ext, codec),
            codec,
        };
        Dataset::from_node(Arc::new(node)).collect()
    }
}

struct MultiOutputDataset {
    core: DatasetCore,
    prev: Dataset<(String, String)>,
    dir: PathBuf,
    ext: String,
    codec: OutputCodec,
}

impl DatasetNode<String> for MultiOutputDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn label(&self) -> String {
        format!("<MultiOutput {} {:?}>", self.dir.display(), self.prev)
    }

    fn splits(&self) -> Vec<Arc<dyn Split>> {
        self.prev.splits()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::Narrow {
            parent: self.prev.id(),
        }]
    }

    fn compute(&self, split: &Arc<dyn Split>) -> Result<PartIter<String>> {
        let mut sink = KeyedSink::new(&self.dir, &self.ext, split.index(), self.codec);
        let records = self.prev.iterator(split)?;
        for record in records {
            let (key, value) = record?;
            sink.write(&key, &value)?;
        }
        let published = sink.publish()?;
        Ok(Box::new(published.into_iter().map(Ok)))
    }
}

enum KeyWriter {
    Plain(std::fs::File),
    #[cfg(feature = "io-gzip")]
    Gzip(crate::io::gzip::SyncGzWriter<std::fs::File>),
}

impl KeyWriter {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            KeyWriter::Plain(f) => f.write_all(bytes),
            #[cfg(feature = "io-gzip")]
            KeyWriter::Gzip(w) => w.write_all(bytes),
        }
    }

    /// Close at a clean boundary so the file can be appended to later.
    fn soft_close(self) -> std::io::Result<()> {
        match self {
            KeyWriter::Plain(mut f) => f.flush(),
            #[cfg(feature = "io-gzip")]
            KeyWriter::Gzip(w) => {
                // Finish the member; reopening appends a new member, which the
                // reader consumes as concatenated gzip.
                let mut f = w.finish()?;
                f.flush()
            }
        }
    }
}

struct KeyState {
    tmp: PathBuf,
    writer: Option<KeyWriter>,
    last_write: u64,
    buffer: Vec<u8>,
}

/// Per-partition by-key writer with a bounded set of open files.
struct KeyedSink {
    dir: PathBuf,
    ext: String,
    index: usize,
    codec: OutputCodec,
    keys: HashMap<String, KeyState>,
    clock: u64,
    published: bool,
}

impl KeyedSink {
    fn new(dir: &Path, ext: &str, index: usize, codec: OutputCodec) -> Self {
        Self {
            dir: dir.to_path_buf(),
            ext: ext.to_string(),
            index,
            codec,
            keys: HashMap::new(),
            clock: 0,
            published: false,
        }
    }

    fn write(&mut self, key: &str, value: &str) -> Result<()> {
        self.clock += 1;
        let clock = self.clock;
        if !self.keys.contains_key(key) {
            let kdir = self.dir.join(key);
            std::fs::create_dir_all(&kdir)
                .with_context(|| format!("create key dir {}", kdir.display()))?;
            let tmp = kdir.join(format!(
                ".{:04}{}.{}.tmp",
                self.index,
                self.ext,
                std::process::id()
            ));
            self.keys.insert(
                key.to_string(),
                KeyState {
                    tmp,
                    writer: None,
                    last_write: clock,
                    buffer: Vec::new(),
                },
            );
        }
        let state = self.keys.get_mut(key).expect("just inserted");
        state.last_write = clock;
        state.buffer.extend_from_slice(value.as_bytes());
        if !value.ends_with('\n') {
            state.buffer.push(b'\n');
        }
        if state.buffer.len() > KEY_BLOCK_SIZE {
            self.flush_key(key)?;
        }
        Ok(())
    }

    fn open_writer(tmp: &Path, codec: OutputCodec) -> Result<KeyWriter> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(tmp)
            .with_context(|| format!("open staged file {}", tmp.display()))?;
        Ok(match codec {
            OutputCodec::Plain => KeyWriter::Plain(file),
            #[cfg(feature = "io-gzip")]
            OutputCodec::Gzip => KeyWriter::Gzip(crate::io::gzip::SyncGzWriter::new(file)),
            #[allow(unreachable_patterns)]
            other => bail!("unsupported by-key codec {other:?}"),
        })
    }

    fn flush_key(&mut self, key: &str) -> Result<()> {
        let open_count = self.keys.values().filter(|s| s.writer.is_some()).count();
        let state = self.keys.get_mut(key).expect("known key");
        if state.writer.is_none() {
            state.writer = Some(Self::open_writer(&state.tmp, self.codec)?);
        }
        let buffer = std::mem::take(&mut state.buffer);
        state
            .writer
            .as_mut()
            .expect("just opened")
            .write_all(&buffer)?;
        if open_count >= MAX_OPEN_FILES {
            self.evict_lru(key)?;
        }
        Ok(())
    }

    /// Soft-close the least-recently-written open file other than `keep`.
    fn evict_lru(&mut self, keep: &str) -> Result<()> {
        let victim = self
            .keys
            .iter()
            .filter(|(k, s)| s.writer.is_some() && k.as_str() != keep)
            .min_by_key(|(_, s)| s.last_write)
            .map(|(k, _)| k.clone());
        if let Some(k) = victim
            && let Some(state) = self.keys.get_mut(&k)
            && let Some(writer) = state.writer.take()
        {
            writer.soft_close()?;
        }
        Ok(())
    }

    /// Flush everything and rename the staged files into place.
    fn publish(mut self) -> Result<Vec<String>> {
        let keys: Vec<String> = self.keys.keys().cloned().collect();
        for key in &keys {
            let buffered = !self
                .keys
                .get(key)
                .map(|s| s.buffer.is_empty())
                .unwrap_or(true);
            if buffered {
                self.flush_key(key)?;
            }
        }
        let mut published = Vec::new();
        for (key, state) in self.keys.iter_mut() {
            if let Some(writer) = state.writer.take() {
                writer.soft_close()?;
            }
            let target = self.dir.join(key).join(format!("{:04}{}", self.index, self.ext));
            if !target.exists() {
                std::fs::rename(&state.tmp, &target)
                    .with_context(|| format!("publish {}", target.display()))?;
                published.push(target.display().to_string());
            }
        }
        self.published = true;
        Ok(published)
    }
}

impl Drop for KeyedSink {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // Remove any staged temp files that were never renamed.
        for state in self.keys.values() {
            let _ = std::fs::remove_file(&state.tmp);
        }
    }
}
