//! Utility types and functions shared across the engine.

use anyhow::Result;
use std::cell::Cell;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;
use twox_hash::XxHash64;

use crate::dataset::PartIter;

/// Process-stable hash of a record or key.
///
/// Unlike `std`'s default hasher this is seeded with a fixed key, so the same
/// value hashes identically in every process. Partitioners rely on this to
/// route a key to the same partition on every worker.
pub fn portable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut h = XxHash64::with_seed(0);
    value.hash(&mut h);
    h.finish()
}

/// Iterator over a shared, immutable vector, cloning each element out.
///
/// Used wherever a materialized partition (parallel collections, the cache
/// tracker, broadcast probes) is handed to several consumers.
pub struct SharedVecIter<T> {
    data: Arc<Vec<T>>,
    pos: usize,
}

impl<T> SharedVecIter<T> {
    pub fn new(data: Arc<Vec<T>>) -> Self {
        Self { data, pos: 0 }
    }
}

impl<T: Clone> Iterator for SharedVecIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.data.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(item))
    }
}

thread_local! {
    static CHAIN_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Current dataset-chain depth on this thread.
pub(crate) fn chain_depth() -> usize {
    CHAIN_DEPTH.with(Cell::get)
}

/// Scope guard incrementing the chain depth for the duration of one
/// `iterator()` frame.
pub(crate) struct DepthGuard;

impl DepthGuard {
    pub(crate) fn enter() -> Self {
        CHAIN_DEPTH.with(|d| d.set(d.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CHAIN_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Evaluate the rest of a dataset chain on a helper thread with a fresh
/// stack, streaming records back through a one-slot bounded channel.
///
/// Dropping the returned iterator closes the channel; the producer observes
/// the closed channel on its next send and terminates, and the helper thread
/// is joined before the drop returns.
pub(crate) fn detach_iter<T: Send + 'static>(
    make: impl FnOnce() -> Result<PartIter<T>> + Send + 'static,
) -> PartIter<T> {
    let (tx, rx): (SyncSender<Result<T>>, Receiver<Result<T>>) = sync_channel(1);
    let handle = std::thread::Builder::new()
        .name("millrace-detached".into())
        .spawn(move || {
            let it = match make() {
                Ok(it) => it,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            for item in it {
                if tx.send(item).is_err() {
                    // Consumer went away; stop producing.
                    return;
                }
            }
        });
    match handle {
        Ok(handle) => Box::new(DetachedIter {
            rx: Some(rx),
            handle: Some(handle),
        }),
        Err(e) => Box::new(std::iter::once(Err(anyhow::Error::from(e)))),
    }
}

struct DetachedIter<T> {
    rx: Option<Receiver<Result<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T> Iterator for DetachedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rx.as_ref()?.recv().ok();
        if item.is_none() {
            self.join();
        }
        item
    }
}

impl<T> DetachedIter<T> {
    fn join(&mut self) {
        drop(self.rx.take());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl<T> Drop for DetachedIter<T> {
    fn drop(&mut self) {
        self.join();
    }
}

/// A write buffer that lives in memory up to a cap and rolls over to an
/// unnamed temp file once it grows past it.
///
/// The cartesian operator spools its right-hand side through one of these so
/// small partitions replay from RAM while large ones spill to disk.
pub struct SpoolFile {
    cap: usize,
    mem: Vec<u8>,
    file: Option<File>,
}

impl SpoolFile {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            cap,
            mem: Vec::new(),
            file: None,
        }
    }

    /// Whether the spool has rolled over to disk.
    pub fn rolled(&self) -> bool {
        self.file.is_some()
    }

    fn roll(&mut self) -> io::Result<&mut File> {
        let mut f = tempfile::tempfile()?;
        f.write_all(&self.mem)?;
        self.mem = Vec::new();
        self.file = Some(f);
        Ok(self.file.as_mut().expect("just rolled"))
    }

    /// Finish writing and expose the accumulated bytes for reading.
    pub fn into_contents(mut self) -> io::Result<SpoolContents> {
        match self.file.take() {
            Some(mut f) => {
                f.seek(SeekFrom::Start(0))?;
                Ok(SpoolContents::Disk(f))
            }
            None => Ok(SpoolContents::Memory(self.mem)),
        }
    }
}

impl Write for SpoolFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(f) = self.file.as_mut() {
            return f.write(buf);
        }
        if self.mem.len() + buf.len() > self.cap {
            return self.roll()?.write(buf);
        }
        self.mem.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

/// Finished spool contents, replayable from the start.
pub enum SpoolContents {
    Memory(Vec<u8>),
    Disk(File),
}

impl SpoolContents {
    /// A fresh reader positioned at the beginning of the spooled bytes.
    pub fn reader(&mut self) -> io::Result<SpoolReader<'_>> {
        match self {
            SpoolContents::Memory(bytes) => Ok(SpoolReader::Memory(io::Cursor::new(bytes))),
            SpoolContents::Disk(f) => {
                f.seek(SeekFrom::Start(0))?;
                Ok(SpoolReader::Disk(f))
            }
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, SpoolContents::Memory(_))
    }
}

pub enum SpoolReader<'a> {
    Memory(io::Cursor<&'a Vec<u8>>),
    Disk(&'a mut File),
}

impl Read for SpoolReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SpoolReader::Memory(c) => c.read(buf),
            SpoolReader::Disk(f) => f.read(buf),
        }
    }
}
