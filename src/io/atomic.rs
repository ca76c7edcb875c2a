//! Atomic file publication.
//!
//! Writers stage output into a hidden sibling `.<name>.<random>.tmp`, set
//! permissions, then rename over the target so readers only ever observe
//! complete files. Abandoning the staged file (empty output, task failure,
//! drop without publish) removes the temp file and leaves the target
//! untouched — the outcome is a value, not control flow by exception.

use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// What a partition writer produced.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The staged file was renamed into place.
    Published(PathBuf),
    /// The partition produced no output; nothing was published.
    Empty,
}

/// A staged output file. Publish renames it over the target; dropping it
/// without publishing removes the temp file.
pub struct AtomicFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl AtomicFile {
    pub fn create(target: &Path) -> Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid output path {}", target.display()))?;
        if let Err(first) = std::fs::create_dir_all(&dir) {
            // Directory caches on networked file systems can lag ~1s.
            std::thread::sleep(Duration::from_secs(1));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create {} (first error: {first})", dir.display()))?;
        }
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .with_context(|| format!("stage temp file for {}", target.display()))?;
        Ok(Self {
            tmp,
            target: target.to_path_buf(),
        })
    }

    pub fn writer(&mut self) -> &mut File {
        self.tmp.as_file_mut()
    }

    /// Rename the staged file over the target with permissions `0644`.
    pub fn publish(self) -> Result<PathBuf> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            self.tmp
                .as_file()
                .set_permissions(perms)
                .with_context(|| format!("chmod staged file for {}", self.target.display()))?;
        }
        self.tmp
            .persist(&self.target)
            .with_context(|| format!("publish {}", self.target.display()))?;
        Ok(self.target)
    }

    /// Remove the staged temp file without publishing.
    pub fn discard(self) {
        // NamedTempFile deletes on drop.
        drop(self.tmp);
    }
}
