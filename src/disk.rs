//! Access to the file system, as consumed by the build core.
//!
//! Abstract so it can be mocked out for tests; the real implementation is
//! RealDiskInterface.

use anyhow::anyhow;
use std::io::Write;

/// File modification time in nanoseconds.
pub type TimeStamp = i64;

/// MTime info gathered for a file.  This also models "file is absent".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    Stamp(TimeStamp),
}

impl MTime {
    /// The raw timestamp as recorded in logs; absent files record 0.
    pub fn timestamp(&self) -> TimeStamp {
        match self {
            MTime::Missing => 0,
            MTime::Stamp(t) => *t,
        }
    }
}

pub trait DiskInterface {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> anyhow::Result<MTime>;

    /// Read a file's contents.  Absence is reported as ErrorKind::NotFound.
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;

    /// Create a file with the given contents, replacing any existing file.
    fn write_file(&mut self, path: &str, contents: &str) -> anyhow::Result<()>;

    /// Create a single directory.
    fn make_dir(&mut self, path: &str) -> anyhow::Result<()>;

    /// Create all parent directories of path, like `mkdir -p $(dirname path)`.
    fn make_dirs(&mut self, path: &str) -> anyhow::Result<()>;

    /// Remove a file.  Returns Ok(true) if it was removed, Ok(false) if it
    /// was already absent.
    fn remove_file(&mut self, path: &str) -> anyhow::Result<bool>;
}

#[cfg(unix)]
fn mtime_from_metadata(meta: &std::fs::Metadata) -> TimeStamp {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(not(unix))]
fn mtime_from_metadata(meta: &std::fs::Metadata) -> TimeStamp {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as TimeStamp)
        .unwrap_or(0)
}

/// Implementation of DiskInterface that actually hits the disk.
#[derive(Default)]
pub struct RealDiskInterface {}

impl DiskInterface for RealDiskInterface {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(mtime_from_metadata(&meta))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(anyhow!("stat {}: {}", path, err)),
        }
    }

    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&mut self, path: &str, contents: &str) -> anyhow::Result<()> {
        let mut f = std::fs::File::create(path).map_err(|err| anyhow!("create {}: {}", path, err))?;
        f.write_all(contents.as_bytes())
            .map_err(|err| anyhow!("write {}: {}", path, err))?;
        Ok(())
    }

    fn make_dir(&mut self, path: &str) -> anyhow::Result<()> {
        match std::fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(anyhow!("mkdir {}: {}", path, err)),
        }
    }

    fn make_dirs(&mut self, path: &str) -> anyhow::Result<()> {
        match std::path::Path::new(path).parent() {
            None => Ok(()),
            Some(parent) if parent.as_os_str().is_empty() => Ok(()),
            Some(parent) => std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("mkdir -p {}: {}", parent.display(), err)),
        }
    }

    fn remove_file(&mut self, path: &str) -> anyhow::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!("remove {}: {}", path, err)),
        }
    }
}

/// In-memory file system used by unit tests.  Clones share the same backing
/// store so a test can inspect what the code under test wrote.
#[cfg(test)]
pub use virtual_disk::VirtualDisk;
