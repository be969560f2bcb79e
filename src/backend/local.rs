//! Filesystem object backend
//!
//! One file per object under a root directory. Object names are flattened
//! so they cannot escape the root.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{BackendStats, ObjectBackend};
use crate::error::{Error, Result};

/// Objects stored as plain files.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl LocalBackend {
    /// Use `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Local backend opened");
        Ok(Self {
            root,
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, object: &str) -> Result<PathBuf> {
        if object.is_empty() || object == "." || object == ".." {
            return Err(Error::Backend {
                object: object.to_string(),
                reason: "invalid object name".into(),
            });
        }
        Ok(self.root.join(object.replace(['/', '\\'], "_")))
    }

    fn not_found(object: &str, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::ObjectNotFound(object.to_string())
        } else {
            Error::Io(e)
        }
    }
}

impl ObjectBackend for LocalBackend {
    fn exists(&self, object: &str) -> Result<bool> {
        Ok(self.path(object)?.is_file())
    }

    fn create(&self, object: &str) -> Result<()> {
        File::create(self.path(object)?)?;
        Ok(())
    }

    fn append(&self, object: &str, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path(object)?)
            .map_err(|e| Self::not_found(object, e))?;
        file.write_all(data)?;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self, object: &str) -> Result<u64> {
        let meta = fs::metadata(self.path(object)?).map_err(|e| Self::not_found(object, e))?;
        Ok(meta.len())
    }

    fn read_at(&self, object: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.path(object)?).map_err(|e| Self::not_found(object, e))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf)
    }

    fn stats(&self) -> BackendStats {
        let objects = fs::read_dir(&self.root)
            .map(|dir| dir.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
            .unwrap_or(0);
        BackendStats {
            objects: objects as u64,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}
