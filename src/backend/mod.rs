//! Object Backend
//!
//! The pluggable store that fragment and chunk objects live in. The worker
//! only ever appends to an object while writing it and reads it back by
//! offset, so the contract is small.
//!
//! - [`MemoryBackend`]: DashMap-backed, for tests and single-process runs
//! - [`LocalBackend`]: one file per object under a root directory

pub mod local;
pub mod memory;

use std::sync::Arc;

use crate::config::BackendConfig;
use crate::error::Result;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// Object storage contract used by the streaming adapters.
pub trait ObjectBackend: Send + Sync {
    /// Whether `object` exists.
    fn exists(&self, object: &str) -> Result<bool>;

    /// Create (or truncate) `object`.
    fn create(&self, object: &str) -> Result<()>;

    /// Append bytes to the end of `object`.
    fn append(&self, object: &str, data: &[u8]) -> Result<()>;

    /// Current length of `object` in bytes.
    fn len(&self, object: &str) -> Result<u64>;

    /// Read up to `len` bytes starting at `offset`. Short only at the end.
    fn read_at(&self, object: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Usage counters.
    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}

/// Backend usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub objects: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// Build the backend selected by configuration.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn ObjectBackend>> {
    Ok(match config {
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        BackendConfig::Local { root } => Arc::new(LocalBackend::open(root)?),
    })
}
