//! Staging Store
//!
//! The keyed push/pop queue store shared by clients, peers, the coordinator
//! and this worker. Values are opaque byte strings: framed packets on the
//! data path, JSON messages on the control path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect(location)  ┌───────────────────────────────┐
//! │   Worker     │────────────────────▶│  StagingConnector              │
//! │   threads    │                     │   MemoryCluster │ TcpConnector │
//! └──────┬───────┘                     └───────────────┬───────────────┘
//!        │ Box<dyn StagingStore> (one per thread)      │
//!        ▼                                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  push(key, value, copies)  pop(key, timeout)  pop_pipelined(..) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every worker thread opens its own connection, so no connection state is
//! shared between threads.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::{MemoryCluster, MemoryStaging};
pub use tcp::{StagingServer, TcpConnector, TcpStaging};

// =============================================================================
// Location
// =============================================================================

/// Network address of a node's staging store (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(pub String);

impl Location {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Location {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Location {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// One connection to a staging store.
pub trait StagingStore: Send {
    /// Where this connection points.
    fn location(&self) -> &Location;

    /// Append `value` to the list at `key`, `copies` times (fan-out to
    /// several consumers).
    fn push(&mut self, key: &str, value: Bytes, copies: usize) -> Result<()>;

    /// Remove and return the head of the list at `key`, blocking until one
    /// exists or `timeout` expires (`None` waits forever).
    fn pop(&mut self, key: &str, timeout: Option<Duration>) -> Result<Bytes>;

    /// Pop each key in order, handing values to `sink` as they arrive.
    /// Network stores send every request before draining replies.
    fn pop_pipelined(
        &mut self,
        keys: &[String],
        timeout: Option<Duration>,
        sink: &mut dyn FnMut(Bytes) -> Result<()>,
    ) -> Result<()> {
        for key in keys {
            let value = self.pop(key, timeout)?;
            sink(value)?;
        }
        Ok(())
    }

    /// Wait until every push issued so far has been acknowledged.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens staging-store connections by location.
pub trait StagingConnector: Send + Sync {
    fn connect(&self, location: &Location) -> Result<Box<dyn StagingStore>>;
}

// =============================================================================
// Keys
// =============================================================================

/// Key conventions shared with clients, peers and the coordinator.
pub mod keys {
    /// `base:index`
    pub fn packet(base: &str, index: usize) -> String {
        format!("{}:{}", base, index)
    }

    /// `base:index:round`
    pub fn slice(base: &str, index: usize, round: usize) -> String {
        format!("{}:{}:{}", base, index, round)
    }

    /// Backend object holding fragment/chunk `index` of `filename`.
    pub fn object_name(filename: &str, index: usize) -> String {
        format!("{}_oecobj_{}", filename, index)
    }

    pub fn register_file(filename: &str) -> String {
        format!("registerFile:{}", filename)
    }

    pub fn compute(name: &str, index: usize) -> String {
        format!("compute:{}:{}", name, index)
    }

    pub fn file_meta(filename: &str) -> String {
        format!("filemeta:{}", filename)
    }

    pub fn file_size(filename: &str) -> String {
        format!("filesize:{}", filename)
    }

    pub fn offline_layout(filename: &str) -> String {
        format!("offlineinst:{}", filename)
    }

    pub fn online_degraded(filename: &str) -> String {
        format!("onlinedegradedinst:{}", filename)
    }

    pub fn offline_degraded(object: &str) -> String {
        format!("offlinedegradedinst:{}", object)
    }

    pub fn write_finish(name: &str) -> String {
        format!("writefinish:{}", name)
    }
}
