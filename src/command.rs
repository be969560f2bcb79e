//! Inbound commands
//!
//! One JSON object per request, popped from the worker's request key and
//! selected by its `type` tag.

use serde::{Deserialize, Serialize};

use crate::coordinator::RedundancyMode;
use crate::error::{Error, Result};
use crate::staging::Location;

/// A request the dispatcher can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Stripe a client's staged packets into backend objects
    ClientWrite {
        filename: String,
        #[serde(default)]
        group_id: String,
        mode: RedundancyMode,
        size_mb: usize,
    },

    /// Serve a file back to the client's staging keys
    ClientRead { filename: String },

    /// Read an object in slices and stage the requested columns
    DiskRead {
        stripe: String,
        object: String,
        w: usize,
        /// Packets in the object
        packets: usize,
        /// Column ids to stage; column `cid` takes slice `cid mod w`
        columns: Vec<usize>,
        /// (column id, copies); columns not listed get one copy
        #[serde(default)]
        refs: Vec<(usize, usize)>,
    },

    /// Fetch slices from peers, combine them and stage the results locally
    FetchCompute {
        stripe: String,
        w: usize,
        /// Slices per source
        packets: usize,
        /// (column id, location) of every input, in coefficient order
        sources: Vec<(usize, Location)>,
        /// (output column id, one coefficient per source)
        coefficients: Vec<(usize, Vec<u8>)>,
        #[serde(default)]
        refs: Vec<(usize, usize)>,
    },

    /// Fetch slices from peers and persist them interleaved as one object
    Persist {
        stripe: String,
        object: String,
        /// Slices per source
        packets: usize,
        sources: Vec<(usize, Location)>,
    },
}

impl Command {
    /// Decode one raw request.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Protocol("empty command".into()));
        }
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Metrics label for this kind of request.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::ClientWrite { .. } => "client_write",
            Command::ClientRead { .. } => "client_read",
            Command::DiskRead { .. } => "disk_read",
            Command::FetchCompute { .. } => "fetch_compute",
            Command::Persist { .. } => "persist",
        }
    }

    /// File, stripe or object the request is about.
    pub fn subject(&self) -> &str {
        match self {
            Command::ClientWrite { filename, .. } | Command::ClientRead { filename } => filename,
            Command::DiskRead { stripe, .. }
            | Command::FetchCompute { stripe, .. }
            | Command::Persist { stripe, .. } => stripe,
        }
    }
}

/// Copies requested for column `cid` in a `refs` list.
pub fn copies_for(refs: &[(usize, usize)], cid: usize) -> usize {
    refs.iter()
        .find(|(c, _)| *c == cid)
        .map_or(1, |(_, copies)| *copies)
}
