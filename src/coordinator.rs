//! Coordinator protocol
//!
//! The worker talks to the coordinator through staging stores: requests are
//! JSON pushed onto the coordinator's inbound key, and every response
//! arrives on a per-file key in this node's own store.
//!
//! | Request            | Response key                       | Response           |
//! |--------------------|------------------------------------|--------------------|
//! | `RegisterFile`     | `registerFile:<file>`              | [`WriteAssignment`]|
//! | `FinalizeOffline`  | none                               |                    |
//! | `FileMeta`         | `filemeta:<file>`                  | [`FileMeta`]       |
//! |                    | `offlineinst:<file>` (offline)     | [`OfflineLayout`]  |
//! | `DegradedOnline`   | `onlinedegradedinst:<file>`        | [`OnlineDegradedPlan`] |
//! | `DegradedOffline`  | `offlinedegradedinst:<object>`     | [`OfflinePlan`]    |
//!
//! Task graphs follow as one JSON [`Task`] per key `compute:<name>:<i>`.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ec::{Task, TaskGraph};
use crate::error::{Error, Result};
use crate::staging::{keys, Location, StagingConnector, StagingStore};

// =============================================================================
// Messages
// =============================================================================

/// How a file is made redundant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyMode {
    /// Erasure-coded while it is written
    Online,
    /// Stored as plain chunks; coded later out of band
    Offline,
}

impl RedundancyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedundancyMode::Online => "online",
            RedundancyMode::Offline => "offline",
        }
    }
}

/// Erasure-code parameters of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeParams {
    pub n: usize,
    pub k: usize,
    pub w: usize,
}

impl CodeParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > self.n || self.n > 256 || self.w == 0 {
            return Err(Error::Protocol(format!(
                "invalid code parameters n={} k={} w={}",
                self.n, self.k, self.w
            )));
        }
        Ok(())
    }
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    RegisterFile {
        origin: Location,
        filename: String,
        group_id: String,
        mode: RedundancyMode,
        size_mb: usize,
    },
    FinalizeOffline {
        origin: Location,
        filename: String,
    },
    FileMeta {
        origin: Location,
        filename: String,
    },
    DegradedOnline {
        origin: Location,
        filename: String,
        missing: Vec<usize>,
    },
    DegradedOffline {
        origin: Location,
        filename: String,
        object: String,
    },
}

impl CoordinatorRequest {
    /// The node that expects the response.
    pub fn origin(&self) -> &Location {
        match self {
            CoordinatorRequest::RegisterFile { origin, .. }
            | CoordinatorRequest::FinalizeOffline { origin, .. }
            | CoordinatorRequest::FileMeta { origin, .. }
            | CoordinatorRequest::DegradedOnline { origin, .. }
            | CoordinatorRequest::DegradedOffline { origin, .. } => origin,
        }
    }
}

/// Response to `RegisterFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum WriteAssignment {
    Online {
        #[serde(flatten)]
        code: CodeParams,
        task_count: usize,
    },
    Offline {
        object_count: usize,
        base_size_mb: usize,
    },
}

/// Response to `FileMeta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub mode: RedundancyMode,
    pub size_mb: usize,
    /// Present for online files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeParams>,
}

/// Response to `DegradedOnline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineDegradedPlan {
    /// Fragment indices to read
    pub load: Vec<usize>,
    pub task_count: usize,
}

/// Layout of an offline file, sent after its `FileMeta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineLayout {
    pub object_count: usize,
    pub base_size_mb: usize,
    /// `integrity[i]` is false when object `i` must be recovered
    pub integrity: Vec<bool>,
}

/// Response to `DegradedOffline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum OfflinePlan {
    /// Rebuild the object here from sibling objects of its coded stripe
    LocalRecompute {
        /// Fragment index of the lost object inside the stripe
        lost: usize,
        #[serde(flatten)]
        code: CodeParams,
        /// (fragment index, object name) of every object to read
        loads: Vec<(usize, String)>,
        task_count: usize,
    },
    /// Peers already hold slices of the object in their staging stores
    RemoteSlice {
        stripe: String,
        /// (column id, location) of every slice source, in slice order
        sources: Vec<(usize, Location)>,
    },
}

/// An offline recovery plan with its task graph resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineRecovery {
    LocalRecompute {
        lost: usize,
        code: CodeParams,
        loads: Vec<(usize, String)>,
        graph: TaskGraph,
    },
    RemoteSlice {
        stripe: String,
        sources: Vec<(usize, Location)>,
    },
}

// =============================================================================
// Client
// =============================================================================

/// Request/response channel to the coordinator.
pub struct CoordinatorClient {
    origin: Location,
    local: Box<dyn StagingStore>,
    remote: Box<dyn StagingStore>,
    request_key: String,
    timeout: Option<Duration>,
}

impl CoordinatorClient {
    /// Open both connections: the coordinator's store for requests and this
    /// node's store for responses.
    pub fn connect(
        connector: &dyn StagingConnector,
        local: &Location,
        coordinator: &Location,
        request_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Ok(Self {
            origin: local.clone(),
            local: connector.connect(local)?,
            remote: connector.connect(coordinator)?,
            request_key: request_key.to_string(),
            timeout,
        })
    }

    pub fn origin(&self) -> &Location {
        &self.origin
    }

    fn send(&mut self, request: &CoordinatorRequest) -> Result<()> {
        let body = serde_json::to_vec(request)?;
        self.remote
            .push(&self.request_key, Bytes::from(body), 1)?;
        self.remote.sync()
    }

    fn wait<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        let raw = self.local.pop(key, self.timeout)?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Protocol(format!("bad response on '{}': {}", key, e)))
    }

    /// Collect `count` tasks published under `compute:<name>:<i>`.
    pub fn fetch_tasks(&mut self, name: &str, count: usize) -> Result<TaskGraph> {
        let mut tasks = Vec::with_capacity(count);
        for i in 0..count {
            let raw = self.local.pop(&keys::compute(name, i), self.timeout)?;
            tasks.push(Task::decode(&raw)?);
        }
        debug!(name, tasks = count, "Task graph received");
        Ok(TaskGraph::new(tasks))
    }

    /// Announce a write and receive its assignment.
    pub fn register_file(
        &mut self,
        filename: &str,
        group_id: &str,
        mode: RedundancyMode,
        size_mb: usize,
    ) -> Result<WriteAssignment> {
        self.send(&CoordinatorRequest::RegisterFile {
            origin: self.origin.clone(),
            filename: filename.to_string(),
            group_id: group_id.to_string(),
            mode,
            size_mb,
        })?;
        let assignment: WriteAssignment = self.wait(&keys::register_file(filename))?;
        match (&assignment, mode) {
            (WriteAssignment::Online { code, .. }, RedundancyMode::Online) => code.validate()?,
            (WriteAssignment::Offline { object_count, .. }, RedundancyMode::Offline) => {
                if *object_count == 0 {
                    return Err(Error::Protocol("offline assignment with no objects".into()));
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "assignment for '{}' does not match requested {} mode",
                    filename,
                    mode.as_str()
                )))
            }
        }
        Ok(assignment)
    }

    /// Tell the coordinator an offline write has fully landed.
    pub fn finalize_offline(&mut self, filename: &str) -> Result<()> {
        self.send(&CoordinatorRequest::FinalizeOffline {
            origin: self.origin.clone(),
            filename: filename.to_string(),
        })
    }

    pub fn file_meta(&mut self, filename: &str) -> Result<FileMeta> {
        self.send(&CoordinatorRequest::FileMeta {
            origin: self.origin.clone(),
            filename: filename.to_string(),
        })?;
        let meta: FileMeta = self.wait(&keys::file_meta(filename))?;
        match (meta.mode, meta.code) {
            (RedundancyMode::Online, Some(code)) => code.validate()?,
            (RedundancyMode::Online, None) => {
                return Err(Error::Protocol(format!(
                    "online file '{}' has no code parameters",
                    filename
                )))
            }
            (RedundancyMode::Offline, _) => {}
        }
        Ok(meta)
    }

    /// Wait for the object layout of an offline file.
    pub fn offline_layout(&mut self, filename: &str) -> Result<OfflineLayout> {
        let layout: OfflineLayout = self.wait(&keys::offline_layout(filename))?;
        if layout.integrity.len() != layout.object_count {
            return Err(Error::Protocol(format!(
                "layout of '{}' lists {} integrity flags for {} objects",
                filename,
                layout.integrity.len(),
                layout.object_count
            )));
        }
        Ok(layout)
    }

    /// Ask for a plan rebuilding the `missing` data fragments of an online
    /// file.
    pub fn degraded_online(
        &mut self,
        filename: &str,
        missing: &[usize],
    ) -> Result<(OnlineDegradedPlan, TaskGraph)> {
        self.send(&CoordinatorRequest::DegradedOnline {
            origin: self.origin.clone(),
            filename: filename.to_string(),
            missing: missing.to_vec(),
        })?;
        let plan: OnlineDegradedPlan = self.wait(&keys::online_degraded(filename))?;
        let graph = self.fetch_tasks(filename, plan.task_count)?;
        Ok((plan, graph))
    }

    /// Ask for a plan recovering one offline object.
    pub fn degraded_offline(&mut self, filename: &str, object: &str) -> Result<OfflineRecovery> {
        self.send(&CoordinatorRequest::DegradedOffline {
            origin: self.origin.clone(),
            filename: filename.to_string(),
            object: object.to_string(),
        })?;
        let plan: OfflinePlan = self.wait(&keys::offline_degraded(object))?;
        Ok(match plan {
            OfflinePlan::LocalRecompute {
                lost,
                code,
                loads,
                task_count,
            } => {
                code.validate()?;
                let graph = self.fetch_tasks(object, task_count)?;
                OfflineRecovery::LocalRecompute {
                    lost,
                    code,
                    loads,
                    graph,
                }
            }
            OfflinePlan::RemoteSlice { stripe, sources } => {
                if sources.is_empty() {
                    return Err(Error::Protocol(format!(
                        "remote-slice plan for '{}' has no sources",
                        object
                    )));
                }
                OfflineRecovery::RemoteSlice { stripe, sources }
            }
        })
    }
}
