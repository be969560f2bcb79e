//! Request Pipelines
//!
//! Each request runs as a set of stages, one OS thread per stage, wired
//! together by packet queues and joined before the request returns.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │ load/read  │──▶│  compute   │──▶│  persist/  │──▶│  backend / │
//! │ stage × k  │   │  stage × 1 │   │  cache × n │   │  staging   │
//! └────────────┘   └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! - **write**: online (encode) and offline (chunked) writes
//! - **read**: online fast/degraded reads and offline reads
//! - **recovery**: peer-driven disk read, fetch-and-compute and persist
//!
//! A stage that fails returns its error and drops its queue endpoints; its
//! neighbours then see a closed queue and stop. [`Stages::join`] reports
//! the root cause rather than the resulting closed-queue errors.

pub mod layout;
pub mod read;
pub mod recovery;
pub mod write;

use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use crate::backend::ObjectBackend;
use crate::config::WorkerConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::staging::{keys, StagingConnector, StagingStore};

pub use layout::{ChunkLayout, StripeLayout};

// =============================================================================
// Context
// =============================================================================

/// Everything a pipeline needs from the worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<WorkerConfig>,
    pub connector: Arc<dyn StagingConnector>,
    pub backend: Arc<dyn ObjectBackend>,
    pub metrics: Metrics,
}

impl PipelineContext {
    pub fn new(
        config: WorkerConfig,
        connector: Arc<dyn StagingConnector>,
        backend: Arc<dyn ObjectBackend>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            backend,
            metrics,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.config.packet_size
    }

    pub fn packets_per_unit(&self) -> usize {
        self.config.packets_per_unit()
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.config.wait_timeout()
    }

    /// A new connection to this node's staging store.
    pub fn connect_local(&self) -> Result<Box<dyn StagingStore>> {
        self.connector.connect(&self.config.local)
    }

    /// A new coordinator channel.
    pub fn coordinator(&self) -> Result<CoordinatorClient> {
        CoordinatorClient::connect(
            self.connector.as_ref(),
            &self.config.local,
            &self.config.coordinator,
            &self.config.coordinator_key,
            self.wait_timeout(),
        )
    }

    /// Push the write-completion marker for `name`.
    pub fn notify_write_finish(&self, name: &str) -> Result<()> {
        let mut store = self.connect_local()?;
        store.push(
            &keys::write_finish(name),
            Bytes::copy_from_slice(&1u32.to_be_bytes()),
            1,
        )?;
        store.sync()
    }

    /// Publish a file's size for the reading client.
    pub fn publish_file_size(&self, filename: &str, size_mb: usize) -> Result<()> {
        let mut store = self.connect_local()?;
        store.push(
            &keys::file_size(filename),
            Bytes::copy_from_slice(&(size_mb as u32).to_be_bytes()),
            1,
        )?;
        store.sync()
    }
}

// =============================================================================
// Stages
// =============================================================================

/// The threads of one request, spawned inside a [`thread::scope`].
pub struct Stages<'scope, 'env> {
    scope: &'scope Scope<'scope, 'env>,
    handles: Vec<(String, ScopedJoinHandle<'scope, Result<()>>)>,
}

impl<'scope, 'env> Stages<'scope, 'env> {
    pub fn new(scope: &'scope Scope<'scope, 'env>) -> Self {
        Self {
            scope,
            handles: Vec::new(),
        }
    }

    /// Start a named stage. It begins running immediately.
    pub fn spawn<F>(&mut self, name: impl Into<String>, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'scope,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn_scoped(self.scope, body)?;
        self.handles.push((name, handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every stage in spawn order and report the first root-cause
    /// failure.
    pub fn join(self) -> Result<()> {
        let mut root: Option<Error> = None;
        let mut secondary: Option<Error> = None;

        for (name, handle) in self.handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_secondary() => {
                    debug!(stage = %name, error = %e, "Stage stopped by neighbour");
                    secondary.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    error!(stage = %name, error = %e, "Stage failed");
                    root.get_or_insert(e);
                }
                Err(_) => {
                    error!(stage = %name, "Stage panicked");
                    root.get_or_insert(Error::StagePanicked { stage: name });
                }
            }
        }

        match root.or(secondary) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::queue::packet_queue;
    use assert_matches::assert_matches;

    #[test]
    fn test_join_reports_root_cause() {
        let result = thread::scope(|s| {
            let mut stages = Stages::new(s);
            let (tx, rx) = packet_queue("a->b");
            stages
                .spawn("producer", move || {
                    tx.push(Packet::from_slice(b"x"))?;
                    Err(Error::Internal("disk on fire".into()))
                })
                .unwrap();
            stages
                .spawn("consumer", move || loop {
                    rx.pop()?;
                })
                .unwrap();
            assert_eq!(stages.len(), 2);
            stages.join()
        });
        assert_matches!(result, Err(Error::Internal(msg)) if msg == "disk on fire");
    }

    #[test]
    fn test_join_reports_panic() {
        let result = thread::scope(|s| {
            let mut stages = Stages::new(s);
            stages.spawn("ok", || Ok(())).unwrap();
            stages.spawn("boom", || panic!("stage bug")).unwrap();
            stages.join()
        });
        assert_matches!(result, Err(Error::StagePanicked { stage }) if stage == "boom");
    }

    #[test]
    fn test_join_all_ok() {
        let result = thread::scope(|s| {
            let mut stages = Stages::new(s);
            for i in 0..4 {
                stages.spawn(format!("s{}", i), || Ok(())).unwrap();
            }
            stages.join()
        });
        assert!(result.is_ok());
    }
}
