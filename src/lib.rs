//! ecworker - per-node erasure-coding pipeline worker
//!
//! A storage node runs one worker. It pops commands from its staging store,
//! turns client packets into erasure-coded fragment objects, serves them
//! back (rebuilding lost fragments on the way) and takes part in
//! coordinator-driven repair.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  commands  ┌────────────┐  stages  ┌─────────────────────┐
//! │ staging  │───────────▶│ Dispatcher │─────────▶│ write / read /      │
//! │  store   │◀───────────│  (worker)  │          │ recovery pipelines  │
//! └──────────┘  packets   └────────────┘          └─────────────────────┘
//!       ▲                       │                    │             │
//!       │                       ▼                    ▼             ▼
//!       │               ┌──────────────┐     ┌────────────┐ ┌──────────┐
//!       └───────────────│ Coordinator  │     │  Compute   │ │  Object  │
//!                       │   client     │     │  engine    │ │  backend │
//!                       └──────────────┘     └────────────┘ └──────────┘
//! ```
//!
//! # Modules
//!
//! - [`packet`] - packets and their wire framing
//! - [`queue`] - inter-stage packet queues
//! - [`ec`] - task graphs, the stripe compute engine and code planners
//! - [`staging`] - the keyed push/pop store (in-memory and TCP)
//! - [`backend`] - object storage for fragments and chunks
//! - [`io`] - streaming adapters between stages and stores
//! - [`coordinator`] - coordinator messages and client
//! - [`command`] - inbound commands
//! - [`pipeline`] - write, read and recovery pipelines
//! - [`worker`] - the command dispatcher
//! - [`config`] - worker configuration
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - error types

pub mod backend;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod ec;
pub mod error;
pub mod io;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod staging;
pub mod worker;

// Re-export commonly used types
pub use command::Command;
pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use packet::Packet;
pub use pipeline::PipelineContext;
pub use worker::Worker;
