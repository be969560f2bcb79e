//! Error types for the erasure-coding worker

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a worker request
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Packet / Queue Errors
    // =========================================================================
    /// Malformed packet frame
    #[error("Invalid packet frame: {0}")]
    InvalidPacket(String),

    /// The peer stage of an inter-stage queue went away
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// A pipeline stage panicked
    #[error("Pipeline stage '{stage}' panicked")]
    StagePanicked { stage: String },

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Task graph rejected at the trust boundary
    #[error("Invalid task graph: {0}")]
    InvalidTaskGraph(String),

    /// A task referenced a child symbol that was never produced
    #[error("Missing symbol {symbol} while executing task {task}")]
    MissingSymbol { symbol: u32, task: usize },

    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Insufficient fragments for reconstruction
    #[error("Insufficient fragments for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Coefficient matrix could not be inverted
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    // =========================================================================
    // Staging Store / Coordinator Errors
    // =========================================================================
    /// Staging store failure
    #[error("Staging store error at {location}: {reason}")]
    Staging { location: String, reason: String },

    /// A bounded wait expired
    #[error("Timed out after {waited:?} waiting on '{key}'")]
    Timeout { key: String, waited: Duration },

    /// Coordinator sent something the worker cannot act on
    #[error("Coordinator protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Object Backend Errors
    // =========================================================================
    /// Backend object not found
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Backend operation failed
    #[error("Backend error on object {object}: {reason}")]
    Backend { object: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Whether this error only reports that a neighbouring stage stopped.
    ///
    /// Used when joining a pipeline to surface the root cause instead.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Error::QueueClosed(_))
    }
}
