//! Prometheus metrics for the worker
//!
//! All metrics live in a registry owned by [`Metrics`], so tests can build
//! as many independent instances as they like.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Request outcome label values.
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";

/// Worker metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    request_duration: HistogramVec,
    stripes_computed: IntCounter,
    packets_persisted: IntCounter,
    packets_cached: IntCounter,
    degraded_reads: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("stripes_computed", &self.stripes_computed.get())
            .field("packets_persisted", &self.packets_persisted.get())
            .field("packets_cached", &self.packets_cached.get())
            .finish()
    }
}

impl Metrics {
    /// Create and register every metric in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("ecworker_requests_total", "Requests handled by the dispatcher"),
            &["kind", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "ecworker_request_duration_seconds",
                "Wall time of one request",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 120.0]),
            &["kind"],
        )?;
        let stripes_computed = IntCounter::new(
            "ecworker_stripes_computed_total",
            "Stripes run through the compute engine",
        )?;
        let packets_persisted = IntCounter::new(
            "ecworker_packets_persisted_total",
            "Packets appended to backend objects",
        )?;
        let packets_cached = IntCounter::new(
            "ecworker_packets_cached_total",
            "Packets pushed to staging keys",
        )?;
        let degraded_reads = IntCounterVec::new(
            Opts::new("ecworker_degraded_reads_total", "Reads that needed reconstruction"),
            &["mode"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(stripes_computed.clone()))?;
        registry.register(Box::new(packets_persisted.clone()))?;
        registry.register(Box::new(packets_cached.clone()))?;
        registry.register(Box::new(degraded_reads.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            stripes_computed,
            packets_persisted,
            packets_cached,
            degraded_reads,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one finished request.
    pub fn observe_request(&self, kind: &str, ok: bool, elapsed: Duration) {
        let outcome = if ok { OUTCOME_OK } else { OUTCOME_ERROR };
        self.requests.with_label_values(&[kind, outcome]).inc();
        self.request_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn requests(&self, kind: &str, outcome: &str) -> u64 {
        self.requests.with_label_values(&[kind, outcome]).get()
    }

    pub fn add_stripes(&self, n: usize) {
        self.stripes_computed.inc_by(n as u64);
    }

    pub fn stripes_computed(&self) -> u64 {
        self.stripes_computed.get()
    }

    pub fn add_persisted(&self, n: usize) {
        self.packets_persisted.inc_by(n as u64);
    }

    pub fn packets_persisted(&self) -> u64 {
        self.packets_persisted.get()
    }

    pub fn add_cached(&self, n: usize) {
        self.packets_cached.inc_by(n as u64);
    }

    pub fn packets_cached(&self) -> u64 {
        self.packets_cached.get()
    }

    pub fn degraded_read(&self, mode: &str) {
        self.degraded_reads.with_label_values(&[mode]).inc();
    }

    pub fn degraded_reads(&self, mode: &str) -> u64 {
        self.degraded_reads.with_label_values(&[mode]).get()
    }

    /// Text exposition of every metric.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn encode_string(&self) -> Result<String> {
        String::from_utf8(self.encode()?)
            .map_err(|e| Error::Internal(format!("metrics exposition is not UTF-8: {}", e)))
    }
}
