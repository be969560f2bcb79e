//! ecworker
//!
//! Per-node erasure-coding pipeline worker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ecworker                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Staging    │───▶│  Dispatcher  │───▶│  Pipelines   │       │
//! │  │   store      │    │  (blocking)  │    │  (threads)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐    ┌──────────────┐                           │
//! │  │ Health :8081 │    │ Metrics:8080 │   tokio runtime           │
//! │  └──────────────┘    └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecworker::backend;
use ecworker::config::{BackendConfig, WorkerConfig};
use ecworker::staging::{Location, MemoryStaging, StagingServer, TcpConnector};
use ecworker::{Metrics, PipelineContext, Worker};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ecworker - erasure-coding pipeline worker for one storage node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override it
    #[arg(long, env = "ECWORKER_CONFIG")]
    config: Option<PathBuf>,

    /// This node's staging store address
    #[arg(long, env = "ECWORKER_LOCAL")]
    local: Option<String>,

    /// Coordinator staging store address
    #[arg(long, env = "ECWORKER_COORDINATOR")]
    coordinator: Option<String>,

    /// Key the coordinator pops requests from
    #[arg(long, env = "ECWORKER_COORDINATOR_KEY")]
    coordinator_key: Option<String>,

    /// Packet size in bytes (must divide 1 MiB)
    #[arg(long, env = "ECWORKER_PACKET_SIZE")]
    packet_size: Option<usize>,

    /// Key commands are popped from
    #[arg(long, env = "ECWORKER_REQUEST_KEY")]
    request_key: Option<String>,

    /// Bound on every staging/coordinator wait, in milliseconds
    #[arg(long, env = "ECWORKER_WAIT_TIMEOUT_MS")]
    wait_timeout_ms: Option<u64>,

    /// Store objects as files under this directory instead of in memory
    #[arg(long, env = "ECWORKER_BACKEND_ROOT")]
    backend_root: Option<PathBuf>,

    /// Serve this node's staging store from the worker process
    #[arg(long, env = "ECWORKER_SERVE_STAGING")]
    serve_staging: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => WorkerConfig::default(),
        };

        if let Some(local) = &self.local {
            config.local = Location::from(local.as_str());
        }
        if let Some(coordinator) = &self.coordinator {
            config.coordinator = Location::from(coordinator.as_str());
        }
        if let Some(coordinator_key) = &self.coordinator_key {
            config.coordinator_key = coordinator_key.clone();
        }
        if let Some(packet_size) = self.packet_size {
            config.packet_size = packet_size;
        }
        if let Some(request_key) = &self.request_key {
            config.request_key = request_key.clone();
        }
        if self.wait_timeout_ms.is_some() {
            config.wait_timeout_ms = self.wait_timeout_ms;
        }
        if let Some(root) = &self.backend_root {
            config.backend = BackendConfig::Local { root: root.clone() };
        }

        config.validate().context("invalid worker configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = args.worker_config()?;
    info!("Starting ecworker");
    info!("  Local staging: {}", config.local);
    info!("  Coordinator: {}", config.coordinator);
    info!("  Packet size: {} bytes", config.packet_size);
    info!("  Backend: {:?}", config.backend);

    if args.serve_staging {
        let listener = StagingServer::bind(config.local.as_str())
            .with_context(|| format!("binding staging store on {}", config.local))?;
        let server = StagingServer::new(MemoryStaging::new());
        thread::Builder::new()
            .name("staging-server".into())
            .spawn(move || {
                if let Err(e) = server.serve(listener) {
                    error!("Staging server error: {}", e);
                }
            })
            .context("spawning staging server")?;
    }

    let backend = backend::from_config(&config.backend).context("opening object backend")?;
    let metrics = Metrics::new().context("registering metrics")?;
    let ctx = PipelineContext::new(
        config,
        Arc::new(TcpConnector),
        backend.clone(),
        metrics.clone(),
    );
    let worker = Worker::new(ctx);

    let shutdown = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_shutdown).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    // The dispatcher blocks for whole requests, so it gets its own thread
    let dispatcher_shutdown = shutdown.clone();
    let mut dispatcher =
        tokio::task::spawn_blocking(move || worker.run(&dispatcher_shutdown));

    tokio::select! {
        joined = &mut dispatcher => {
            joined.context("dispatcher thread panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing Ctrl-C handler")?;
            info!("Shutdown requested, finishing current request");
            shutdown.store(true, Ordering::Relaxed);
            dispatcher.await.context("dispatcher thread panicked")??;
        }
    }

    info!(stats = ?backend.stats(), "Worker shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP
// =============================================================================

mod http {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::{Response, StatusCode};

    pub type Body = Full<Bytes>;

    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }
}

async fn run_health_server(addr: &str, shutdown: Arc<AtomicBool>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("health server accept error")?;
        let io = TokioIo::new(stream);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let draining = shutdown.load(Ordering::Relaxed);
                async move {
                    let response: Response<http::Body> = match req.uri().path() {
                        "/healthz" | "/livez" => http::text(StatusCode::OK, "ok"),
                        "/readyz" if draining => {
                            http::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                        }
                        "/readyz" => http::text(StatusCode::OK, "ok"),
                        _ => http::text(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str, metrics: Metrics) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let response: Response<http::Body> = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = http::text(StatusCode::OK, buffer);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => http::text(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                format!("encoding metrics: {}", e),
                            ),
                        },
                        _ => http::text(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "ecworker",
            "--coordinator",
            "10.0.0.9:7000",
            "--coordinator-key",
            "coor_request_b",
            "--packet-size",
            "65536",
        ])
        .unwrap();
        let config = args.worker_config().unwrap();

        assert_eq!(config.coordinator, Location::from("10.0.0.9:7000"));
        assert_eq!(config.coordinator_key, "coor_request_b");
        assert_eq!(config.packet_size, 65536);
        assert_eq!(config.request_key, WorkerConfig::default().request_key);
    }

    #[test]
    fn test_bad_packet_size_is_rejected() {
        let args = Args::try_parse_from(["ecworker", "--packet-size", "1000"]).unwrap();
        assert!(args.worker_config().is_err());
    }
}
