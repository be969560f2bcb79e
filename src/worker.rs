//! Command Dispatcher
//!
//! Pops one command at a time from the worker's request key and runs it to
//! completion before taking the next. All parallelism lives inside a
//! request's pipeline stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pipeline::{read, recovery, write, PipelineContext};

/// The dispatcher of one worker process.
pub struct Worker {
    ctx: PipelineContext,
}

impl Worker {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    /// Serve commands until `shutdown` is raised.
    ///
    /// The request key is polled every `poll_interval` so shutdown is
    /// noticed while idle; a running request is always finished first.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        let request_key = self.ctx.config.request_key.clone();
        let poll = self.ctx.config.poll_interval();
        let mut store = self.ctx.connect_local()?;

        info!(
            local = %self.ctx.config.local,
            request_key = %request_key,
            "Dispatcher started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let raw = match store.pop(&request_key, Some(poll)) {
                Ok(raw) => raw,
                Err(Error::Timeout { .. }) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to pop a command, reconnecting");
                    match self.ctx.connect_local() {
                        Ok(fresh) => store = fresh,
                        Err(e) => {
                            error!(error = %e, "Cannot reconnect to local staging store");
                            std::thread::sleep(poll);
                        }
                    }
                    continue;
                }
            };

            let command = match Command::decode(&raw) {
                Ok(command) => command,
                Err(e) => {
                    warn!(error = %e, bytes = raw.len(), "Discarding malformed command");
                    continue;
                }
            };

            if let Err(e) = self.handle(command) {
                error!(error = %e, "Request failed");
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Run one command to completion.
    pub fn handle(&self, command: Command) -> Result<()> {
        let kind = command.kind();
        let request_id = Uuid::new_v4();
        let span = info_span!("request", %request_id, kind, subject = %command.subject());
        let _enter = span.enter();

        debug!("Request started");
        let started = Instant::now();
        let result = self.dispatch(command);
        let elapsed = started.elapsed();

        self.ctx.metrics.observe_request(kind, result.is_ok(), elapsed);
        if result.is_ok() {
            info!(elapsed_ms = elapsed.as_millis() as u64, "Request complete");
        }
        result
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        let ctx = &self.ctx;
        match command {
            Command::ClientWrite {
                filename,
                group_id,
                mode,
                size_mb,
            } => write::client_write(ctx, &filename, &group_id, mode, size_mb),

            Command::ClientRead { filename } => read::client_read(ctx, &filename),

            Command::DiskRead {
                stripe,
                object,
                w,
                packets,
                columns,
                refs,
            } => recovery::disk_read(ctx, &stripe, &object, w, packets, &columns, &refs),

            Command::FetchCompute {
                stripe,
                w,
                packets,
                sources,
                coefficients,
                refs,
            } => recovery::fetch_compute(ctx, &stripe, w, packets, &sources, &coefficients, &refs),

            Command::Persist {
                stripe,
                object,
                packets,
                sources,
            } => recovery::persist(ctx, &stripe, &object, packets, &sources),
        }
    }
}
