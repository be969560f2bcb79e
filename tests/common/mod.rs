//! Shared fixtures: an in-process coordinator, workers on a memory cluster
//! and client helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use ecworker::backend::{MemoryBackend, ObjectBackend};
use ecworker::config::WorkerConfig;
use ecworker::coordinator::{
    CodeParams, CoordinatorRequest, FileMeta, OfflineLayout, OfflinePlan, OnlineDegradedPlan,
    RedundancyMode, WriteAssignment,
};
use ecworker::ec::{planner, TaskGraph};
use ecworker::staging::{keys, Location, MemoryCluster, MemoryStaging};
use ecworker::{Metrics, Packet, PipelineContext, Worker};

pub const COORDINATOR: &str = "coordinator";
pub const WAIT: Duration = Duration::from_secs(10);

/// How the coordinator assigns new files.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub code: CodeParams,
    pub object_count: usize,
    pub base_size_mb: usize,
}

#[derive(Debug, Clone)]
struct FileRecord {
    mode: RedundancyMode,
    size_mb: usize,
    code: CodeParams,
    object_count: usize,
    base_size_mb: usize,
}

#[derive(Default)]
struct CoordinatorState {
    files: HashMap<String, FileRecord>,
    offline_plans: HashMap<String, (OfflinePlan, TaskGraph)>,
    requests: Vec<CoordinatorRequest>,
}

/// Serves `coor_request` like a real coordinator would, using the
/// Reed-Solomon planner for task graphs. Object health is read straight
/// from the worker's backend.
pub struct FakeCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeCoordinator {
    pub fn start(
        cluster: Arc<MemoryCluster>,
        backend: Arc<MemoryBackend>,
        assignment: Assignment,
    ) -> Self {
        let state = Arc::new(Mutex::new(CoordinatorState::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let state = state.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let inbox = cluster.node(&Location::from(COORDINATOR));
                while !stop.load(Ordering::Relaxed) {
                    let Some(raw) = inbox.pop("coor_request", Some(Duration::from_millis(20)))
                    else {
                        continue;
                    };
                    let request: CoordinatorRequest =
                        serde_json::from_slice(&raw).expect("worker sent a bad request");
                    let reply = cluster.node(request.origin());
                    serve(&state, &backend, assignment, &reply, request);
                }
            })
        };

        Self {
            state,
            stop,
            handle: Some(handle),
        }
    }

    /// Answer the next degraded request for `object` with `plan`.
    pub fn set_offline_plan(&self, object: &str, plan: OfflinePlan, graph: TaskGraph) {
        self.state
            .lock()
            .offline_plans
            .insert(object.to_string(), (plan, graph));
    }

    pub fn requests(&self) -> Vec<CoordinatorRequest> {
        self.state.lock().requests.clone()
    }

    pub fn degraded_online_requests(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, CoordinatorRequest::DegradedOnline { .. }))
            .count()
    }
}

impl Drop for FakeCoordinator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn reply_json<T: serde::Serialize>(node: &MemoryStaging, key: &str, value: &T) {
    node.push(key, Bytes::from(serde_json::to_vec(value).unwrap()), 1);
}

fn publish_tasks(node: &MemoryStaging, name: &str, graph: &TaskGraph) -> usize {
    for (i, task) in graph.tasks().iter().enumerate() {
        node.push(&keys::compute(name, i), task.encode().unwrap(), 1);
    }
    graph.len()
}

fn serve(
    state: &Mutex<CoordinatorState>,
    backend: &MemoryBackend,
    assignment: Assignment,
    reply: &MemoryStaging,
    request: CoordinatorRequest,
) {
    state.lock().requests.push(request.clone());

    match request {
        CoordinatorRequest::RegisterFile {
            filename,
            mode,
            size_mb,
            ..
        } => {
            let code = assignment.code;
            state.lock().files.insert(
                filename.clone(),
                FileRecord {
                    mode,
                    size_mb,
                    code,
                    object_count: assignment.object_count,
                    base_size_mb: assignment.base_size_mb,
                },
            );
            match mode {
                RedundancyMode::Online => {
                    let graph = planner::encode_graph(code.n, code.k, code.w).unwrap();
                    let task_count = publish_tasks(reply, &filename, &graph);
                    reply_json(
                        reply,
                        &keys::register_file(&filename),
                        &WriteAssignment::Online { code, task_count },
                    );
                }
                RedundancyMode::Offline => reply_json(
                    reply,
                    &keys::register_file(&filename),
                    &WriteAssignment::Offline {
                        object_count: assignment.object_count,
                        base_size_mb: assignment.base_size_mb,
                    },
                ),
            }
        }

        CoordinatorRequest::FinalizeOffline { .. } => {}

        CoordinatorRequest::FileMeta { filename, .. } => {
            let record = state.lock().files.get(&filename).cloned().expect("unknown file");
            let online = record.mode == RedundancyMode::Online;
            reply_json(
                reply,
                &keys::file_meta(&filename),
                &FileMeta {
                    mode: record.mode,
                    size_mb: record.size_mb,
                    code: online.then_some(record.code),
                },
            );
            if !online {
                let integrity = (0..record.object_count)
                    .map(|i| backend.exists(&keys::object_name(&filename, i)).unwrap())
                    .collect();
                reply_json(
                    reply,
                    &keys::offline_layout(&filename),
                    &OfflineLayout {
                        object_count: record.object_count,
                        base_size_mb: record.base_size_mb,
                        integrity,
                    },
                );
            }
        }

        CoordinatorRequest::DegradedOnline {
            filename, missing, ..
        } => {
            let CodeParams { n, k, w } = state.lock().files[&filename].code;
            // whatever the worker reported missing is never planned as a load
            let available: Vec<usize> = (0..n)
                .filter(|f| !missing.contains(f))
                .filter(|&f| backend.exists(&keys::object_name(&filename, f)).unwrap())
                .collect();
            let Ok(plan) = planner::decode_plan(n, k, w, &available, &missing) else {
                return;
            };
            let task_count = publish_tasks(reply, &filename, &plan.graph);
            reply_json(
                reply,
                &keys::online_degraded(&filename),
                &OnlineDegradedPlan {
                    load: plan.load,
                    task_count,
                },
            );
        }

        CoordinatorRequest::DegradedOffline { object, .. } => {
            let (plan, graph) = state
                .lock()
                .offline_plans
                .remove(&object)
                .expect("no plan for object");
            publish_tasks(reply, &object, &graph);
            reply_json(reply, &keys::offline_degraded(&object), &plan);
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

pub fn worker_config(local: &str, packet_size: usize) -> WorkerConfig {
    WorkerConfig {
        local: Location::from(local),
        coordinator: Location::from(COORDINATOR),
        packet_size,
        wait_timeout_ms: Some(WAIT.as_millis() as u64),
        poll_interval_ms: 20,
        ..Default::default()
    }
}

/// A worker on `local` with its own memory backend.
pub fn worker(
    cluster: &Arc<MemoryCluster>,
    local: &str,
    packet_size: usize,
) -> (Worker, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = PipelineContext::new(
        worker_config(local, packet_size),
        cluster.clone(),
        backend.clone(),
        Metrics::new().unwrap(),
    );
    (Worker::new(ctx), backend)
}

// =============================================================================
// Client side
// =============================================================================

/// Deterministic, non-repeating-looking file contents.
pub fn file_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(seed as u32 % 32) as u8 ^ seed)
        .collect()
}

/// Stage `data` as the client would before a write.
pub fn stage_file(node: &MemoryStaging, filename: &str, data: &[u8], packet_size: usize) {
    for (i, chunk) in data.chunks(packet_size).enumerate() {
        node.push(&keys::packet(filename, i), Packet::from_slice(chunk).encode(), 1);
    }
}

/// Pop `packets` packets from `filename:0..` and concatenate them.
pub fn collect_file(node: &MemoryStaging, filename: &str, packets: usize) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..packets {
        let raw = node
            .pop(&keys::packet(filename, i), Some(WAIT))
            .unwrap_or_else(|| panic!("packet {} of '{}' never arrived", i, filename));
        data.extend_from_slice(Packet::decode(&raw).unwrap().data());
    }
    data
}

/// Pop a 4-byte big-endian value.
pub fn pop_u32(node: &MemoryStaging, key: &str) -> u32 {
    let raw = node.pop(key, Some(WAIT)).expect("value never arrived");
    u32::from_be_bytes(raw[..].try_into().unwrap())
}
