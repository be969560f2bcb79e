//! Write pipelines
//!
//! Online writes stripe the client's packets across `k` data columns,
//! encode every stripe and persist `n` fragment objects. Offline writes
//! persist the file as plain chunk objects and leave coding to a later,
//! out-of-band pass.

use std::thread;

use tracing::{info, instrument};

use super::{ChunkLayout, PipelineContext, Stages, StripeLayout};
use crate::coordinator::{CodeParams, RedundancyMode, WriteAssignment};
use crate::ec::{ComputeEngine, SymbolId, TaskGraph};
use crate::error::{Error, Result};
use crate::io::{load_worker, KeyRange, ObjectOutputStream};
use crate::metrics::Metrics;
use crate::queue::{packet_queue, QueueRx, QueueTx};
use crate::staging::keys;

/// Handle a client write: register it, then run the assigned pipeline.
#[instrument(skip(ctx))]
pub fn client_write(
    ctx: &PipelineContext,
    filename: &str,
    group_id: &str,
    mode: RedundancyMode,
    size_mb: usize,
) -> Result<()> {
    let mut coordinator = ctx.coordinator()?;
    match coordinator.register_file(filename, group_id, mode, size_mb)? {
        WriteAssignment::Online { code, task_count } => {
            let graph = coordinator.fetch_tasks(filename, task_count)?;
            online_write(ctx, filename, size_mb, code, graph)
        }
        WriteAssignment::Offline {
            object_count,
            base_size_mb,
        } => {
            offline_write(ctx, filename, size_mb, object_count, base_size_mb)?;
            coordinator.finalize_offline(filename)
        }
    }
}

/// Encode `size_mb` of staged client packets into `n` fragment objects.
pub fn online_write(
    ctx: &PipelineContext,
    filename: &str,
    size_mb: usize,
    code: CodeParams,
    graph: TaskGraph,
) -> Result<()> {
    let CodeParams { n, k, w } = code;
    let layout = StripeLayout::new(n, k, ctx.packets_per_unit() * size_mb)?;

    // data symbols are all a stripe starts with
    graph.validate((0..k * w).map(|id| id as SymbolId))?;
    let outputs = graph.outputs();
    if let Some(id) = (k * w..n * w).map(|id| id as SymbolId).find(|id| !outputs.contains(id)) {
        return Err(Error::InvalidTaskGraph(format!(
            "encode graph for '{}' never produces parity symbol {}",
            filename, id
        )));
    }
    let engine = ComputeEngine::new(graph, ctx.packet_size(), w)?;

    info!(
        filename,
        n,
        k,
        w,
        packets = layout.total,
        stripes = layout.stripes(),
        "Online write"
    );

    // objects are created before any stage starts
    let streams = (0..n)
        .map(|fragment| {
            ObjectOutputStream::create(
                ctx.backend.clone(),
                &keys::object_name(filename, fragment),
                layout.declared(fragment),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let timeout = ctx.wait_timeout();
    thread::scope(|s| {
        let mut stages = Stages::new(s);

        let mut loads = Vec::with_capacity(k);
        for column in 0..k {
            let (tx, rx) = packet_queue(format!("load:{}", column));
            loads.push(rx);
            let range = KeyRange::new(filename, column, k, layout.data_packets(column));
            let pad = layout.pads(column);
            stages.spawn(format!("load-{}", column), move || {
                let mut store = ctx.connect_local()?;
                load_worker(store.as_mut(), &range, pad, timeout, &tx)?;
                Ok(())
            })?;
        }

        let mut outputs = Vec::with_capacity(n);
        for (fragment, stream) in streams.into_iter().enumerate() {
            let (tx, rx) = packet_queue(format!("persist:{}", fragment));
            outputs.push(tx);
            let metrics = ctx.metrics.clone();
            stages.spawn(format!("persist-{}", fragment), move || {
                metrics.add_persisted(stream.write_from(&rx)?);
                Ok(())
            })?;
        }

        let metrics = ctx.metrics.clone();
        stages.spawn("encode", move || {
            encode_stage(&engine, &layout, &loads, &outputs, &metrics)
        })?;

        stages.join()
    })?;

    ctx.notify_write_finish(filename)?;
    info!(filename, "Online write complete");
    Ok(())
}

/// One stripe per iteration: k packets in, n fragment packets out.
fn encode_stage(
    engine: &ComputeEngine,
    layout: &StripeLayout,
    loads: &[QueueRx],
    outputs: &[QueueTx],
    metrics: &Metrics,
) -> Result<()> {
    let mut stripe_ctx = engine.context()?;
    for stripe in 0..layout.stripes() {
        for (column, rx) in loads.iter().enumerate() {
            stripe_ctx.insert_packet(column, rx.pop()?)?;
        }
        for parity in layout.k..layout.n {
            stripe_ctx.reserve_packet(parity);
        }

        engine.run_stripe(&mut stripe_ctx)?;

        for (fragment, tx) in outputs.iter().enumerate() {
            let pkt = stripe_ctx.take_packet(fragment)?;
            if !layout.is_padding(stripe, fragment) {
                tx.push(pkt)?;
            }
        }
        stripe_ctx.clear();
        metrics.add_stripes(1);
    }
    Ok(())
}

/// Persist the file as `object_count` plain chunk objects.
pub fn offline_write(
    ctx: &PipelineContext,
    filename: &str,
    size_mb: usize,
    object_count: usize,
    base_size_mb: usize,
) -> Result<()> {
    let chunks = ChunkLayout::new(size_mb, object_count, base_size_mb, ctx.packets_per_unit())?;
    info!(filename, objects = chunks.len(), "Offline write");

    let streams = chunks
        .chunks
        .iter()
        .enumerate()
        .map(|(index, &(_, packets))| {
            ObjectOutputStream::create(
                ctx.backend.clone(),
                &keys::object_name(filename, index),
                packets,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let timeout = ctx.wait_timeout();
    thread::scope(|s| {
        let mut stages = Stages::new(s);
        for (index, (&(start, packets), stream)) in chunks.chunks.iter().zip(streams).enumerate() {
            let (tx, rx) = packet_queue(format!("chunk:{}", index));

            let range = KeyRange::contiguous(filename, start, packets);
            stages.spawn(format!("load-{}", index), move || {
                let mut store = ctx.connect_local()?;
                load_worker(store.as_mut(), &range, false, timeout, &tx)?;
                Ok(())
            })?;

            let metrics = ctx.metrics.clone();
            stages.spawn(format!("persist-{}", index), move || {
                metrics.add_persisted(stream.write_from(&rx)?);
                Ok(())
            })?;
        }
        stages.join()
    })?;

    ctx.notify_write_finish(filename)?;
    info!(filename, "Offline write complete");
    Ok(())
}
