//! Read pipelines
//!
//! Every read ends the same way: the file's packets, in order, on the
//! client-visible keys `filename:0 .. filename:total-1`. How they get there
//! depends on the file's redundancy mode and on which objects survive.

use std::collections::BTreeSet;
use std::thread;

use bytes::BytesMut;
use tracing::{debug, info, instrument, warn};

use super::{ChunkLayout, PipelineContext, Stages, StripeLayout};
use crate::coordinator::{CodeParams, CoordinatorClient, OfflineRecovery, RedundancyMode};
use crate::ec::{ComputeEngine, SymbolId, TaskGraph};
use crate::error::{Error, Result};
use crate::io::{cache_worker, fetch_worker, KeyRange, ObjectInputStream};
use crate::metrics::Metrics;
use crate::packet::Packet;
use crate::queue::{packet_queue, QueueRx, QueueTx};
use crate::staging::{keys, Location};

/// Handle a client read: fetch the file's metadata, publish its size and
/// serve it.
#[instrument(skip(ctx))]
pub fn client_read(ctx: &PipelineContext, filename: &str) -> Result<()> {
    let mut coordinator = ctx.coordinator()?;
    let meta = coordinator.file_meta(filename)?;
    ctx.publish_file_size(filename, meta.size_mb)?;

    match (meta.mode, meta.code) {
        (RedundancyMode::Online, Some(code)) => {
            read_online(ctx, &mut coordinator, filename, meta.size_mb, code)
        }
        (RedundancyMode::Online, None) => Err(Error::Protocol(format!(
            "online file '{}' has no code parameters",
            filename
        ))),
        (RedundancyMode::Offline, _) => {
            read_offline(ctx, &mut coordinator, filename, meta.size_mb)
        }
    }
}

// =============================================================================
// Online
// =============================================================================

/// Serve an online file from its fragment objects.
pub fn read_online(
    ctx: &PipelineContext,
    coordinator: &mut CoordinatorClient,
    filename: &str,
    size_mb: usize,
    code: CodeParams,
) -> Result<()> {
    let CodeParams { n, k, w } = code;
    let layout = StripeLayout::new(n, k, ctx.packets_per_unit() * size_mb)?;
    let mut streams = probe_fragments(ctx, filename, n)?;

    // a fragment shorter than its layout says is as good as gone
    for (fragment, slot) in streams.iter_mut().enumerate() {
        let short = slot
            .as_ref()
            .is_some_and(|s| s.total_packets() < layout.declared(fragment));
        if short {
            warn!(filename, fragment, "Fragment is short, treating it as lost");
            *slot = None;
        }
    }

    let missing: Vec<usize> = (0..k).filter(|&c| streams[c].is_none()).collect();
    if missing.is_empty() {
        info!(filename, packets = layout.total, "Online read");
        return fast_read(ctx, filename, &layout, streams);
    }

    info!(filename, ?missing, "Online read is degraded");
    ctx.metrics.degraded_read(RedundancyMode::Online.as_str());
    let (plan, graph) = coordinator.degraded_online(filename, &missing)?;
    degraded_read(ctx, filename, &layout, w, streams, &plan.load, &missing, graph)
}

/// Existence-probe all `n` fragment objects at once.
fn probe_fragments(
    ctx: &PipelineContext,
    filename: &str,
    n: usize,
) -> Result<Vec<Option<ObjectInputStream>>> {
    thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|fragment| {
                let backend = ctx.backend.clone();
                let object = keys::object_name(filename, fragment);
                let unit = ctx.packet_size();
                s.spawn(move || ObjectInputStream::open(backend, &object, unit))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(fragment, handle)| {
                handle.join().map_err(|_| Error::StagePanicked {
                    stage: format!("probe-{}", fragment),
                })?
            })
            .collect()
    })
}

/// All data fragments are present: interleave them back into file order.
fn fast_read(
    ctx: &PipelineContext,
    filename: &str,
    layout: &StripeLayout,
    mut streams: Vec<Option<ObjectInputStream>>,
) -> Result<()> {
    thread::scope(|s| {
        let mut stages = Stages::new(s);

        let mut loads = Vec::with_capacity(layout.k);
        for (column, stream) in streams.drain(..layout.k).enumerate() {
            let stream = stream.ok_or_else(|| {
                Error::Internal(format!("data fragment {} vanished", column))
            })?;
            let (tx, rx) = packet_queue(format!("read:{}", column));
            loads.push(rx);
            let limit = layout.data_packets(column);
            stages.spawn(format!("read-{}", column), move || {
                stream.read_into(&tx, limit)?;
                Ok(())
            })?;
        }

        let layout = *layout;
        stages.spawn("cache", move || {
            let mut store = ctx.connect_local()?;
            let mut index = 0;
            for stripe in 0..layout.stripes() {
                for (column, rx) in loads.iter().enumerate() {
                    if layout.is_padding(stripe, column) {
                        continue;
                    }
                    let pkt = rx.pop()?;
                    store.push(&keys::packet(filename, index), pkt.encode(), 1)?;
                    index += 1;
                }
            }
            store.sync()?;
            ctx.metrics.add_cached(index);
            Ok(())
        })?;

        stages.join()
    })?;

    info!(filename, "Online read complete");
    Ok(())
}

fn fragment_symbols(fragment: usize, w: usize) -> impl Iterator<Item = SymbolId> {
    (fragment * w..(fragment + 1) * w).map(|id| id as SymbolId)
}

/// Some data fragments are gone: rebuild them stripe by stripe.
#[allow(clippy::too_many_arguments)]
fn degraded_read(
    ctx: &PipelineContext,
    filename: &str,
    layout: &StripeLayout,
    w: usize,
    mut streams: Vec<Option<ObjectInputStream>>,
    plan_load: &[usize],
    missing: &[usize],
    graph: TaskGraph,
) -> Result<()> {
    // healthy data columns are forwarded even if the plan does not use them
    let mut columns: BTreeSet<usize> = plan_load.iter().copied().collect();
    columns.extend((0..layout.k).filter(|&c| streams[c].is_some()));

    let mut loads = Vec::with_capacity(columns.len());
    for &fragment in &columns {
        let stream = streams
            .get_mut(fragment)
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "recovery plan for '{}' loads unavailable fragment {}",
                    filename, fragment
                ))
            })?;
        loads.push((fragment, stream));
    }

    graph.validate(columns.iter().flat_map(|&f| fragment_symbols(f, w)))?;
    let outputs = graph.outputs();
    if let Some(lost) = missing
        .iter()
        .flat_map(|&f| fragment_symbols(f, w))
        .find(|id| !outputs.contains(id))
    {
        return Err(Error::InvalidTaskGraph(format!(
            "recovery graph for '{}' never produces symbol {}",
            filename, lost
        )));
    }
    let engine = ComputeEngine::new(graph, ctx.packet_size(), w)?;
    debug!(filename, ?columns, "Recovery plan accepted");

    thread::scope(|s| {
        let mut stages = Stages::new(s);

        let mut inputs = Vec::with_capacity(loads.len());
        for (fragment, stream) in loads {
            let (tx, rx) = packet_queue(format!("read:{}", fragment));
            inputs.push((fragment, rx));
            let limit = layout.declared(fragment);
            stages.spawn(format!("read-{}", fragment), move || {
                stream.read_into(&tx, limit)?;
                Ok(())
            })?;
        }

        let (tx, rx) = packet_queue("decoded");
        let metrics = ctx.metrics.clone();
        let layout = *layout;
        stages.spawn("decode", move || {
            decode_stage(&engine, &layout, &inputs, missing, &tx, &metrics)
        })?;

        let range = KeyRange::contiguous(filename, 0, layout.total);
        stages.spawn("cache", move || {
            let mut store = ctx.connect_local()?;
            ctx.metrics.add_cached(cache_worker(store.as_mut(), &rx, &range, 1)?);
            Ok(())
        })?;

        stages.join()
    })?;

    info!(filename, "Degraded online read complete");
    Ok(())
}

/// Rebuild each stripe and emit its data packets in file order.
fn decode_stage(
    engine: &ComputeEngine,
    layout: &StripeLayout,
    inputs: &[(usize, QueueRx)],
    missing: &[usize],
    tx: &QueueTx,
    metrics: &Metrics,
) -> Result<()> {
    let mut stripe_ctx = engine.context()?;
    for stripe in 0..layout.stripes() {
        for (fragment, rx) in inputs {
            // data fragments end early in a partial last stripe
            let pkt = if layout.is_padding(stripe, *fragment) {
                Packet::empty()
            } else {
                rx.pop()?
            };
            stripe_ctx.insert_packet(*fragment, pkt)?;
        }
        for &lost in missing {
            stripe_ctx.reserve_packet(lost);
        }

        engine.run_stripe(&mut stripe_ctx)?;

        for column in 0..layout.k {
            if !layout.is_padding(stripe, column) {
                tx.push(stripe_ctx.take_packet(column)?)?;
            }
        }
        stripe_ctx.clear();
        metrics.add_stripes(1);
    }
    Ok(())
}

// =============================================================================
// Offline
// =============================================================================

/// How one offline object reaches the client.
enum ObjectSource {
    Healthy(ObjectInputStream),
    Recompute {
        engine: ComputeEngine,
        lost: usize,
        siblings: Vec<(usize, ObjectInputStream)>,
    },
    Remote {
        stripe: String,
        sources: Vec<(usize, Location)>,
    },
}

/// Serve an offline file object by object, recovering the lost ones.
pub fn read_offline(
    ctx: &PipelineContext,
    coordinator: &mut CoordinatorClient,
    filename: &str,
    size_mb: usize,
) -> Result<()> {
    let object_layout = coordinator.offline_layout(filename)?;
    let chunks = ChunkLayout::new(
        size_mb,
        object_layout.object_count,
        object_layout.base_size_mb,
        ctx.packets_per_unit(),
    )?;
    info!(filename, objects = chunks.len(), "Offline read");

    // plans are negotiated one object at a time before anything runs
    let mut sources = Vec::with_capacity(chunks.len());
    for (index, (&healthy, &(_, packets))) in object_layout
        .integrity
        .iter()
        .zip(&chunks.chunks)
        .enumerate()
    {
        let object = keys::object_name(filename, index);
        let source = if healthy {
            healthy_source(ctx, &object, packets)?
        } else {
            warn!(object = %object, "Object lost, requesting recovery plan");
            ctx.metrics.degraded_read(RedundancyMode::Offline.as_str());
            match coordinator.degraded_offline(filename, &object)? {
                OfflineRecovery::LocalRecompute {
                    lost,
                    code,
                    loads,
                    graph,
                } => recompute_source(ctx, &object, lost, code, &loads, graph)?,
                OfflineRecovery::RemoteSlice { stripe, sources } => {
                    if ctx.packet_size() % sources.len() != 0 {
                        return Err(Error::Protocol(format!(
                            "{} slice sources do not divide a {}-byte packet",
                            sources.len(),
                            ctx.packet_size()
                        )));
                    }
                    ObjectSource::Remote { stripe, sources }
                }
            }
        };
        sources.push(source);
    }

    thread::scope(|s| {
        let mut stages = Stages::new(s);
        for (index, (source, &(start, packets))) in
            sources.into_iter().zip(&chunks.chunks).enumerate()
        {
            let (tx, rx) = packet_queue(format!("object:{}", index));
            spawn_object_source(ctx, &mut stages, index, source, packets, tx)?;

            let range = KeyRange::contiguous(filename, start, packets);
            stages.spawn(format!("cache-{}", index), move || {
                let mut store = ctx.connect_local()?;
                ctx.metrics.add_cached(cache_worker(store.as_mut(), &rx, &range, 1)?);
                Ok(())
            })?;
        }
        stages.join()
    })?;

    info!(filename, "Offline read complete");
    Ok(())
}

fn healthy_source(ctx: &PipelineContext, object: &str, packets: usize) -> Result<ObjectSource> {
    let stream = ObjectInputStream::open(ctx.backend.clone(), object, ctx.packet_size())?
        .ok_or_else(|| Error::ObjectNotFound(object.to_string()))?;
    if stream.total_packets() < packets {
        return Err(Error::Backend {
            object: object.to_string(),
            reason: format!(
                "holds {} packets, layout expects {}",
                stream.total_packets(),
                packets
            ),
        });
    }
    Ok(ObjectSource::Healthy(stream))
}

fn recompute_source(
    ctx: &PipelineContext,
    object: &str,
    lost: usize,
    code: CodeParams,
    loads: &[(usize, String)],
    graph: TaskGraph,
) -> Result<ObjectSource> {
    let w = code.w;
    let mut siblings = Vec::with_capacity(loads.len());
    for (fragment, name) in loads {
        let stream = ObjectInputStream::open(ctx.backend.clone(), name, ctx.packet_size())?
            .ok_or_else(|| Error::ObjectNotFound(name.clone()))?;
        siblings.push((*fragment, stream));
    }

    graph.validate(siblings.iter().flat_map(|(f, _)| fragment_symbols(*f, w)))?;
    let outputs = graph.outputs();
    if !fragment_symbols(lost, w).all(|id| outputs.contains(&id)) {
        return Err(Error::InvalidTaskGraph(format!(
            "recovery graph for '{}' does not rebuild fragment {}",
            object, lost
        )));
    }

    Ok(ObjectSource::Recompute {
        engine: ComputeEngine::new(graph, ctx.packet_size(), w)?,
        lost,
        siblings,
    })
}

/// Start the stages producing one object's `packets` packets into `tx`.
fn spawn_object_source<'scope, 'env>(
    ctx: &'env PipelineContext,
    stages: &mut Stages<'scope, 'env>,
    index: usize,
    source: ObjectSource,
    packets: usize,
    tx: QueueTx,
) -> Result<()> {
    match source {
        ObjectSource::Healthy(stream) => stages.spawn(format!("read-{}", index), move || {
            stream.read_into(&tx, packets)?;
            Ok(())
        }),

        ObjectSource::Recompute {
            engine,
            lost,
            siblings,
        } => {
            let mut inputs = Vec::with_capacity(siblings.len());
            for (fragment, stream) in siblings {
                let (sibling_tx, rx) = packet_queue(format!("sibling:{}:{}", index, fragment));
                // siblings of another size are cut or zero-extended
                let available = stream.total_packets().min(packets);
                inputs.push((fragment, rx, available));
                stages.spawn(format!("read-{}-{}", index, fragment), move || {
                    stream.read_into(&sibling_tx, packets)?;
                    Ok(())
                })?;
            }

            let metrics = ctx.metrics.clone();
            stages.spawn(format!("recompute-{}", index), move || {
                let mut stripe_ctx = engine.context()?;
                for packet in 0..packets {
                    for (fragment, rx, available) in &inputs {
                        let pkt = if packet < *available {
                            rx.pop()?
                        } else {
                            Packet::empty()
                        };
                        stripe_ctx.insert_packet(*fragment, pkt)?;
                    }
                    stripe_ctx.reserve_packet(lost);
                    engine.run_stripe(&mut stripe_ctx)?;
                    tx.push(stripe_ctx.take_packet(lost)?)?;
                    stripe_ctx.clear();
                    metrics.add_stripes(1);
                }
                Ok(())
            })
        }

        ObjectSource::Remote { stripe, sources } => {
            let mut inputs = Vec::with_capacity(sources.len());
            for (cid, location) in sources {
                let (fetch_tx, rx) = packet_queue(format!("slice:{}:{}", stripe, cid));
                inputs.push(rx);
                let slice_keys: Vec<String> =
                    (0..packets).map(|j| keys::slice(&stripe, cid, j)).collect();
                let timeout = ctx.wait_timeout();
                stages.spawn(format!("fetch-{}-{}", index, cid), move || {
                    let mut peer = ctx.connector.connect(&location)?;
                    fetch_worker(peer.as_mut(), &slice_keys, timeout, &fetch_tx)?;
                    Ok(())
                })?;
            }

            let packet_size = ctx.packet_size();
            stages.spawn(format!("assemble-{}", index), move || {
                assemble_slices(&inputs, packets, packet_size, &tx)
            })
        }
    }
}

/// Rebuild each packet from one slice per source, in source order.
fn assemble_slices(
    inputs: &[QueueRx],
    packets: usize,
    packet_size: usize,
    tx: &QueueTx,
) -> Result<()> {
    if let [only] = inputs {
        for _ in 0..packets {
            tx.push(only.pop()?)?;
        }
        return Ok(());
    }

    let slice = packet_size / inputs.len();
    for _ in 0..packets {
        let mut buf = BytesMut::with_capacity(packet_size);
        for rx in inputs {
            let mut part = rx.pop()?;
            part.pad_to(slice);
            buf.extend_from_slice(&part.data()[..slice]);
        }
        tx.push(Packet::new(buf))?;
    }
    Ok(())
}
