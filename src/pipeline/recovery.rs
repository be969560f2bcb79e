//! Peer-driven recovery pipelines
//!
//! A coordinator repairing a lost object splits the work across nodes:
//! survivors stage slices of their objects ([`disk_read`]), intermediate
//! nodes combine slices fetched from peers ([`fetch_compute`]) and the node
//! that will own the rebuilt object writes it ([`persist`]). Slices travel
//! through staging keys `stripe:cid:i`.

use std::thread;

use tracing::{debug, info, instrument, warn};

use super::{PipelineContext, Stages};
use crate::command::copies_for;
use crate::ec::{ComputeEngine, SymbolId, Task, TaskGraph};
use crate::error::{Error, Result};
use crate::io::{
    cache_worker, fetch_worker, select_cache_worker, KeyRange, ObjectInputStream,
    ObjectOutputStream,
};
use crate::queue::{packet_queue, QueueRx, QueueTx};
use crate::staging::{keys, Location};

fn slice_size(packet_size: usize, w: usize) -> Result<usize> {
    if w == 0 || packet_size % w != 0 {
        return Err(Error::InvalidEcConfig(format!(
            "w={} does not divide a {}-byte packet",
            w, packet_size
        )));
    }
    Ok(packet_size / w)
}

/// Spawn one fetch stage per source pulling `stripe:cid:0 .. packets-1`
/// from that source's staging store.
fn spawn_fetches<'scope, 'env>(
    ctx: &'env PipelineContext,
    stages: &mut Stages<'scope, 'env>,
    stripe: &str,
    packets: usize,
    sources: &'env [(usize, Location)],
) -> Result<Vec<QueueRx>> {
    let timeout = ctx.wait_timeout();
    let mut inputs = Vec::with_capacity(sources.len());
    for (cid, location) in sources {
        let (tx, rx) = packet_queue(format!("fetch:{}", cid));
        inputs.push(rx);
        let slice_keys: Vec<String> = (0..packets).map(|i| keys::slice(stripe, *cid, i)).collect();
        stages.spawn(format!("fetch-{}", cid), move || {
            let mut peer = ctx.connector.connect(location)?;
            fetch_worker(peer.as_mut(), &slice_keys, timeout, &tx)?;
            Ok(())
        })?;
    }
    Ok(inputs)
}

/// Read `object` as `packets · w` slices and stage the ones `columns` ask
/// for. A missing object ends the request quietly.
#[instrument(skip(ctx, columns, refs))]
pub fn disk_read(
    ctx: &PipelineContext,
    stripe: &str,
    object: &str,
    w: usize,
    packets: usize,
    columns: &[usize],
    refs: &[(usize, usize)],
) -> Result<()> {
    let unit = slice_size(ctx.packet_size(), w)?;
    let Some(stream) = ObjectInputStream::open(ctx.backend.clone(), object, unit)? else {
        warn!(object, "Object to read is absent, nothing staged");
        return Ok(());
    };
    let slices = packets * w;
    if stream.total_packets() < slices {
        return Err(Error::Backend {
            object: object.to_string(),
            reason: format!("holds {} slices, {} requested", stream.total_packets(), slices),
        });
    }

    let targets: Vec<(usize, usize)> = columns
        .iter()
        .map(|&cid| (cid, copies_for(refs, cid)))
        .collect();

    thread::scope(|s| {
        let mut stages = Stages::new(s);
        let (tx, rx) = packet_queue("slices");
        stages.spawn("read", move || {
            stream.read_into(&tx, slices)?;
            Ok(())
        })?;

        let targets = &targets;
        stages.spawn("select-cache", move || {
            let mut store = ctx.connect_local()?;
            let pushed = select_cache_worker(store.as_mut(), &rx, stripe, w, packets, targets)?;
            ctx.metrics.add_cached(pushed);
            debug!(stripe, pushed, "Slices staged");
            Ok(())
        })?;

        stages.join()
    })?;

    info!(stripe, object, slices, "Disk read staged");
    Ok(())
}

/// Fetch `packets` slices from each source and stage one linear combination
/// per `coefficients` entry at `stripe:cid:i`.
#[instrument(skip(ctx, sources, coefficients, refs))]
pub fn fetch_compute(
    ctx: &PipelineContext,
    stripe: &str,
    w: usize,
    packets: usize,
    sources: &[(usize, Location)],
    coefficients: &[(usize, Vec<u8>)],
    refs: &[(usize, usize)],
) -> Result<()> {
    let slice = slice_size(ctx.packet_size(), w)?;
    let nprev = sources.len();
    if nprev == 0 || coefficients.is_empty() {
        return Err(Error::Protocol(format!(
            "fetch-compute for '{}' needs sources and outputs",
            stripe
        )));
    }
    if let Some((cid, row)) = coefficients.iter().find(|(_, row)| row.len() != nprev) {
        return Err(Error::Protocol(format!(
            "output {} of '{}' has {} coefficients for {} sources",
            cid,
            stripe,
            row.len(),
            nprev
        )));
    }

    // inputs are symbols 0..nprev, output j is symbol nprev + j
    let children: Vec<SymbolId> = (0..nprev).map(|c| c as SymbolId).collect();
    let task = coefficients
        .iter()
        .enumerate()
        .fold(Task::new(children.clone()), |task, (j, (_, row))| {
            task.with_row((nprev + j) as SymbolId, row.clone())
        });
    let graph = TaskGraph::new(vec![task]);
    graph.validate(children)?;
    let engine = ComputeEngine::new(graph, slice, 1)?;

    thread::scope(|s| {
        let mut stages = Stages::new(s);
        let inputs = spawn_fetches(ctx, &mut stages, stripe, packets, sources)?;

        let mut outputs = Vec::with_capacity(coefficients.len());
        for (cid, _) in coefficients {
            let (tx, rx) = packet_queue(format!("combined:{}", cid));
            outputs.push(tx);
            let range = KeyRange::contiguous(format!("{}:{}", stripe, cid), 0, packets);
            let copies = copies_for(refs, *cid);
            stages.spawn(format!("cache-{}", cid), move || {
                let mut store = ctx.connect_local()?;
                ctx.metrics
                    .add_cached(cache_worker(store.as_mut(), &rx, &range, copies)?);
                Ok(())
            })?;
        }

        stages.spawn("combine", move || {
            let mut slice_ctx = engine.context()?;
            for _ in 0..packets {
                for (c, rx) in inputs.iter().enumerate() {
                    slice_ctx.insert_packet(c, rx.pop()?)?;
                }
                for j in 0..outputs.len() {
                    slice_ctx.reserve_packet(nprev + j);
                }
                engine.run_stripe(&mut slice_ctx)?;
                for (j, tx) in outputs.iter().enumerate() {
                    tx.push(slice_ctx.take_packet(nprev + j)?)?;
                }
                slice_ctx.clear();
                ctx.metrics.add_stripes(1);
            }
            Ok(())
        })?;

        stages.join()
    })?;

    info!(stripe, packets, outputs = coefficients.len(), "Fetch-compute staged");
    Ok(())
}

/// Fetch `packets` slices from each source and write them interleaved
/// (slice `i` of every source, in source order) as `object`.
#[instrument(skip(ctx, sources))]
pub fn persist(
    ctx: &PipelineContext,
    stripe: &str,
    object: &str,
    packets: usize,
    sources: &[(usize, Location)],
) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::Protocol(format!("persist of '{}' has no sources", object)));
    }
    let output = ObjectOutputStream::create(ctx.backend.clone(), object, packets * sources.len())?;

    thread::scope(|s| {
        let mut stages = Stages::new(s);
        let inputs = spawn_fetches(ctx, &mut stages, stripe, packets, sources)?;

        let (tx, rx) = packet_queue("interleave");
        stages.spawn("interleave", move || interleave(&inputs, packets, &tx))?;
        stages.spawn("persist", move || {
            ctx.metrics.add_persisted(output.write_from(&rx)?);
            Ok(())
        })?;

        stages.join()
    })?;

    ctx.notify_write_finish(object)?;
    info!(stripe, object, packets = packets * sources.len(), "Recovered object persisted");
    Ok(())
}

fn interleave(inputs: &[QueueRx], packets: usize, tx: &QueueTx) -> Result<()> {
    for _ in 0..packets {
        for rx in inputs {
            tx.push(rx.pop()?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn test_interleave_round_robins_sources() {
        let (tx_a, rx_a) = packet_queue("a");
        let (tx_b, rx_b) = packet_queue("b");
        for i in 0..2u8 {
            tx_a.push(Packet::from_slice(&[b'a', i])).unwrap();
            tx_b.push(Packet::from_slice(&[b'b', i])).unwrap();
        }

        let (tx, rx) = packet_queue("out");
        interleave(&[rx_a, rx_b], 2, &tx).unwrap();
        let order: Vec<Vec<u8>> = (0..4).map(|_| rx.pop().unwrap().data().to_vec()).collect();
        assert_eq!(order, vec![b"a\0".to_vec(), b"b\0".to_vec(), b"a\x01".to_vec(), b"b\x01".to_vec()]);
    }

    #[test]
    fn test_slice_size_must_divide() {
        assert_eq!(slice_size(8, 2).unwrap(), 4);
        assert!(slice_size(8, 3).is_err());
        assert!(slice_size(8, 0).is_err());
    }
}
