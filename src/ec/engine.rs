//! Stripe Compute Engine
//!
//! Evaluates a [`TaskGraph`] against the symbols of one stripe.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        StripeContext                            │
//! │                                                                 │
//! │  packet p ──split──▶ symbols p·w .. p·w+w-1   (BytesMut views)  │
//! │                                                                 │
//! │  ┌──────────┐   ┌──────────┐          ┌──────────┐              │
//! │  │  Task 0  │──▶│  Task 1  │── ... ──▶│  Task t  │              │
//! │  └──────────┘   └──────────┘          └──────────┘              │
//! │   children: read from the arena                                 │
//! │   targets:  taken out (or zero-allocated), overwritten, put back│
//! │                                                                 │
//! │  take_packet(p) ──unsplit──▶ packet p                           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Packets are split into `w` disjoint `BytesMut` views of one allocation,
//! so loading and re-assembling a canonical packet does not copy. Symbols
//! outside the canonical packets are scratch and are dropped by
//! [`StripeContext::clear`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use super::gf;
use super::task::{SymbolId, Task, TaskGraph};
use crate::error::{Error, Result};
use crate::packet::Packet;

// =============================================================================
// Stripe Context
// =============================================================================

/// Per-stripe symbol arena.
#[derive(Debug)]
pub struct StripeContext {
    /// Sub-packetization (symbols per packet)
    w: usize,
    /// Bytes per symbol
    symbol_size: usize,
    symbols: HashMap<SymbolId, BytesMut>,
}

impl StripeContext {
    /// Create an empty context for packets of `packet_size` bytes split into
    /// `w` symbols.
    pub fn new(packet_size: usize, w: usize) -> Result<Self> {
        if w == 0 {
            return Err(Error::InvalidEcConfig("w must be >= 1".into()));
        }
        if packet_size == 0 || packet_size % w != 0 {
            return Err(Error::InvalidEcConfig(format!(
                "packet size {} is not a positive multiple of w={}",
                packet_size, w
            )));
        }
        Ok(Self {
            w,
            symbol_size: packet_size / w,
            symbols: HashMap::new(),
        })
    }

    #[inline]
    pub fn w(&self) -> usize {
        self.w
    }

    #[inline]
    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }

    #[inline]
    pub fn packet_size(&self) -> usize {
        self.symbol_size * self.w
    }

    /// Ids of every symbol of packet `packet`.
    pub fn packet_symbols(&self, packet: usize) -> impl Iterator<Item = SymbolId> {
        let first = packet * self.w;
        (first..first + self.w).map(|id| id as SymbolId)
    }

    /// Register the symbols of an available packet.
    ///
    /// Short packets (including the empty padding marker) are zero-extended.
    /// A packet longer than the configured packet size means the sender and
    /// this worker disagree on packet size, and is rejected.
    pub fn insert_packet(&mut self, packet: usize, pkt: Packet) -> Result<()> {
        if pkt.len() > self.packet_size() {
            return Err(Error::Protocol(format!(
                "packet {} carries {} bytes, packet size is {}",
                packet,
                pkt.len(),
                self.packet_size()
            )));
        }
        self.split_packet(packet, pkt);
        Ok(())
    }

    /// Register a zero-filled packet whose symbols are task targets.
    pub fn reserve_packet(&mut self, packet: usize) {
        self.split_packet(packet, Packet::zeroed(self.packet_size()));
    }

    fn split_packet(&mut self, packet: usize, mut pkt: Packet) {
        pkt.pad_to(self.packet_size());
        let mut buf = pkt.into_inner();
        for id in self.packet_symbols(packet) {
            let symbol = buf.split_to(self.symbol_size);
            self.symbols.insert(id, symbol);
        }
    }

    pub fn contains(&self, id: SymbolId) -> bool {
        self.symbols.contains_key(&id)
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&[u8]> {
        self.symbols.get(&id).map(|b| &b[..])
    }

    /// Number of symbols currently held.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Remove the `w` symbols of packet `packet` and re-assemble them.
    pub fn take_packet(&mut self, packet: usize) -> Result<Packet> {
        let mut buf: Option<BytesMut> = None;
        for id in self.packet_symbols(packet) {
            let symbol = self.symbols.remove(&id).ok_or_else(|| {
                Error::Internal(format!("symbol {} of packet {} is not present", id, packet))
            })?;
            match buf.as_mut() {
                Some(b) => b.unsplit(symbol),
                None => buf = Some(symbol),
            }
        }
        Ok(Packet::new(buf.unwrap_or_default()))
    }

    /// Drop every remaining symbol (scratch and unused loads).
    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    /// Run one task: overwrite each target with its linear combination of
    /// the children.
    pub fn execute(&mut self, index: usize, task: &Task) -> Result<()> {
        if task.is_noop() {
            // an empty combination is zero
            let size = self.symbol_size;
            for target in task.targets() {
                self.symbols
                    .entry(target)
                    .or_insert_with(|| BytesMut::zeroed(size));
            }
            return Ok(());
        }

        if let Some(&missing) = task.children.iter().find(|c| !self.symbols.contains_key(*c)) {
            return Err(Error::MissingSymbol {
                symbol: missing,
                task: index,
            });
        }

        // Targets leave the arena while children are borrowed from it. A
        // target that is also a child gets a fresh buffer instead.
        let mut outputs: Vec<(SymbolId, BytesMut)> = Vec::with_capacity(task.rows.len());
        for row in &task.rows {
            let buf = if task.children.contains(&row.target) {
                None
            } else {
                self.symbols.remove(&row.target)
            };
            let buf = buf.unwrap_or_else(|| BytesMut::zeroed(self.symbol_size));
            outputs.push((row.target, buf));
        }

        {
            let mut inputs: Vec<&[u8]> = Vec::with_capacity(task.children.len());
            for child in &task.children {
                let buf = self.symbols.get(child).ok_or(Error::MissingSymbol {
                    symbol: *child,
                    task: index,
                })?;
                inputs.push(&buf[..]);
            }
            for ((_, out), row) in outputs.iter_mut().zip(&task.rows) {
                gf::linear_combination(out, &inputs, &row.coefficients);
            }
        }

        for (target, buf) in outputs {
            self.symbols.insert(target, buf);
        }
        Ok(())
    }
}

// =============================================================================
// Compute Engine
// =============================================================================

/// Runs one request's task graph on stripe after stripe.
#[derive(Debug, Clone)]
pub struct ComputeEngine {
    graph: Arc<TaskGraph>,
    packet_size: usize,
    w: usize,
}

impl ComputeEngine {
    /// Create an engine. The graph is shape-checked here; child
    /// availability is checked by the caller via [`TaskGraph::validate`].
    pub fn new(graph: TaskGraph, packet_size: usize, w: usize) -> Result<Self> {
        for (index, task) in graph.tasks().iter().enumerate() {
            task.check_shape(index)?;
        }
        // Reject bad packet_size / w up front
        StripeContext::new(packet_size, w)?;
        Ok(Self {
            graph: Arc::new(graph),
            packet_size,
            w,
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Fresh, empty stripe context sized for this engine.
    pub fn context(&self) -> Result<StripeContext> {
        StripeContext::new(self.packet_size, self.w)
    }

    /// Execute every task, in order, against `ctx`.
    pub fn run_stripe(&self, ctx: &mut StripeContext) -> Result<()> {
        for (index, task) in self.graph.tasks().iter().enumerate() {
            ctx.execute(index, task)?;
        }
        trace!(symbols = ctx.len(), "stripe computed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::gf::mul;
    use assert_matches::assert_matches;

    fn pkt(bytes: &[u8]) -> Packet {
        Packet::from_slice(bytes)
    }

    #[test]
    fn test_insert_and_take_packet() {
        let mut ctx = StripeContext::new(4, 2).unwrap();
        ctx.insert_packet(3, pkt(&[1, 2, 3, 4])).unwrap();

        assert_eq!(ctx.symbol(6), Some(&[1u8, 2][..]));
        assert_eq!(ctx.symbol(7), Some(&[3u8, 4][..]));
        assert_eq!(ctx.take_packet(3).unwrap().data(), &[1, 2, 3, 4]);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_short_packet_is_zero_padded() {
        let mut ctx = StripeContext::new(4, 2).unwrap();
        ctx.insert_packet(0, Packet::empty()).unwrap();
        assert_eq!(ctx.symbol(0), Some(&[0u8, 0][..]));
        assert_eq!(ctx.symbol(1), Some(&[0u8, 0][..]));
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let mut ctx = StripeContext::new(4, 2).unwrap();
        assert_matches!(
            ctx.insert_packet(0, pkt(&[1, 2, 3, 4, 5])),
            Err(Error::Protocol(_))
        );
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_childless_task_zeroes_its_targets() {
        let graph = TaskGraph::new(vec![Task::new(vec![]).with_row(3, vec![])]);
        let engine = ComputeEngine::new(graph, 2, 1).unwrap();
        let mut ctx = engine.context().unwrap();
        ctx.insert_packet(0, pkt(&[7, 7])).unwrap();

        engine.run_stripe(&mut ctx).unwrap();
        assert_eq!(ctx.symbol(3), Some(&[0u8, 0][..]));
        assert_eq!(ctx.symbol(0), Some(&[7u8, 7][..]));
    }

    #[test]
    fn test_context_rejects_bad_geometry() {
        assert!(StripeContext::new(10, 3).is_err());
        assert!(StripeContext::new(8, 0).is_err());
        assert!(StripeContext::new(0, 1).is_err());
    }

    #[test]
    fn test_tasks_compose_in_order() {
        // T1: X = A + B ; T2: Y = A + 2·X
        let (a, b, x, y) = (0, 1, 10, 11);
        let graph = TaskGraph::new(vec![
            Task::new(vec![a, b]).with_row(x, vec![1, 1]),
            Task::new(vec![a, x]).with_row(y, vec![1, 2]),
        ]);
        let engine = ComputeEngine::new(graph, 2, 1).unwrap();
        let mut ctx = engine.context().unwrap();
        ctx.insert_packet(0, pkt(&[3, 5])).unwrap();
        ctx.insert_packet(1, pkt(&[6, 9])).unwrap();

        engine.run_stripe(&mut ctx).unwrap();

        let xs: Vec<u8> = (0..2).map(|i| [3u8, 5][i] ^ [6u8, 9][i]).collect();
        let ys: Vec<u8> = (0..2).map(|i| [3u8, 5][i] ^ mul(2, xs[i])).collect();
        assert_eq!(ctx.symbol(x).unwrap(), &xs[..]);
        assert_eq!(ctx.symbol(y).unwrap(), &ys[..]);
    }

    #[test]
    fn test_missing_child_aborts() {
        let graph = TaskGraph::new(vec![Task::new(vec![0, 5]).with_row(9, vec![1, 1])]);
        let engine = ComputeEngine::new(graph, 2, 1).unwrap();
        let mut ctx = engine.context().unwrap();
        ctx.insert_packet(0, pkt(&[1, 1])).unwrap();

        assert_matches!(
            engine.run_stripe(&mut ctx),
            Err(Error::MissingSymbol { symbol: 5, task: 0 })
        );
    }

    #[test]
    fn test_target_overwrites_existing_symbol() {
        // packet 1 is reserved as a target but carries stale bytes
        let graph = TaskGraph::new(vec![Task::new(vec![0]).with_row(1, vec![1])]);
        let engine = ComputeEngine::new(graph, 2, 1).unwrap();
        let mut ctx = engine.context().unwrap();
        ctx.insert_packet(0, pkt(&[4, 4])).unwrap();
        ctx.insert_packet(1, pkt(&[0xff, 0xff])).unwrap();

        engine.run_stripe(&mut ctx).unwrap();
        assert_eq!(ctx.take_packet(1).unwrap().data(), &[4, 4]);
    }

    #[test]
    fn test_target_that_is_also_a_child() {
        // A = A + B reads the old A
        let graph = TaskGraph::new(vec![Task::new(vec![0, 1]).with_row(0, vec![1, 1])]);
        let engine = ComputeEngine::new(graph, 1, 1).unwrap();
        let mut ctx = engine.context().unwrap();
        ctx.insert_packet(0, pkt(&[0b1100])).unwrap();
        ctx.insert_packet(1, pkt(&[0b1010])).unwrap();

        engine.run_stripe(&mut ctx).unwrap();
        assert_eq!(ctx.symbol(0).unwrap(), &[0b0110]);
    }

    #[test]
    fn test_rerun_is_bit_identical() {
        let graph = TaskGraph::new(vec![
            Task::new(vec![0, 1, 2, 3]).with_row(4, vec![7, 1, 9, 200]),
            Task::new(vec![4, 0]).with_row(5, vec![3, 3]),
        ]);
        let engine = ComputeEngine::new(graph, 8, 2).unwrap();

        let run = || {
            let mut ctx = engine.context().unwrap();
            ctx.insert_packet(0, pkt(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
            ctx.insert_packet(1, pkt(&[8, 7, 6, 5, 4, 3, 2, 1])).unwrap();
            engine.run_stripe(&mut ctx).unwrap();
            (ctx.symbol(4).unwrap().to_vec(), ctx.symbol(5).unwrap().to_vec())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_engine_rejects_ragged_task() {
        let graph = TaskGraph::new(vec![Task::new(vec![0, 1]).with_row(2, vec![1, 1, 1])]);
        assert_matches!(ComputeEngine::new(graph, 2, 1), Err(Error::InvalidTaskGraph(_)));
    }
}
