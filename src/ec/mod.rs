//! Erasure Coding Module
//!
//! The generalized linear-network-coding evaluator used by every pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Erasure Coding Module                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │  │  Task Graph  │───▶│   Compute    │───▶│   GF(2^8) kernel          │  │
//! │  │  (task.rs)   │    │   Engine     │    │   (gf.rs)                 │  │
//! │  └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │         ▲                                                                │
//! │         │                                                                │
//! │  ┌──────────────┐                                                        │
//! │  │   Planner    │  Cauchy RS encode / decode graphs                      │
//! │  └──────────────┘                                                        │
//! │                                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Task Graph** (`task.rs`): ordered linear-combination steps over
//!   symbol ids, validated once at the trust boundary.
//! - **Compute Engine** (`engine.rs`): per-stripe symbol arena and the task
//!   executor. Encoding, decoding and partial repair are all just graphs.
//! - **GF kernel** (`gf.rs`): slice multiply-accumulate from
//!   `reed-solomon-erasure`, plus dense matrix helpers.
//! - **Planner** (`planner.rs`): builds the graphs a coordinator would send
//!   for a systematic Cauchy Reed-Solomon code.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ecworker::ec::{planner, ComputeEngine};
//!
//! let engine = ComputeEngine::new(planner::encode_graph(6, 4, 2)?, pkt_size, 2)?;
//! let mut ctx = engine.context()?;
//! for (i, pkt) in data_packets.into_iter().enumerate() {
//!     ctx.insert_packet(i, pkt)?;
//! }
//! for p in 4..6 {
//!     ctx.reserve_packet(p);
//! }
//! engine.run_stripe(&mut ctx)?;
//! let parity = ctx.take_packet(4)?;
//! ```

pub mod engine;
pub mod gf;
pub mod planner;
pub mod task;

#[cfg(test)]
mod proptest;

pub use engine::{ComputeEngine, StripeContext};
pub use task::{SymbolId, Task, TaskGraph, TaskRow};
