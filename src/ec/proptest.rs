//! Property-Based Tests for the Compute Engine
//!
//! # Test Properties
//!
//! 1. **Fault Tolerance**: any `k` survivors rebuild every lost fragment
//! 2. **Determinism**: the same stripe and graph give the same bytes
//! 3. **Framing**: packets survive the staging wire frame

#![cfg(test)]

use proptest::prelude::*;

use super::engine::ComputeEngine;
use super::planner::{decode_plan, encode_graph};
use crate::packet::Packet;

// =============================================================================
// Property Strategies
// =============================================================================

/// (n, k, w) with k in 1..=5, m in 0..=3, w in 1..=4.
fn code_strategy() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..=5, 0usize..=3, 1usize..=4).prop_map(|(k, m, w)| (k + m, k, w))
}

/// Which fragments to lose: a subset of at most `m` indices.
fn erasure_strategy(n: usize, m: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..n, 0..=m).prop_map(|mut v| {
        v.sort_unstable();
        v.dedup();
        v
    })
}

fn encode_stripe(n: usize, k: usize, w: usize, data: &[Vec<u8>]) -> Vec<Packet> {
    let symbol = data[0].len() / w;
    let engine = ComputeEngine::new(encode_graph(n, k, w).unwrap(), symbol * w, w).unwrap();
    let mut ctx = engine.context().unwrap();
    for (i, d) in data.iter().enumerate() {
        ctx.insert_packet(i, Packet::from_slice(d)).unwrap();
    }
    for p in k..n {
        ctx.reserve_packet(p);
    }
    engine.run_stripe(&mut ctx).unwrap();
    (0..n).map(|i| ctx.take_packet(i).unwrap()).collect()
}

// =============================================================================
// Recovery Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: losing up to m fragments is always recoverable.
    #[test]
    fn prop_recover_any_erasures(
        ((n, k, w), erasures, symbol, seed) in code_strategy().prop_flat_map(|(n, k, w)| {
            (Just((n, k, w)), erasure_strategy(n, n - k), 1usize..=16, any::<u8>())
        })
    ) {
        let size = symbol * w;
        let data: Vec<Vec<u8>> = (0..k)
            .map(|c| (0..size).map(|i| seed ^ (c as u8).wrapping_mul(17) ^ (i as u8)).collect())
            .collect();
        let coded = encode_stripe(n, k, w, &data);

        // systematic: data fragments pass through unchanged
        for c in 0..k {
            prop_assert_eq!(coded[c].data(), &data[c][..]);
        }

        if erasures.is_empty() {
            return Ok(());
        }

        let survivors: Vec<usize> = (0..n).filter(|i| !erasures.contains(i)).collect();
        let plan = decode_plan(n, k, w, &survivors, &erasures)?;
        let engine = ComputeEngine::new(plan.graph, size, w)?;
        let mut ctx = engine.context()?;
        for &l in &plan.load {
            ctx.insert_packet(l, coded[l].clone())?;
        }
        engine.run_stripe(&mut ctx)?;

        for &lost in &erasures {
            let rebuilt = ctx.take_packet(lost)?;
            prop_assert_eq!(rebuilt.data(), coded[lost].data());
        }
    }

    /// Property: encoding the same stripe twice is bit-identical.
    #[test]
    fn prop_encode_deterministic(
        (n, k, w) in code_strategy(),
        bytes in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let size = w * 8;
        let data: Vec<Vec<u8>> = (0..k)
            .map(|c| (0..size).map(|i| bytes[(i + c) % bytes.len()]).collect())
            .collect();

        prop_assert_eq!(encode_stripe(n, k, w, &data), encode_stripe(n, k, w, &data));
    }

    /// Property: framing then unframing a payload is the identity.
    #[test]
    fn prop_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let pkt = Packet::from_slice(&payload);
        let decoded = Packet::decode(&pkt.encode())?;
        prop_assert_eq!(decoded.is_empty(), payload.is_empty());
        prop_assert_eq!(decoded, pkt);
    }
}
