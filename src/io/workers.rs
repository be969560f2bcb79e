//! Staging-store adapter stages
//!
//! Each function here is the body of one pipeline thread. They take a
//! connection opened by that thread and the queue endpoint(s) it owns, and
//! return the number of packets they moved.

use std::time::Duration;

use tracing::trace;

use crate::error::Result;
use crate::packet::Packet;
use crate::queue::{QueueRx, QueueTx};
use crate::staging::{keys, StagingStore};

/// Keys `base:(start + i·step)` for `i` in `0..count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub base: String,
    pub start: usize,
    pub step: usize,
    pub count: usize,
}

impl KeyRange {
    pub fn new(base: impl Into<String>, start: usize, step: usize, count: usize) -> Self {
        Self {
            base: base.into(),
            start,
            step,
            count,
        }
    }

    /// `base:start`, `base:start+1`, ...
    pub fn contiguous(base: impl Into<String>, start: usize, count: usize) -> Self {
        Self::new(base, start, 1, count)
    }

    pub fn key(&self, i: usize) -> String {
        keys::packet(&self.base, self.start + i * self.step)
    }

    pub fn keys(&self) -> Vec<String> {
        (0..self.count).map(|i| self.key(i)).collect()
    }
}

/// Pop framed packets at `keys` (in order) into `tx`.
///
/// Requests are pipelined ahead of replies where the store supports it.
pub fn fetch_worker(
    store: &mut dyn StagingStore,
    keys: &[String],
    timeout: Option<Duration>,
    tx: &QueueTx,
) -> Result<usize> {
    store.pop_pipelined(keys, timeout, &mut |raw| tx.push(Packet::decode(&raw)?))?;
    trace!(queue = tx.label(), packets = keys.len(), "Fetch complete");
    Ok(keys.len())
}

/// Pop the packets of `range` into `tx`, then one empty marker if `pad`.
pub fn load_worker(
    store: &mut dyn StagingStore,
    range: &KeyRange,
    pad: bool,
    timeout: Option<Duration>,
    tx: &QueueTx,
) -> Result<usize> {
    let loaded = fetch_worker(store, &range.keys(), timeout, tx)?;
    if pad {
        tx.push(Packet::empty())?;
    }
    Ok(loaded)
}

/// Push `range.count` packets from `rx` to the keys of `range`, each one
/// `copies` times.
pub fn cache_worker(
    store: &mut dyn StagingStore,
    rx: &QueueRx,
    range: &KeyRange,
    copies: usize,
) -> Result<usize> {
    for i in 0..range.count {
        let pkt = rx.pop()?;
        store.push(&range.key(i), pkt.encode(), copies)?;
    }
    store.sync()?;
    trace!(base = %range.base, packets = range.count, "Cache complete");
    Ok(range.count)
}

/// Route packet slices to the columns that asked for them.
///
/// `rx` yields `packets · w` slices, slice `j` of packet `i` at position
/// `i·w + j`. For each requested `(cid, copies)` with `cid mod w == j`, the
/// slice goes to `stripe:cid:i`. Slices nobody asked for are dropped.
pub fn select_cache_worker(
    store: &mut dyn StagingStore,
    rx: &QueueRx,
    stripe: &str,
    w: usize,
    packets: usize,
    targets: &[(usize, usize)],
) -> Result<usize> {
    let mut pushed = 0;
    for i in 0..packets {
        for j in 0..w {
            let slice = rx.pop()?;
            let mut frame = None;
            for &(cid, copies) in targets.iter().filter(|(cid, _)| cid % w == j) {
                let value = frame.get_or_insert_with(|| slice.encode()).clone();
                store.push(&keys::slice(stripe, cid, i), value, copies)?;
                pushed += 1;
            }
        }
    }
    store.sync()?;
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::packet_queue;
    use crate::staging::{Location, MemoryCluster, StagingConnector};
    use bytes::Bytes;

    #[test]
    fn test_key_range() {
        let strided = KeyRange::new("f", 1, 4, 3);
        assert_eq!(strided.keys(), vec!["f:1", "f:5", "f:9"]);
        assert_eq!(KeyRange::contiguous("g", 10, 2).keys(), vec!["g:10", "g:11"]);
    }

    #[test]
    fn test_load_worker_strided_with_padding() {
        let cluster = MemoryCluster::new();
        let loc = Location::from("node");
        let mut store = cluster.connect(&loc).unwrap();
        for i in 0..10u8 {
            store
                .push(&format!("file:{}", i), Packet::from_slice(&[i]).encode(), 1)
                .unwrap();
        }

        let (tx, rx) = packet_queue("load:1");
        let n = load_worker(store.as_mut(), &KeyRange::new("file", 1, 4, 2), true, None, &tx).unwrap();
        assert_eq!(n, 2);
        assert_eq!(rx.pop().unwrap().data(), &[1]);
        assert_eq!(rx.pop().unwrap().data(), &[5]);
        assert!(rx.pop().unwrap().is_empty());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_fetch_rejects_unframed_value() {
        let cluster = MemoryCluster::new();
        let mut store = cluster.connect(&Location::from("n")).unwrap();
        store.push("bad:0", Bytes::from_static(&[0, 0]), 1).unwrap();

        let (tx, _rx) = packet_queue("fetch");
        assert!(fetch_worker(store.as_mut(), &["bad:0".to_string()], None, &tx).is_err());
    }

    #[test]
    fn test_cache_worker_replicates() {
        let cluster = MemoryCluster::new();
        let loc = Location::from("n");
        let mut store = cluster.connect(&loc).unwrap();

        let (tx, rx) = packet_queue("cache");
        tx.push(Packet::from_slice(b"a")).unwrap();
        tx.push(Packet::from_slice(b"b")).unwrap();
        cache_worker(store.as_mut(), &rx, &KeyRange::contiguous("out", 4, 2), 2).unwrap();

        let node = cluster.node(&loc);
        assert_eq!(node.len("out:4"), 2);
        assert_eq!(node.len("out:5"), 2);
        assert_eq!(Packet::decode(&node.pop("out:5", None).unwrap()).unwrap().data(), b"b");
    }

    #[test]
    fn test_select_cache_routes_by_column() {
        let cluster = MemoryCluster::new();
        let loc = Location::from("n");
        let mut store = cluster.connect(&loc).unwrap();

        // 2 packets, w = 2: slices p0s0 p0s1 p1s0 p1s1
        let (tx, rx) = packet_queue("select");
        for tag in [b"00", b"01", b"10", b"11"] {
            tx.push(Packet::from_slice(tag)).unwrap();
        }
        // column 3 wants slice 1, column 4 wants slice 0 twice
        let pushed =
            select_cache_worker(store.as_mut(), &rx, "s", 2, 2, &[(3, 1), (4, 2)]).unwrap();
        assert_eq!(pushed, 4);

        let node = cluster.node(&loc);
        let take = |key: &str| Packet::decode(&node.pop(key, None).unwrap()).unwrap();
        assert_eq!(take("s:3:0").data(), b"01");
        assert_eq!(take("s:3:1").data(), b"11");
        assert_eq!(node.len("s:4:0"), 2);
        assert_eq!(take("s:4:1").data(), b"10");
    }
}
