//! In-memory staging store
//!
//! A keyed list store guarded by one mutex and condition variable. Used
//! directly by tests and as the backing store of [`super::StagingServer`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::{Location, StagingConnector, StagingStore};
use crate::error::{Error, Result};

/// Keyed FIFO lists with blocking pop.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    lists: Mutex<HashMap<String, VecDeque<Bytes>>>,
    ready: Condvar,
}

impl MemoryStaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append `copies` copies of `value` to `key`.
    pub fn push(&self, key: &str, value: Bytes, copies: usize) {
        if copies == 0 {
            return;
        }
        {
            let mut lists = self.lists.lock();
            let list = lists.entry(key.to_string()).or_default();
            for _ in 0..copies {
                list.push_back(value.clone());
            }
        }
        self.ready.notify_all();
    }

    /// Blocking pop; `None` once `timeout` has expired.
    pub fn pop(&self, key: &str, timeout: Option<Duration>) -> Option<Bytes> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lists = self.lists.lock();
        loop {
            if let Some(list) = lists.get_mut(key) {
                if let Some(value) = list.pop_front() {
                    if list.is_empty() {
                        lists.remove(key);
                    }
                    return Some(value);
                }
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    self.ready.wait_until(&mut lists, deadline);
                }
                None => self.ready.wait(&mut lists),
            }
        }
    }

    /// Number of values queued at `key`.
    pub fn len(&self, key: &str) -> usize {
        self.lists.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Keys that currently hold at least one value, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lists.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A connection to a [`MemoryStaging`].
#[derive(Debug, Clone)]
pub struct MemoryStagingHandle {
    location: Location,
    store: Arc<MemoryStaging>,
}

impl MemoryStagingHandle {
    pub fn new(location: Location, store: Arc<MemoryStaging>) -> Self {
        Self { location, store }
    }
}

impl StagingStore for MemoryStagingHandle {
    fn location(&self) -> &Location {
        &self.location
    }

    fn push(&mut self, key: &str, value: Bytes, copies: usize) -> Result<()> {
        self.store.push(key, value, copies);
        Ok(())
    }

    fn pop(&mut self, key: &str, timeout: Option<Duration>) -> Result<Bytes> {
        self.store.pop(key, timeout).ok_or_else(|| Error::Timeout {
            key: key.to_string(),
            waited: timeout.unwrap_or_default(),
        })
    }
}

/// A set of in-process staging stores addressed by location.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: DashMap<Location, Arc<MemoryStaging>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The store at `location`, created on first use.
    pub fn node(&self, location: &Location) -> Arc<MemoryStaging> {
        self.nodes
            .entry(location.clone())
            .or_insert_with(MemoryStaging::new)
            .clone()
    }

    /// A connection to the store at `location`.
    pub fn handle(&self, location: &Location) -> MemoryStagingHandle {
        MemoryStagingHandle::new(location.clone(), self.node(location))
    }
}

impl StagingConnector for MemoryCluster {
    fn connect(&self, location: &Location) -> Result<Box<dyn StagingStore>> {
        Ok(Box::new(self.handle(location)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let store = MemoryStaging::new();
        store.push("k", Bytes::from_static(b"a"), 1);
        store.push("k", Bytes::from_static(b"b"), 1);

        assert_eq!(store.pop("k", None).unwrap(), "a");
        assert_eq!(store.pop("k", None).unwrap(), "b");
        assert_eq!(store.len("k"), 0);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_push_copies_fans_out() {
        let store = MemoryStaging::new();
        store.push("k", Bytes::from_static(b"x"), 3);
        assert_eq!(store.len("k"), 3);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let store = MemoryStaging::new();
        let producer = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.push("late", Bytes::from_static(b"v"), 1);
            })
        };
        assert_eq!(store.pop("late", None).unwrap(), "v");
        producer.join().unwrap();
    }

    #[test]
    fn test_pop_times_out() {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.connect(&Location::from("n1")).unwrap();
        assert_matches!(
            conn.pop("missing", Some(Duration::from_millis(10))),
            Err(Error::Timeout { .. })
        );
    }

    #[test]
    fn test_cluster_routes_by_location() {
        let cluster = MemoryCluster::new();
        let a = Location::from("a");
        let b = Location::from("b");

        cluster.connect(&a).unwrap().push("k", Bytes::from_static(b"1"), 1).unwrap();
        assert_eq!(cluster.node(&a).len("k"), 1);
        assert_eq!(cluster.node(&b).len("k"), 0);
    }

    #[test]
    fn test_pop_pipelined_preserves_order() {
        let cluster = MemoryCluster::new();
        let loc = Location::from("n");
        let mut conn = cluster.connect(&loc).unwrap();
        for i in 0..4 {
            conn.push(&format!("f:{}", i), Bytes::from(vec![i as u8]), 1).unwrap();
        }
        let keys: Vec<String> = (0..4).map(|i| format!("f:{}", i)).collect();
        let mut seen = Vec::new();
        conn.pop_pipelined(&keys, None, &mut |v| {
            seen.push(v[0]);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
