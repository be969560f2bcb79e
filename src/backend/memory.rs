//! In-memory object backend

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use dashmap::DashMap;

use super::{BackendStats, ObjectBackend};
use crate::error::{Error, Result};

/// Objects held in memory.
/// Uses DashMap so concurrent output streams do not contend on one lock.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: DashMap<String, BytesMut>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an object, returning whether it existed.
    pub fn remove(&self, object: &str) -> bool {
        self.objects.remove(object).is_some()
    }

    /// Copy of an object's full contents.
    pub fn contents(&self, object: &str) -> Option<Vec<u8>> {
        self.objects.get(object).map(|o| o.to_vec())
    }
}

impl ObjectBackend for MemoryBackend {
    fn exists(&self, object: &str) -> Result<bool> {
        Ok(self.objects.contains_key(object))
    }

    fn create(&self, object: &str) -> Result<()> {
        self.objects.insert(object.to_string(), BytesMut::new());
        Ok(())
    }

    fn append(&self, object: &str, data: &[u8]) -> Result<()> {
        let mut entry = self
            .objects
            .get_mut(object)
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))?;
        entry.extend_from_slice(data);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self, object: &str) -> Result<u64> {
        self.objects
            .get(object)
            .map(|o| o.len() as u64)
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))
    }

    fn read_at(&self, object: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let entry = self
            .objects
            .get(object)
            .ok_or_else(|| Error::ObjectNotFound(object.to_string()))?;
        let start = (offset as usize).min(entry.len());
        let end = start.saturating_add(len).min(entry.len());
        self.bytes_read
            .fetch_add((end - start) as u64, Ordering::Relaxed);
        Ok(entry[start..end].to_vec())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            objects: self.objects.len() as u64,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}
