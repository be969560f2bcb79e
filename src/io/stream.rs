//! Backend-facing object streams
//!
//! An input stream reads an object sequentially in fixed-size units; an
//! output stream appends a declared number of packets to a fresh object.
//! Both raise a completion flag once their declared count has been moved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::ObjectBackend;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::queue::{QueueRx, QueueTx};

// =============================================================================
// Input
// =============================================================================

/// Sequential reader over one backend object.
#[derive(Clone)]
pub struct ObjectInputStream {
    backend: Arc<dyn ObjectBackend>,
    object: String,
    unit: usize,
    total: usize,
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for ObjectInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectInputStream")
            .field("object", &self.object)
            .field("unit", &self.unit)
            .field("total", &self.total)
            .finish()
    }
}

impl ObjectInputStream {
    /// Probe `object`; `None` if it does not exist.
    ///
    /// `unit` is the read granularity (a packet, or a packet slice).
    pub fn open(
        backend: Arc<dyn ObjectBackend>,
        object: &str,
        unit: usize,
    ) -> Result<Option<Self>> {
        if unit == 0 {
            return Err(Error::Config("stream unit must be > 0".into()));
        }
        if !backend.exists(object)? {
            debug!(object, "Object absent");
            return Ok(None);
        }
        let len = backend.len(object)? as usize;
        Ok(Some(Self {
            backend,
            object: object.to_string(),
            unit,
            total: len.div_ceil(unit),
            finished: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Units in the object (the last one may be short).
    pub fn total_packets(&self) -> usize {
        self.total
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Read unit `index`.
    pub fn read(&self, index: usize) -> Result<Packet> {
        let data = self
            .backend
            .read_at(&self.object, (index * self.unit) as u64, self.unit)?;
        Ok(Packet::from(data))
    }

    /// Read the first `limit` units (at most all of them) in order into
    /// `tx`. Runs as a pipeline stage.
    pub fn read_into(&self, tx: &QueueTx, limit: usize) -> Result<usize> {
        let count = limit.min(self.total);
        for index in 0..count {
            tx.push(self.read(index)?)?;
        }
        if count == self.total {
            self.finished.store(true, Ordering::Release);
        }
        trace!(object = %self.object, packets = count, "Input stream drained");
        Ok(count)
    }
}

// =============================================================================
// Output
// =============================================================================

/// Appends a declared number of packets to a new backend object.
#[derive(Clone)]
pub struct ObjectOutputStream {
    backend: Arc<dyn ObjectBackend>,
    object: String,
    declared: usize,
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for ObjectOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectOutputStream")
            .field("object", &self.object)
            .field("declared", &self.declared)
            .finish()
    }
}

impl ObjectOutputStream {
    /// Create (truncate) `object`, expecting `declared` packets.
    pub fn create(backend: Arc<dyn ObjectBackend>, object: &str, declared: usize) -> Result<Self> {
        backend.create(object)?;
        Ok(Self {
            backend,
            object: object.to_string(),
            declared,
            finished: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn declared(&self) -> usize {
        self.declared
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Pop the declared packets from `rx` and append them. Runs as a
    /// pipeline stage.
    ///
    /// Packets are appended back to back, so every packet must be as wide as
    /// the first one. Only the final packet may be shorter.
    pub fn write_from(&self, rx: &QueueRx) -> Result<usize> {
        let mut width = None;
        for index in 0..self.declared {
            let pkt = rx.pop()?;
            let expected = *width.get_or_insert(pkt.len());
            let last = index + 1 == self.declared;
            if pkt.len() > expected || (pkt.len() < expected && !last) {
                return Err(Error::Protocol(format!(
                    "packet {} of '{}' is {} bytes, expected {}",
                    index,
                    self.object,
                    pkt.len(),
                    expected
                )));
            }
            self.backend.append(&self.object, pkt.data())?;
        }
        self.finished.store(true, Ordering::Release);
        debug!(object = %self.object, packets = self.declared, "Object persisted");
        Ok(self.declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::queue::packet_queue;
    use assert_matches::assert_matches;

    #[test]
    fn test_missing_object_opens_as_none() {
        let backend: Arc<dyn ObjectBackend> = Arc::new(MemoryBackend::new());
        assert!(ObjectInputStream::open(backend, "ghost", 4).unwrap().is_none());
    }

    #[test]
    fn test_write_then_read_units() {
        let backend: Arc<dyn ObjectBackend> = Arc::new(MemoryBackend::new());
        let out = ObjectOutputStream::create(backend.clone(), "obj", 3).unwrap();

        let (tx, rx) = packet_queue("out");
        for b in [1u8, 2, 3] {
            tx.push(Packet::from_slice(&[b; 4])).unwrap();
        }
        assert!(!out.is_finished());
        assert_eq!(out.write_from(&rx).unwrap(), 3);
        assert!(out.is_finished());

        let input = ObjectInputStream::open(backend, "obj", 4).unwrap().unwrap();
        assert_eq!(input.total_packets(), 3);

        let (tx, rx) = packet_queue("in");
        assert_eq!(input.read_into(&tx, 2).unwrap(), 2);
        assert!(!input.is_finished());
        assert_eq!(input.read_into(&tx, usize::MAX).unwrap(), 3);
        assert!(input.is_finished());
        for b in [1u8, 2, 1, 2, 3] {
            assert_eq!(rx.pop().unwrap().data(), &[b; 4]);
        }
    }

    #[test]
    fn test_only_the_last_packet_may_be_short() {
        let backend: Arc<dyn ObjectBackend> = Arc::new(MemoryBackend::new());

        let (tx, rx) = packet_queue("tail");
        for len in [4, 4, 2] {
            tx.push(Packet::from_slice(&vec![1; len])).unwrap();
        }
        let out = ObjectOutputStream::create(backend.clone(), "tail", 3).unwrap();
        assert_eq!(out.write_from(&rx).unwrap(), 3);
        assert_eq!(backend.len("tail").unwrap(), 10);

        let (tx, rx) = packet_queue("gap");
        for len in [4, 2, 4] {
            tx.push(Packet::from_slice(&vec![1; len])).unwrap();
        }
        let out = ObjectOutputStream::create(backend, "gap", 3).unwrap();
        assert_matches!(out.write_from(&rx), Err(Error::Protocol(_)));
        assert!(!out.is_finished());
    }

    #[test]
    fn test_partial_last_unit() {
        let backend: Arc<dyn ObjectBackend> = Arc::new(MemoryBackend::new());
        backend.create("odd").unwrap();
        backend.append("odd", &[9; 10]).unwrap();

        let input = ObjectInputStream::open(backend, "odd", 4).unwrap().unwrap();
        assert_eq!(input.total_packets(), 3);
        assert_eq!(input.read(2).unwrap().len(), 2);
    }
}
