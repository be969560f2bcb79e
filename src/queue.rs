//! Inter-stage packet queues
//!
//! Every pipeline stage talks to its neighbours through an unbounded FIFO of
//! owned [`Packet`]s. Pushing never blocks; popping blocks until a packet is
//! available or every producer is gone. A send or receive is the ownership
//! hand-off between stages.
//!
//! Each queue carries a label so a closed-queue error names the stage that
//! went away.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{Error, Result};
use crate::packet::Packet;

/// Create a labelled unbounded packet queue.
pub fn packet_queue(label: impl Into<String>) -> (QueueTx, QueueRx) {
    let label: Arc<str> = Arc::from(label.into());
    let (tx, rx) = channel::unbounded();
    (
        QueueTx {
            tx,
            label: label.clone(),
        },
        QueueRx { rx, label },
    )
}

/// Producer half of a packet queue.
#[derive(Debug, Clone)]
pub struct QueueTx {
    tx: Sender<Packet>,
    label: Arc<str>,
}

impl QueueTx {
    /// Push a packet. Fails only if the consumer stage is gone.
    pub fn push(&self, pkt: Packet) -> Result<()> {
        self.tx
            .send(pkt)
            .map_err(|_| Error::QueueClosed(format!("consumer of '{}' stopped", self.label)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Consumer half of a packet queue.
#[derive(Debug)]
pub struct QueueRx {
    rx: Receiver<Packet>,
    label: Arc<str>,
}

impl QueueRx {
    /// Pop the next packet, blocking until one arrives.
    pub fn pop(&self) -> Result<Packet> {
        self.rx
            .recv()
            .map_err(|_| Error::QueueClosed(format!("producer of '{}' stopped", self.label)))
    }

    /// Number of packets currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::thread;

    #[test]
    fn test_fifo_across_threads() {
        let (tx, rx) = packet_queue("load:0");

        let producer = thread::spawn(move || {
            for i in 0..64u8 {
                tx.push(Packet::from_slice(&[i])).unwrap();
            }
        });

        for i in 0..64u8 {
            assert_eq!(rx.pop().unwrap().data(), &[i]);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_pop_after_producer_dropped() {
        let (tx, rx) = packet_queue("fetch:1");
        tx.push(Packet::from_slice(b"last")).unwrap();
        drop(tx);

        // queued packets are still delivered
        assert_eq!(rx.pop().unwrap().data(), b"last");
        assert_matches!(rx.pop(), Err(Error::QueueClosed(msg)) if msg.contains("fetch:1"));
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        let (tx, rx) = packet_queue("cache");
        drop(rx);
        assert_matches!(tx.push(Packet::empty()), Err(Error::QueueClosed(_)));
    }
}
