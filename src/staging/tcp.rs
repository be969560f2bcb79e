//! TCP staging store
//!
//! A small length-prefixed request/response protocol so worker processes on
//! different nodes can reach each other's staging stores.
//!
//! ```text
//! request  : op (u8) │ key len (u32) │ key │ op-specific body
//!   PUSH=1 : copies (u32) │ value len (u32) │ value
//!   POP=2  : timeout ms (u64, 0 = forever)
//!
//! response : status (u8)  0 = ok, 1 = timed out
//!   POP ok : value len (u32) │ value
//! ```
//!
//! Requests on one connection are answered in order, so a client may write
//! several before reading any reply.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::memory::MemoryStaging;
use super::{Location, StagingConnector, StagingStore};
use crate::error::{Error, Result};

const OP_PUSH: u8 = 1;
const OP_POP: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_TIMEOUT: u8 = 1;

/// Unacknowledged pushes allowed in flight before the client drains acks.
const ACK_WINDOW: usize = 64;

/// Pop requests written ahead of their replies.
const PIPELINE_DEPTH: usize = 256;

/// Largest key or value accepted off the wire.
const MAX_FRAME: usize = 256 * 1024 * 1024;

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_blob(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn timeout_millis(timeout: Option<Duration>) -> u64 {
    // 0 means forever on the wire, so round sub-millisecond bounds up
    timeout.map_or(0, |t| (t.as_millis() as u64).max(1))
}

// =============================================================================
// Client
// =============================================================================

/// One client connection to a remote staging store.
#[derive(Debug)]
pub struct TcpStaging {
    location: Location,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    pending_acks: usize,
}

impl TcpStaging {
    /// Connect to `location` (`host:port`).
    pub fn connect(location: &Location) -> Result<Self> {
        let stream = TcpStream::connect(location.as_str()).map_err(|e| Error::Staging {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            location: location.clone(),
            reader,
            writer: BufWriter::new(stream),
            pending_acks: 0,
        })
    }

    fn staging_err(&self, reason: impl Into<String>) -> Error {
        Error::Staging {
            location: self.location.to_string(),
            reason: reason.into(),
        }
    }

    fn write_pop(&mut self, key: &str, timeout: Option<Duration>) -> Result<()> {
        let mut req = BytesMut::with_capacity(1 + 4 + key.len() + 8);
        req.put_u8(OP_POP);
        req.put_u32(key.len() as u32);
        req.put_slice(key.as_bytes());
        req.put_u64(timeout_millis(timeout));
        self.writer.write_all(&req)?;
        Ok(())
    }

    fn read_pop_reply(&mut self, key: &str, timeout: Option<Duration>) -> Result<Bytes> {
        match read_u8(&mut self.reader)? {
            STATUS_OK => Ok(Bytes::from(read_blob(&mut self.reader)?)),
            STATUS_TIMEOUT => Err(Error::Timeout {
                key: key.to_string(),
                waited: timeout.unwrap_or_default(),
            }),
            other => Err(self.staging_err(format!("unexpected status {}", other))),
        }
    }

    fn drain_acks(&mut self, keep: usize) -> Result<()> {
        if self.pending_acks <= keep {
            return Ok(());
        }
        self.writer.flush()?;
        while self.pending_acks > keep {
            let status = read_u8(&mut self.reader)?;
            if status != STATUS_OK {
                return Err(self.staging_err(format!("push rejected with status {}", status)));
            }
            self.pending_acks -= 1;
        }
        Ok(())
    }
}

impl StagingStore for TcpStaging {
    fn location(&self) -> &Location {
        &self.location
    }

    fn push(&mut self, key: &str, value: Bytes, copies: usize) -> Result<()> {
        let mut header = BytesMut::with_capacity(1 + 4 + key.len() + 8);
        header.put_u8(OP_PUSH);
        header.put_u32(key.len() as u32);
        header.put_slice(key.as_bytes());
        header.put_u32(copies as u32);
        header.put_u32(value.len() as u32);
        self.writer.write_all(&header)?;
        self.writer.write_all(&value)?;
        self.pending_acks += 1;
        self.drain_acks(ACK_WINDOW)
    }

    fn pop(&mut self, key: &str, timeout: Option<Duration>) -> Result<Bytes> {
        self.sync()?;
        self.write_pop(key, timeout)?;
        self.writer.flush()?;
        self.read_pop_reply(key, timeout)
    }

    fn pop_pipelined(
        &mut self,
        keys: &[String],
        timeout: Option<Duration>,
        sink: &mut dyn FnMut(Bytes) -> Result<()>,
    ) -> Result<()> {
        self.sync()?;
        for batch in keys.chunks(PIPELINE_DEPTH) {
            for key in batch {
                self.write_pop(key, timeout)?;
            }
            self.writer.flush()?;
            for key in batch {
                let value = self.read_pop_reply(key, timeout)?;
                sink(value)?;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.drain_acks(0)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for TcpStaging {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(location = %self.location, error = %e, "Unacknowledged pushes on close");
        }
    }
}

/// Opens [`TcpStaging`] connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl StagingConnector for TcpConnector {
    fn connect(&self, location: &Location) -> Result<Box<dyn StagingStore>> {
        Ok(Box::new(TcpStaging::connect(location)?))
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves a [`MemoryStaging`] over TCP, one thread per connection.
#[derive(Debug, Clone)]
pub struct StagingServer {
    store: Arc<MemoryStaging>,
}

impl StagingServer {
    pub fn new(store: Arc<MemoryStaging>) -> Self {
        Self { store }
    }

    pub fn bind(addr: impl ToSocketAddrs) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr)?)
    }

    /// Accept connections until the listener fails.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Staging store listening");
        for stream in listener.incoming() {
            let stream = stream?;
            let store = self.store.clone();
            let peer = stream.peer_addr().ok();
            thread::Builder::new()
                .name("staging-conn".into())
                .spawn(move || {
                    if let Err(e) = Self::handle_connection(&store, stream) {
                        debug!(peer = ?peer, error = %e, "Staging connection closed");
                    }
                })?;
        }
        Ok(())
    }

    fn handle_connection(store: &MemoryStaging, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        loop {
            let op = match read_u8(&mut reader) {
                Ok(op) => op,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let key = String::from_utf8(read_blob(&mut reader)?)
                .map_err(|e| Error::Protocol(format!("key is not UTF-8: {}", e)))?;

            match op {
                OP_PUSH => {
                    let copies = read_u32(&mut reader)? as usize;
                    let value = Bytes::from(read_blob(&mut reader)?);
                    store.push(&key, value, copies);
                    writer.write_all(&[STATUS_OK])?;
                }
                OP_POP => {
                    let millis = read_u64(&mut reader)?;
                    let timeout = (millis > 0).then(|| Duration::from_millis(millis));
                    // replies already queued must reach the client before we block
                    writer.flush()?;
                    match store.pop(&key, timeout) {
                        Some(value) => {
                            writer.write_all(&[STATUS_OK])?;
                            writer.write_all(&(value.len() as u32).to_be_bytes())?;
                            writer.write_all(&value)?;
                        }
                        None => writer.write_all(&[STATUS_TIMEOUT])?,
                    }
                }
                other => return Err(Error::Protocol(format!("unknown staging op {}", other))),
            }

            // flush once the client has nothing more buffered for us
            if reader.buffer().is_empty() {
                writer.flush()?;
            }
        }
    }
}
