//! Packets
//!
//! A packet is the unit every pipeline stage moves around: a payload of at
//! most `packet_size` bytes. On the staging store a packet travels framed as
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ length (u32, BE)     │ payload (length bytes)   │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! A length of zero is the empty/end marker. The write pipeline uses it as
//! the padding column of a partial last stripe.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the big-endian length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// One unit of data owned by exactly one stage at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    data: BytesMut,
}

impl Packet {
    /// Wrap an owned buffer.
    pub fn new(data: BytesMut) -> Self {
        Self { data }
    }

    /// Copy a payload into a new packet.
    pub fn from_slice(payload: &[u8]) -> Self {
        Self {
            data: BytesMut::from(payload),
        }
    }

    /// A packet of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: BytesMut::zeroed(len),
        }
    }

    /// The empty/end marker.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this is the empty/end marker.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Give up the packet and keep its buffer.
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Zero-extend the payload to `len` bytes. Longer payloads are left alone.
    pub fn pad_to(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    /// Encode into the staging-store wire frame.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        frame.put_u32(self.data.len() as u32);
        frame.put_slice(&self.data);
        frame.freeze()
    }

    /// Decode a staging-store wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::InvalidPacket(format!(
                "frame of {} bytes is shorter than the {}-byte header",
                frame.len(),
                FRAME_HEADER_LEN
            )));
        }

        let mut buf = frame;
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(Error::InvalidPacket(format!(
                "header declares {} payload bytes, frame carries {}",
                len,
                buf.remaining()
            )));
        }

        Ok(Self::from_slice(buf))
    }
}

impl From<Vec<u8>> for Packet {
    fn from(v: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&v[..]),
        }
    }
}

impl From<BytesMut> for Packet {
    fn from(data: BytesMut) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_frame_roundtrip() {
        let pkt = Packet::from_slice(b"stripe payload");
        let frame = pkt.encode();

        assert_eq!(frame.len(), FRAME_HEADER_LEN + 14);
        assert_eq!(&frame[..4], &14u32.to_be_bytes());
        assert_eq!(Packet::decode(&frame).unwrap(), pkt);
    }

    #[test]
    fn test_empty_marker() {
        let frame = Packet::empty().encode();
        assert_eq!(&frame[..], &[0, 0, 0, 0]);

        let decoded = Packet::decode(&frame).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert_matches!(Packet::decode(&[0, 1]), Err(Error::InvalidPacket(_)));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut frame = Packet::from_slice(b"abcd").encode().to_vec();
        frame.pop();
        assert_matches!(Packet::decode(&frame), Err(Error::InvalidPacket(_)));
    }

    #[test]
    fn test_pad_to_zero_extends() {
        let mut pkt = Packet::from_slice(&[7, 7]);
        pkt.pad_to(5);
        assert_eq!(pkt.data(), &[7, 7, 0, 0, 0]);

        // never truncates
        pkt.pad_to(1);
        assert_eq!(pkt.len(), 5);

        let mut marker = Packet::empty();
        marker.pad_to(3);
        assert_eq!(marker.data(), &[0, 0, 0]);
    }
}
