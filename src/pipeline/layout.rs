//! How a file's packets map onto fragments and chunk objects

use crate::error::{Error, Result};

/// Packet layout of an online (erasure-coded) file.
///
/// Client packet `p` belongs to data column `p mod k`, stripe `p / k`. A
/// partial last stripe is padded in the columns `>= remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    pub n: usize,
    pub k: usize,
    /// Data packets in the file
    pub total: usize,
    /// Full stripes
    pub rounds: usize,
    /// Data packets in the partial last stripe
    pub remainder: usize,
}

impl StripeLayout {
    pub fn new(n: usize, k: usize, total: usize) -> Result<Self> {
        if k == 0 || k > n {
            return Err(Error::InvalidEcConfig(format!(
                "k={} must be in 1..={}",
                k, n
            )));
        }
        Ok(Self {
            n,
            k,
            total,
            rounds: total / k,
            remainder: total % k,
        })
    }

    /// Stripes, counting a partial last one.
    pub fn stripes(&self) -> usize {
        self.rounds + usize::from(self.remainder > 0)
    }

    /// Packets data column `column` carries.
    pub fn data_packets(&self, column: usize) -> usize {
        self.rounds + usize::from(column < self.remainder)
    }

    /// Whether the load of data column `column` ends with a padding packet.
    pub fn pads(&self, column: usize) -> bool {
        self.remainder > 0 && column >= self.remainder
    }

    /// Whether `column` is padding in stripe `stripe`.
    pub fn is_padding(&self, stripe: usize, column: usize) -> bool {
        column < self.k && stripe >= self.data_packets(column)
    }

    /// Packets stored in fragment object `fragment`.
    pub fn declared(&self, fragment: usize) -> usize {
        if fragment < self.k {
            self.data_packets(fragment)
        } else {
            self.stripes()
        }
    }
}

/// Chunk layout of an offline file: `count` objects of `base_size_mb`,
/// the last one holding what is left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// (first client packet index, packets) per object
    pub chunks: Vec<(usize, usize)>,
}

impl ChunkLayout {
    pub fn new(
        size_mb: usize,
        count: usize,
        base_size_mb: usize,
        packets_per_unit: usize,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::Protocol("offline file with no objects".into()));
        }
        let leading = base_size_mb * (count - 1);
        if leading > size_mb {
            return Err(Error::Protocol(format!(
                "{} objects of {} MiB exceed a {} MiB file",
                count, base_size_mb, size_mb
            )));
        }

        let mut start = 0;
        let chunks = (0..count)
            .map(|i| {
                let mb = if i + 1 < count { base_size_mb } else { size_mb - leading };
                let packets = mb * packets_per_unit;
                let chunk = (start, packets);
                start += packets;
                chunk
            })
            .collect();
        Ok(Self { chunks })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
