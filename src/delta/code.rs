//! Golomb-style delta code
//!
//! For a geometric distribution with mean `mean_delta`, deltas below
//! `min_keys` take exactly `min_bits` bits. Larger deltas take `min_bits`
//! bits for the remainder, a run of zero bits for the quotient, and a
//! terminating one bit.

use crate::error::Result;
use crate::geometry::bits_per;

use super::bits::{BitReader, BitWriter};

/// Coding constants derived from a mean delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaCode {
    mean_delta: u32,
    incr_keys: u64,
    min_bits: u32,
    min_keys: u64,
}

impl DeltaCode {
    pub fn new(mean_delta: u32) -> Self {
        let mean_delta = mean_delta.max(1);
        // incr_keys approximates ln(2) * mean_delta
        let incr_keys = (836_158 * u64::from(mean_delta) + 603_160) / 1_206_321;
        let incr_keys = incr_keys.max(1);
        let min_bits = bits_per(incr_keys + 1);
        let min_keys = (1u64 << min_bits) - incr_keys;
        Self {
            mean_delta,
            incr_keys,
            min_bits,
            min_keys,
        }
    }

    pub fn mean_delta(&self) -> u32 {
        self.mean_delta
    }

    pub fn min_bits(&self) -> u32 {
        self.min_bits
    }

    /// Upper estimate of the average coded size of one delta
    pub fn estimated_bits(&self) -> u32 {
        self.min_bits + 2
    }

    /// Exact number of bits `delta` encodes to
    pub fn bits_for(&self, delta: u64) -> u64 {
        if delta < self.min_keys {
            u64::from(self.min_bits)
        } else {
            u64::from(self.min_bits) + (delta - self.min_keys) / self.incr_keys + 1
        }
    }

    pub fn encode(&self, writer: &mut BitWriter, delta: u64) {
        if delta < self.min_keys {
            writer.write(delta, self.min_bits);
            return;
        }
        let temp = delta - self.min_keys;
        let remainder = temp % self.incr_keys + self.min_keys;
        let quotient = temp / self.incr_keys;
        writer.write(remainder, self.min_bits);
        writer.write_zeros(quotient);
        writer.write(1, 1);
    }

    pub fn decode(&self, reader: &mut BitReader<'_>) -> Result<u64> {
        let head = reader.read(self.min_bits)?;
        if head < self.min_keys {
            return Ok(head);
        }
        let quotient = reader.read_unary()?;
        Ok(head + quotient * self.incr_keys)
    }
}
