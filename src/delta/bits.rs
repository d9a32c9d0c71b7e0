//! Little-endian bit streams
//!
//! Bit `n` of a stream is bit `n % 8` of byte `n / 8`. Fields are written
//! least significant bit first.

use crate::error::{IndexError, Result};

/// Appends bit fields to a growable buffer
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bits: u64,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            bits: 0,
        }
    }

    /// Write the low `size` bits of `value`
    pub fn write(&mut self, value: u64, size: u32) {
        debug_assert!(size <= 64);
        debug_assert!(size == 64 || value >> size == 0);
        let mut value = value;
        let mut remaining = size;
        while remaining > 0 {
            let byte = (self.bits / 8) as usize;
            let shift = (self.bits % 8) as u32;
            if byte == self.buf.len() {
                self.buf.push(0);
            }
            let take = (8 - shift).min(remaining);
            let part = (value & ((1u64 << take) - 1)) as u8;
            self.buf[byte] |= part << shift;
            value >>= take;
            remaining -= take;
            self.bits += u64::from(take);
        }
    }

    /// Write `count` zero bits
    pub fn write_zeros(&mut self, count: u64) {
        self.bits += count;
        let needed = self.bits.div_ceil(8) as usize;
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
    }

    /// Write whole bytes, each as an 8-bit field
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write(u64::from(*byte), 8);
        }
    }

    pub fn bit_len(&self) -> u64 {
        self.bits
    }

    /// Finish the stream; the final byte is zero padded
    pub fn into_parts(self) -> (Vec<u8>, u64) {
        (self.buf, self.bits)
    }
}

/// Reads bit fields from the first `end` bits of a slice
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    mem: &'a [u8],
    pos: u64,
    end: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(mem: &'a [u8], bits: u64) -> Result<Self> {
        if bits > mem.len() as u64 * 8 {
            return Err(IndexError::format(format!(
                "bit stream of {} bits does not fit in {} bytes",
                bits,
                mem.len()
            )));
        }
        Ok(Self {
            mem,
            pos: 0,
            end: bits,
        })
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.end
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    /// Read a `size`-bit field
    pub fn read(&mut self, size: u32) -> Result<u64> {
        if u64::from(size) > self.remaining() {
            return Err(IndexError::format("delta list ends inside a field"));
        }
        let mut value = 0u64;
        let mut got = 0u32;
        while got < size {
            let byte = self.mem[(self.pos / 8) as usize];
            let shift = (self.pos % 8) as u32;
            let take = (8 - shift).min(size - got);
            let part = (u64::from(byte) >> shift) & ((1u64 << take) - 1);
            value |= part << got;
            got += take;
            self.pos += u64::from(take);
        }
        Ok(value)
    }

    /// Count zero bits up to and including the next one bit
    pub fn read_unary(&mut self) -> Result<u64> {
        let mut zeros = 0u64;
        loop {
            if self.at_end() {
                return Err(IndexError::format("delta list ends inside a unary run"));
            }
            let byte = self.mem[(self.pos / 8) as usize];
            let shift = (self.pos % 8) as u32;
            let rest = byte >> shift;
            if rest == 0 {
                let skipped = u64::from(8 - shift);
                zeros += skipped;
                self.pos += skipped;
                continue;
            }
            let run = u64::from(rest.trailing_zeros());
            zeros += run;
            self.pos += run + 1;
            if self.pos > self.end {
                return Err(IndexError::format("delta list ends inside a unary run"));
            }
            return Ok(zeros);
        }
    }

    /// Read `N` whole bytes
    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        for byte in out.iter_mut() {
            *byte = self.read(8)? as u8;
        }
        Ok(out)
    }
}
