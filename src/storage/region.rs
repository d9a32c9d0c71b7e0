//! Buffered byte streams over a fixed region of blocks
//!
//! Saved formats are written as plain byte streams; these adapters cut them
//! into blocks and refuse to run past the end of their region.

use std::io::{self, Read, Write};

use bytes::Buf;

use crate::error::{IndexError, Result};

use super::{BlockStorage, BLOCK_SIZE};

/// Writes a byte stream into `[start, start + blocks)`
pub struct RegionWriter<'a> {
    storage: &'a dyn BlockStorage,
    start: u64,
    blocks: u64,
    /// Blocks already written
    next_block: u64,
    /// Partial block not yet written
    buf: Vec<u8>,
}

impl<'a> RegionWriter<'a> {
    pub fn new(storage: &'a dyn BlockStorage, start: u64, blocks: u64) -> Self {
        Self {
            storage,
            start,
            blocks,
            next_block: 0,
            buf: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    fn write_block(&mut self) -> io::Result<()> {
        if self.next_block >= self.blocks {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("stream overflows its region of {} blocks", self.blocks),
            ));
        }
        self.storage
            .write_blocks(self.start + self.next_block, &self.buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.next_block += 1;
        self.buf.clear();
        Ok(())
    }

    /// Pad and write the final partial block; returns bytes written
    pub fn finish(mut self) -> Result<u64> {
        let bytes = self.next_block * BLOCK_SIZE as u64 + self.buf.len() as u64;
        if !self.buf.is_empty() {
            self.buf.resize(BLOCK_SIZE, 0);
            self.write_block()?;
        }
        Ok(bytes)
    }
}

impl Write for RegionWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = BLOCK_SIZE - self.buf.len();
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        if self.buf.len() == BLOCK_SIZE {
            self.write_block()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads a byte stream back out of `[start, start + blocks)`
pub struct RegionReader<'a> {
    storage: &'a dyn BlockStorage,
    start: u64,
    blocks: u64,
    next_block: u64,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> RegionReader<'a> {
    pub fn new(storage: &'a dyn BlockStorage, start: u64, blocks: u64) -> Self {
        Self {
            storage,
            start,
            blocks,
            next_block: 0,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for RegionReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.buf.len() {
            if self.next_block >= self.blocks {
                return Ok(0);
            }
            self.buf = self
                .storage
                .read_blocks(self.start + self.next_block, 1)
                .map_err(|e| io::Error::other(e.to_string()))?;
            self.next_block += 1;
            self.pos = 0;
        }
        let take = (self.buf.len() - self.pos).min(out.len());
        out[..take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}

/// Bounds-checked little-endian cursor over a saved stream
///
/// Every read reports truncation as a format error naming `what`.
pub(crate) struct StreamCursor<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> StreamCursor<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    pub fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.remaining() < bytes {
            return Err(IndexError::format(format!("{} is truncated", self.what)));
        }
        Ok(())
    }

    /// Bytes left unread
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}
