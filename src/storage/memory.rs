//! In-memory block storage, used by tests and benchmarks

use parking_lot::RwLock;

use crate::error::{IndexError, Result};

use super::{check_range, BlockStorage, BLOCK_SIZE};

/// Fixed-size storage held in a byte vector
pub struct MemoryStorage {
    blocks: u64,
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Create zero-filled storage of `blocks` blocks
    pub fn new(blocks: u64) -> Self {
        Self {
            blocks,
            data: RwLock::new(vec![0u8; blocks as usize * BLOCK_SIZE]),
        }
    }
}

impl BlockStorage for MemoryStorage {
    fn read_blocks(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        check_range(self.blocks, offset, count as u64)?;
        let start = offset as usize * BLOCK_SIZE;
        let data = self.data.read();
        Ok(data[start..start + count * BLOCK_SIZE].to_vec())
    }

    fn write_blocks(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() % BLOCK_SIZE != 0 {
            return Err(IndexError::invalid(format!(
                "write of {} bytes is not block aligned",
                bytes.len()
            )));
        }
        check_range(self.blocks, offset, (bytes.len() / BLOCK_SIZE) as u64)?;
        let start = offset as usize * BLOCK_SIZE;
        let mut data = self.data.write();
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }
}
