//! Storage Module
//!
//! Block-addressed backing storage consumed by the index.
//!
//! ## Responsibilities
//! - Read and write whole blocks at a block offset
//! - Bound saved streams to a fixed region of blocks
//!
//! ## Device Layout
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Volume                                 │
//! │ ┌──────────┬──────────┬──────────────┐ │
//! │ │ Header   │Chapter 0 │ Chapter 1 ...│ │
//! │ └──────────┴──────────┴──────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Save Region                            │
//! │ ┌──────┬────────┬────────┬──────────┐ │
//! │ │State │Page Map│Open Ch.│Zone 0..N │ │
//! │ └──────┴────────┴────────┴──────────┘ │
//! └────────────────────────────────────────┘
//! ```

mod file;
mod memory;
mod region;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use region::{RegionReader, RegionWriter};
pub(crate) use region::StreamCursor;

use crate::error::Result;

/// Size of one storage block; also the size of one volume page
pub const BLOCK_SIZE: usize = 4096;

/// Number of blocks needed to hold `bytes`
pub fn blocks_for(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE as u64)
}

/// Block storage the index reads pages from and saves state to
///
/// All offsets and lengths are in blocks. Implementations must be safe to
/// call from reader threads and zone threads at the same time.
pub trait BlockStorage: Send + Sync {
    /// Read `count` blocks starting at block `offset`
    fn read_blocks(&self, offset: u64, count: usize) -> Result<Vec<u8>>;

    /// Write whole blocks starting at block `offset`
    ///
    /// `data.len()` must be a multiple of [`BLOCK_SIZE`].
    fn write_blocks(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()>;

    /// Capacity in blocks
    fn block_count(&self) -> u64;
}

pub(crate) fn check_range(
    storage_blocks: u64,
    offset: u64,
    count: u64,
) -> Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= storage_blocks => Ok(()),
        _ => Err(crate::IndexError::invalid(format!(
            "block range {}+{} exceeds storage of {} blocks",
            offset, count, storage_blocks
        ))),
    }
}
