//! Block layout of an index
//!
//! ```text
//! block 0                      volume header page
//! blocks 1 ..                  chapter pages
//! state block                  IndexState (bincode + crc32)
//! page map region              saved index page map
//! open chapter region          saved open chapter
//! volume index region          one stream per saving zone
//! ```
//!
//! The volume index region is large enough for any zone count, so an index
//! saved with one zone count can be loaded with another.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::geometry::{Geometry, MAX_ZONES};
use crate::open_chapter;
use crate::page_map::IndexPageMap;
use crate::storage::{blocks_for, BlockStorage, StreamCursor, BLOCK_SIZE};
use crate::volume_index::{VolumeIndex, VolumeIndexConfig};

const STATE_MAGIC: &[u8; 8] = b"DSTATE01";

/// A contiguous run of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub blocks: u64,
}

/// Everything needed to interpret a save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub geometry: Geometry,
    pub nonce: u64,
    /// Zone count of the index that saved
    pub zone_count: u32,
    /// Oldest chapter still in the volume
    pub oldest_chapter: u64,
    /// The open chapter at save time
    pub newest_chapter: u64,
    /// Volume index stream of each saving zone
    pub streams: Vec<BlockRange>,
}

/// Where each part of an index lives on its storage
#[derive(Debug, Clone)]
pub struct IndexLayout {
    pub volume: BlockRange,
    pub state: BlockRange,
    pub page_map: BlockRange,
    pub open_chapter: BlockRange,
    pub volume_index: BlockRange,
    config: VolumeIndexConfig,
}

impl IndexLayout {
    pub fn new(config: &VolumeIndexConfig) -> Self {
        let geometry = &config.geometry;
        let volume = BlockRange {
            start: 0,
            blocks: u64::from(geometry.total_pages()),
        };
        let state = BlockRange {
            start: volume.start + volume.blocks,
            blocks: 1,
        };
        let page_map = BlockRange {
            start: state.start + state.blocks,
            blocks: blocks_for(IndexPageMap::compute_save_size(geometry)),
        };
        let open_chapter = BlockRange {
            start: page_map.start + page_map.blocks,
            blocks: blocks_for(open_chapter::compute_save_bytes(geometry)),
        };
        let index_blocks = (1..=MAX_ZONES)
            .map(|zones| u64::from(zones) * Self::stream_blocks(config, zones))
            .max()
            .unwrap_or(0);
        let volume_index = BlockRange {
            start: open_chapter.start + open_chapter.blocks,
            blocks: index_blocks,
        };

        Self {
            volume,
            state,
            page_map,
            open_chapter,
            volume_index,
            config: config.clone(),
        }
    }

    fn stream_blocks(config: &VolumeIndexConfig, zones: u32) -> u64 {
        blocks_for(VolumeIndex::compute_save_bytes(config, zones))
    }

    /// Blocks the storage must provide
    pub fn total_blocks(&self) -> u64 {
        self.volume_index.start + self.volume_index.blocks
    }

    /// Stream slots for an index saving with `zones` zones
    pub fn stream_ranges(&self, zones: u32) -> Vec<BlockRange> {
        let blocks = Self::stream_blocks(&self.config, zones);
        (0..u64::from(zones))
            .map(|zone| BlockRange {
                start: self.volume_index.start + zone * blocks,
                blocks,
            })
            .collect()
    }

    // =========================================================================
    // State Block
    // =========================================================================

    pub fn write_state(&self, storage: &dyn BlockStorage, state: &IndexState) -> Result<()> {
        let body = bincode::serialize(state)?;
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        block.put_slice(STATE_MAGIC);
        block.put_u32_le(body.len() as u32);
        block.put_slice(&body);
        let crc = crc32fast::hash(&block);
        block.put_u32_le(crc);
        if block.len() > BLOCK_SIZE {
            return Err(IndexError::Serialization(format!(
                "index state needs {} bytes",
                block.len()
            )));
        }
        block.resize(BLOCK_SIZE, 0);
        storage.write_blocks(self.state.start, &block)
    }

    pub fn read_state(&self, storage: &dyn BlockStorage) -> Result<IndexState> {
        let block = storage.read_blocks(self.state.start, 1)?;
        let mut cursor = StreamCursor::new(&block, "index state");
        if cursor.bytes(STATE_MAGIC.len())? != STATE_MAGIC {
            return Err(IndexError::format("no saved index state"));
        }
        let len = cursor.u32()? as usize;
        let body = cursor.bytes(len)?;
        let consumed = block.len() - cursor.remaining();
        if crc32fast::hash(&block[..consumed]) != cursor.u32()? {
            return Err(IndexError::format("index state checksum mismatch"));
        }
        let state: IndexState = bincode::deserialize(body)
            .map_err(|e| IndexError::format(format!("bad index state: {}", e)))?;

        let region_end = self.volume_index.start + self.volume_index.blocks;
        let in_region = state
            .streams
            .iter()
            .all(|r| r.start >= self.volume_index.start && r.start + r.blocks <= region_end);
        if state.streams.is_empty() || !in_region {
            return Err(IndexError::format("saved volume index streams out of range"));
        }
        Ok(state)
    }
}
