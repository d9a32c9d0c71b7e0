//! Index Geometry
//!
//! Every size the index works with derives from four inputs: bytes per
//! page, record pages per chapter, chapters per volume, and sparse chapters
//! per volume. The derived constants are computed once here and never change
//! for the lifetime of an index; every persisted format embeds or checks them.
//!
//! ## Volume layout
//! ```text
//! page 0            header page
//! page 1 ..         chapter 0: [index pages][record pages]
//!                   chapter 1: [index pages][record pages]
//!                   ...
//! ```

use serde::{Deserialize, Serialize};

use crate::chapter_index;
use crate::error::{IndexError, Result};
use crate::storage::BLOCK_SIZE;

/// Size of one stored record: 16 byte name + 16 byte metadata
pub const BYTES_PER_RECORD: usize = 32;

/// Mean gap between chapter delta addresses inside one chapter delta list
pub const CHAPTER_MEAN_DELTA: u32 = 1 << 16;

/// Largest supported zone count
pub const MAX_ZONES: u32 = 16;

/// Number of bits needed to represent `value` (0 needs none)
pub fn bits_per(value: u64) -> u32 {
    64 - value.leading_zeros()
}

/// Immutable chapter and page constants of one index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------
    pub bytes_per_page: usize,
    pub record_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,

    // -------------------------------------------------------------------------
    // Derived
    // -------------------------------------------------------------------------
    pub records_per_page: u32,
    pub records_per_chapter: u32,
    pub dense_chapters_per_volume: u32,
    pub chapter_mean_delta: u32,
    pub chapter_payload_bits: u32,
    pub chapter_delta_list_bits: u32,
    pub delta_lists_per_chapter: u32,
    pub chapter_address_bits: u32,
    pub index_pages_per_chapter: u32,
    pub pages_per_chapter: u32,
    /// Chapter pages in the volume, not counting the header page
    pub pages_per_volume: u32,
}

impl Geometry {
    /// Derive a geometry, rejecting inputs that cannot form a valid index
    pub fn new(
        bytes_per_page: usize,
        record_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
    ) -> Result<Self> {
        if bytes_per_page != BLOCK_SIZE {
            return Err(IndexError::Config(format!(
                "bytes_per_page must equal the block size {}, got {}",
                BLOCK_SIZE, bytes_per_page
            )));
        }
        if record_pages_per_chapter == 0 || record_pages_per_chapter > 1 << 16 {
            return Err(IndexError::Config(format!(
                "record_pages_per_chapter out of range: {}",
                record_pages_per_chapter
            )));
        }
        if chapters_per_volume < 2 {
            return Err(IndexError::Config(format!(
                "chapters_per_volume must be at least 2, got {}",
                chapters_per_volume
            )));
        }
        if sparse_chapters_per_volume + 2 > chapters_per_volume {
            return Err(IndexError::Config(format!(
                "{} sparse chapters leave fewer than 2 dense chapters out of {}",
                sparse_chapters_per_volume, chapters_per_volume
            )));
        }

        let records_per_page = (bytes_per_page / BYTES_PER_RECORD) as u32;
        let records_per_chapter = records_per_page * record_pages_per_chapter;
        let chapter_payload_bits = bits_per(u64::from(record_pages_per_chapter) - 1);
        let chapter_delta_list_bits = bits_per(u64::from(records_per_chapter - 1) | 63) - 6;
        let delta_lists_per_chapter = 1u32 << chapter_delta_list_bits;
        let chapter_address_bits =
            16 - chapter_delta_list_bits + bits_per(u64::from(records_per_chapter) - 1);

        let index_pages_per_chapter = chapter_index::estimate_index_pages(
            bytes_per_page,
            records_per_chapter,
            delta_lists_per_chapter,
            CHAPTER_MEAN_DELTA,
            chapter_address_bits,
            chapter_payload_bits,
        );
        let pages_per_chapter = index_pages_per_chapter + record_pages_per_chapter;
        let pages_per_volume = pages_per_chapter
            .checked_mul(chapters_per_volume)
            .ok_or_else(|| IndexError::Config("volume has too many pages".to_string()))?;

        Ok(Self {
            bytes_per_page,
            record_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            records_per_page,
            records_per_chapter,
            dense_chapters_per_volume: chapters_per_volume - sparse_chapters_per_volume,
            chapter_mean_delta: CHAPTER_MEAN_DELTA,
            chapter_payload_bits,
            chapter_delta_list_bits,
            delta_lists_per_chapter,
            chapter_address_bits,
            index_pages_per_chapter,
            pages_per_chapter,
            pages_per_volume,
        })
    }

    /// True when part of the volume only keeps sampled names in memory
    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    /// Physical page number of `page` within physical chapter `chapter`
    pub fn physical_page(&self, chapter: u32, page: u32) -> u32 {
        1 + chapter * self.pages_per_chapter + page
    }

    /// Number of addressable pages including the header page
    pub fn total_pages(&self) -> u32 {
        1 + self.pages_per_volume
    }

    /// Split a physical page back into (physical chapter, page in chapter)
    pub fn chapter_and_page(&self, physical_page: u32) -> Option<(u32, u32)> {
        if physical_page == 0 || physical_page > self.pages_per_volume {
            return None;
        }
        let relative = physical_page - 1;
        Some((
            relative / self.pages_per_chapter,
            relative % self.pages_per_chapter,
        ))
    }

    /// True for index pages, false for record pages
    pub fn is_index_page(&self, page_in_chapter: u32) -> bool {
        page_in_chapter < self.index_pages_per_chapter
    }
}
