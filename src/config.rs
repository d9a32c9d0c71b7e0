//! Configuration for the deduplication index
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{IndexError, Result};
use crate::geometry::{Geometry, MAX_ZONES};
use crate::storage::BLOCK_SIZE;

/// Main configuration for an index instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing file for the volume and the save region
    /// Internal structure:
    ///   [header page][chapter pages ...][state][page map][open chapter][zone streams]
    pub data_path: PathBuf,

    // -------------------------------------------------------------------------
    // Geometry Configuration
    // -------------------------------------------------------------------------
    /// Size of one volume page; must equal the storage block size
    pub bytes_per_page: usize,

    /// Record pages in each chapter
    pub record_pages_per_chapter: u32,

    /// Chapters held by the volume before the oldest is overwritten
    pub chapters_per_volume: u32,

    /// Oldest chapters that keep only sampled names in the volume index
    pub sparse_chapters_per_volume: u32,

    // -------------------------------------------------------------------------
    // Volume Index Configuration
    // -------------------------------------------------------------------------
    /// Number of zones, each served by one worker thread
    pub zone_count: u32,

    /// One name in this many is sampled into the hook sub-index
    pub sparse_sample_rate: u32,

    /// Expected gap between addresses in a volume index delta list
    pub volume_index_mean_delta: u32,

    /// Lower bound on the number of volume index delta lists
    pub min_delta_lists: u32,

    /// Identifies saved state as belonging to this index
    pub nonce: u64,

    // -------------------------------------------------------------------------
    // Page Cache Configuration
    // -------------------------------------------------------------------------
    /// Cache capacity, in chapters worth of pages
    pub cache_chapters: u32,

    /// Max queued page reads before requests are turned away
    pub read_queue_capacity: usize,

    /// Reader threads; 0 searches closed chapters synchronously
    pub read_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./dedupe_index.dat"),
            bytes_per_page: BLOCK_SIZE,
            record_pages_per_chapter: 64,
            chapters_per_volume: 256,
            sparse_chapters_per_volume: 0,
            zone_count: 1,
            sparse_sample_rate: 32,
            volume_index_mean_delta: 4096,
            min_delta_lists: 256,
            nonce: 0,
            cache_chapters: 7,
            read_queue_capacity: 64,
            read_threads: 2,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Derive the index geometry
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.bytes_per_page,
            self.record_pages_per_chapter,
            self.chapters_per_volume,
            self.sparse_chapters_per_volume,
        )
    }

    /// Check every parameter; returns the derived geometry
    pub fn validate(&self) -> Result<Geometry> {
        let geometry = self.geometry()?;
        if self.zone_count == 0 || self.zone_count > MAX_ZONES {
            return Err(IndexError::Config(format!(
                "zone_count must be between 1 and {}, got {}",
                MAX_ZONES, self.zone_count
            )));
        }
        if geometry.records_per_chapter < self.zone_count {
            return Err(IndexError::Config(format!(
                "{} zones cannot share a chapter of {} records",
                self.zone_count, geometry.records_per_chapter
            )));
        }
        if geometry.is_sparse() && self.sparse_sample_rate < 2 {
            return Err(IndexError::Config(format!(
                "sparse_sample_rate must be at least 2, got {}",
                self.sparse_sample_rate
            )));
        }
        if self.volume_index_mean_delta == 0 {
            return Err(IndexError::Config(
                "volume_index_mean_delta must be positive".to_string(),
            ));
        }
        if self.cache_chapters == 0 {
            return Err(IndexError::Config("cache_chapters must be positive".to_string()));
        }
        if self.read_queue_capacity == 0 {
            return Err(IndexError::Config(
                "read_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(geometry)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing file path
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_path = path.into();
        self
    }

    /// Set the page size (in bytes)
    pub fn bytes_per_page(mut self, bytes: usize) -> Self {
        self.config.bytes_per_page = bytes;
        self
    }

    /// Set the number of record pages per chapter
    pub fn record_pages_per_chapter(mut self, pages: u32) -> Self {
        self.config.record_pages_per_chapter = pages;
        self
    }

    /// Set the number of chapters in the volume
    pub fn chapters_per_volume(mut self, chapters: u32) -> Self {
        self.config.chapters_per_volume = chapters;
        self
    }

    /// Set how many of the oldest chapters are sparse
    pub fn sparse_chapters_per_volume(mut self, chapters: u32) -> Self {
        self.config.sparse_chapters_per_volume = chapters;
        self
    }

    /// Set the zone count
    pub fn zone_count(mut self, zones: u32) -> Self {
        self.config.zone_count = zones;
        self
    }

    /// Set the sparse sample rate
    pub fn sparse_sample_rate(mut self, rate: u32) -> Self {
        self.config.sparse_sample_rate = rate;
        self
    }

    /// Set the volume index mean delta
    pub fn volume_index_mean_delta(mut self, mean: u32) -> Self {
        self.config.volume_index_mean_delta = mean;
        self
    }

    /// Set the minimum number of volume index delta lists
    pub fn min_delta_lists(mut self, lists: u32) -> Self {
        self.config.min_delta_lists = lists;
        self
    }

    /// Set the index nonce
    pub fn nonce(mut self, nonce: u64) -> Self {
        self.config.nonce = nonce;
        self
    }

    /// Set the cache capacity (in chapters)
    pub fn cache_chapters(mut self, chapters: u32) -> Self {
        self.config.cache_chapters = chapters;
        self
    }

    /// Set the read queue capacity
    pub fn read_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.read_queue_capacity = capacity;
        self
    }

    /// Set the number of reader threads
    pub fn read_threads(mut self, threads: usize) -> Self {
        self.config.read_threads = threads;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
