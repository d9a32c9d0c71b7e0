//! Volume Index Module
//!
//! Maps record names to the virtual chapter that last saw them.
//!
//! ## Structure
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │ dense sub-index              │   │ hook sub-index (sparse only) │
//! │ unsampled names              │   │ sampled names                │
//! │ window = dense chapters      │   │ window = all chapters        │
//! │ zone 0 │ zone 1 │ ... zone N │   │ zone 0 │ zone 1 │ ... zone N │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Concurrency:
//! - Every zone of every sub-index has its own Mutex
//! - Zone operations only take their own zone's lock
//! - `lookup_name` may be called from any thread; it takes the hook zone's lock
//! - Whole-index operations (save, load, stats) take each lock in zone order

mod save;
mod sub_index;

use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::name::RecordName;

use sub_index::{SubIndex, SubIndexParams};

/// Result of looking up a name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeIndexRecord {
    /// An entry with the name's address exists
    pub is_found: bool,
    /// The entry is a collision entry recording exactly this name
    pub is_collision: bool,
    /// Chapter of the entry; meaningful only when `is_found`
    pub virtual_chapter: u64,
}

/// Result of `put_record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New primary entry
    Inserted,
    /// New collision entry after an existing entry with the same address
    Collision,
    /// An existing collision entry for this name got a new chapter
    Updated,
    /// The zone had no room; the entry was dropped
    Overflow,
}

/// Counters of one sub-index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub early_flushes: u64,
    pub rebalance_count: u64,
    pub rebalance_time: Duration,
    pub delta_lists: u64,
    /// Bytes of encoded list data
    pub memory_used: u64,
}

impl SubIndexStats {
    fn add(&mut self, other: &SubIndexStats) {
        self.record_count += other.record_count;
        self.collision_count += other.collision_count;
        self.discard_count += other.discard_count;
        self.overflow_count += other.overflow_count;
        self.early_flushes += other.early_flushes;
        self.rebalance_count += other.rebalance_count;
        self.rebalance_time += other.rebalance_time;
        self.delta_lists += other.delta_lists;
        self.memory_used += other.memory_used;
    }
}

/// Snapshot of volume index counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeIndexStats {
    pub dense: SubIndexStats,
    pub sparse: SubIndexStats,
}

impl VolumeIndexStats {
    /// Dense and sparse counters added together
    pub fn combined(&self) -> SubIndexStats {
        let mut total = self.dense;
        total.add(&self.sparse);
        total
    }
}

/// Parameters the volume index is built from
#[derive(Debug, Clone)]
pub struct VolumeIndexConfig {
    pub geometry: Geometry,
    pub zone_count: u32,
    pub sparse_sample_rate: u32,
    pub mean_delta: u32,
    pub min_delta_lists: u32,
    pub nonce: u64,
}

impl VolumeIndexConfig {
    pub fn from_config(config: &Config, geometry: Geometry) -> Self {
        Self {
            geometry,
            zone_count: config.zone_count,
            sparse_sample_rate: config.sparse_sample_rate,
            mean_delta: config.volume_index_mean_delta,
            min_delta_lists: config.min_delta_lists,
            nonce: config.nonce,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.zone_count == 0 || self.zone_count > crate::geometry::MAX_ZONES {
            return Err(IndexError::Config(format!(
                "zone count {} out of range",
                self.zone_count
            )));
        }
        if self.geometry.is_sparse() && self.sparse_sample_rate < 2 {
            return Err(IndexError::Config(
                "a sparse index needs a sample rate of at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sizing of the dense and hook sub-indexes for `zone_count` zones
fn plan(config: &VolumeIndexConfig, zone_count: u32) -> (SubIndexParams, Option<SubIndexParams>) {
    let geometry = &config.geometry;
    let records = geometry.records_per_chapter;

    if !geometry.is_sparse() {
        let dense = SubIndexParams::compute(
            records,
            geometry.chapters_per_volume,
            config.mean_delta,
            config.min_delta_lists,
            zone_count,
        );
        return (dense, None);
    }

    let sampled = (records / config.sparse_sample_rate).max(1);
    let dense = SubIndexParams::compute(
        records - sampled,
        geometry.dense_chapters_per_volume,
        config.mean_delta,
        config.min_delta_lists,
        zone_count,
    );
    let hook = SubIndexParams::compute(
        sampled,
        geometry.chapters_per_volume,
        config.mean_delta,
        config.min_delta_lists,
        zone_count,
    );
    (dense, Some(hook))
}

/// The zoned volume index
pub struct VolumeIndex {
    dense: SubIndex,
    hook: Option<SubIndex>,
    sample_rate: u32,
    zone_count: u32,
    nonce: u64,
}

impl VolumeIndex {
    pub fn new(config: &VolumeIndexConfig) -> Result<Self> {
        config.validate()?;
        let (dense, hook) = plan(config, config.zone_count);

        let index = Self {
            dense: SubIndex::new(dense),
            hook: hook.map(SubIndex::new),
            sample_rate: config.sparse_sample_rate,
            zone_count: config.zone_count,
            nonce: config.nonce,
        };
        info!(
            zones = index.zone_count,
            dense_lists = index.dense.params.list_count,
            sparse = index.hook.is_some(),
            memory = index.memory_allocated(),
            "volume index created"
        );
        Ok(index)
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// True when `name` belongs to the hook sub-index
    pub fn is_sample(&self, name: &RecordName) -> bool {
        self.hook.is_some() && u32::from(name.sampling_bytes()) % self.sample_rate == 0
    }

    fn sub_index_for(&self, name: &RecordName) -> &SubIndex {
        match &self.hook {
            Some(hook) if self.is_sample(name) => hook,
            _ => &self.dense,
        }
    }

    /// Zone that owns `name`
    pub fn zone_for_name(&self, name: &RecordName) -> u32 {
        self.sub_index_for(name).zone_of(name)
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    // =========================================================================
    // Zone Operations
    // =========================================================================

    /// Find the entry for `name`, discarding expired entries of its list first
    pub fn get_record(&self, zone: u32, name: &RecordName) -> Result<VolumeIndexRecord> {
        self.check_zone(zone)?;
        self.sub_index_for(name).get_record(zone, name)
    }

    /// Record that `name` was seen in `chapter`
    pub fn put_record(&self, zone: u32, name: &RecordName, chapter: u64) -> Result<PutOutcome> {
        self.check_zone(zone)?;
        self.sub_index_for(name).put_record(zone, name, chapter)
    }

    /// Move the entry found for `name` to `chapter`
    pub fn set_record_chapter(&self, zone: u32, name: &RecordName, chapter: u64) -> Result<()> {
        self.check_zone(zone)?;
        self.sub_index_for(name).set_record_chapter(zone, name, chapter)
    }

    /// Remove the entry found for `name`; false if there was none
    pub fn remove_record(&self, zone: u32, name: &RecordName) -> Result<bool> {
        self.check_zone(zone)?;
        self.sub_index_for(name).remove_record(zone, name)
    }

    /// Chapter of a sampled name, callable from any thread
    pub fn lookup_name(&self, name: &RecordName) -> Result<Option<u64>> {
        match &self.hook {
            Some(hook) if self.is_sample(name) => hook.lookup_name(name),
            _ => Ok(None),
        }
    }

    fn check_zone(&self, zone: u32) -> Result<()> {
        if zone >= self.zone_count {
            return Err(IndexError::invalid(format!(
                "zone {} out of range for {} zones",
                zone, self.zone_count
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Chapter Management
    // =========================================================================

    /// Advance every zone to `chapter`
    pub fn set_open_chapter(&self, chapter: u64) -> Result<()> {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, chapter)?;
        }
        Ok(())
    }

    /// Advance one zone to `chapter`; chapters never move backwards
    pub fn set_zone_open_chapter(&self, zone: u32, chapter: u64) -> Result<()> {
        self.check_zone(zone)?;
        self.dense.set_zone_open_chapter(zone, chapter)?;
        if let Some(hook) = &self.hook {
            hook.set_zone_open_chapter(zone, chapter)?;
        }
        Ok(())
    }

    /// Newest chapter the index has been opened to
    pub fn open_chapter(&self) -> u64 {
        self.dense.window(0).high
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn stats(&self) -> VolumeIndexStats {
        VolumeIndexStats {
            dense: self.dense.stats(),
            sparse: self.hook.as_ref().map(SubIndex::stats).unwrap_or_default(),
        }
    }

    /// Bytes of encoded list data
    pub fn memory_used(&self) -> u64 {
        self.stats().combined().memory_used
    }

    /// Bytes of arena allocated
    pub fn memory_allocated(&self) -> u64 {
        self.dense.memory_allocated()
            + self.hook.as_ref().map(SubIndex::memory_allocated).unwrap_or(0)
    }

    fn sub_indexes(&self) -> impl Iterator<Item = &SubIndex> {
        std::iter::once(&self.dense).chain(self.hook.iter())
    }
}
