//! One half of the volume index
//!
//! A sub-index maps the volume index bytes of a name to the virtual chapter
//! that last saw it. Its delta lists are split into contiguous per-zone
//! ranges, each zone behind its own mutex.
//!
//! ## Entry layout
//! - key: the low `address_bits` of the volume index bytes
//! - value: the virtual chapter masked to `chapter_bits`
//!
//! Values are interpreted relative to each list's flush chapter, the oldest
//! chapter the list may still hold. Entries older than the window are removed
//! lazily the next time their list is touched.

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::chapter::ChapterWindow;
use crate::delta::{search, DeltaCode, DeltaEntry, DeltaZone, ListCode, ListCodec, StoreOutcome};
use crate::error::{IndexError, Result};
use crate::geometry::bits_per;
use crate::name::RecordName;

use super::{PutOutcome, SubIndexStats, VolumeIndexRecord};

/// Expected number of entries in one delta list
const DELTA_LIST_SIZE: u64 = 256;

/// Arena bytes reserved per list for alignment and growth
const LIST_SLACK_BYTES: u64 = 8;

/// Sizing of a sub-index, fixed at creation
#[derive(Debug, Clone)]
pub(crate) struct SubIndexParams {
    pub list_count: u32,
    pub zone_count: u32,
    pub address_bits: u32,
    pub chapter_bits: u32,
    /// Width of the retention window in chapters
    pub chapter_count: u32,
    /// Mean delta the lists are coded for
    pub mean_delta: u32,
    pub zone_bytes: usize,
    /// Arena use above this expires chapters early
    pub max_zone_bits: u64,
    /// Expected arena use of one chapter in one zone
    pub chapter_zone_bits: u64,
}

impl SubIndexParams {
    pub fn compute(
        entries_per_chapter: u32,
        chapter_count: u32,
        mean_delta: u32,
        min_delta_lists: u32,
        zone_count: u32,
    ) -> Self {
        let invalid = (chapter_count / 256).max(2);
        let rounded = u64::from(chapter_count + invalid);
        let entries = u64::from(entries_per_chapter.max(1)) * rounded;

        let list_count = (entries / DELTA_LIST_SIZE)
            .max(u64::from(min_delta_lists))
            .max(u64::from(zone_count)) as u32;
        let address_bits = bits_per(u64::from(mean_delta.max(1)) * DELTA_LIST_SIZE - 1);
        let chapter_bits = bits_per(rounded - 1);

        // Lists forced sparse by min_delta_lists are coded for their real density
        let per_list = (entries / u64::from(list_count)).max(1);
        let coding_mean = ((1u64 << address_bits) / per_list).clamp(1, u64::from(u32::MAX)) as u32;
        let code = DeltaCode::new(coding_mean);
        let entry_bits = u64::from(chapter_bits + code.estimated_bits());

        let mut total_bits = entries * entry_bits;
        total_bits += total_bits * 6 / 100;
        let total_bytes = total_bits.div_ceil(8) + u64::from(list_count) * LIST_SLACK_BYTES;
        let zone_bytes = total_bytes.div_ceil(u64::from(zone_count));
        let zone_bits = zone_bytes * 8;

        Self {
            list_count,
            zone_count,
            address_bits,
            chapter_bits,
            chapter_count,
            mean_delta: coding_mean,
            zone_bytes: zone_bytes as usize,
            max_zone_bits: zone_bits - zone_bits / 16,
            chapter_zone_bits: (u64::from(entries_per_chapter) * entry_bits
                / u64::from(zone_count))
            .max(1),
        }
    }

    pub fn chapter_mask(&self) -> u64 {
        (1u64 << self.chapter_bits) - 1
    }

    pub fn list_for(&self, name: &RecordName) -> u32 {
        ((name.volume_index_bytes() >> self.address_bits) % u64::from(self.list_count)) as u32
    }

    pub fn address_for(&self, name: &RecordName) -> u64 {
        name.volume_index_bytes() & ((1u64 << self.address_bits) - 1)
    }

    /// Zone owning `list`; the inverse of `zone_lists`
    pub fn zone_for_list(&self, list: u32) -> u32 {
        let zones = u64::from(self.zone_count);
        let owner = ((u64::from(list) + 1) * zones - 1) / u64::from(self.list_count);
        owner.min(zones - 1) as u32
    }

    /// First list and list count owned by `zone`
    ///
    /// Lists are split in proportion, so zone sizes differ by at most one.
    pub fn zone_lists(&self, zone: u32) -> (u32, u32) {
        let first = self.zone_boundary(zone);
        let end = self.zone_boundary(zone + 1);
        (first, end - first)
    }

    fn zone_boundary(&self, zone: u32) -> u32 {
        (u64::from(zone) * u64::from(self.list_count) / u64::from(self.zone_count)) as u32
    }

    /// Most lists any one zone owns
    pub fn max_zone_lists(&self) -> u32 {
        self.list_count.div_ceil(self.zone_count)
    }

    pub fn codec(&self) -> ListCodec {
        ListCodec::new(self.mean_delta, self.address_bits, self.chapter_bits)
    }
}

/// Running counters of one zone
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ZoneCounters {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub early_flushes: u64,
}

/// State of one zone of a sub-index
#[derive(Debug)]
pub(crate) struct SubIndexZone {
    pub delta: DeltaZone,
    /// Oldest chapter each list may still contain
    pub flush_chapters: Vec<u64>,
    pub window: ChapterWindow,
    pub counters: ZoneCounters,
}

impl SubIndexZone {
    pub fn new(params: &SubIndexParams, zone: u32) -> Self {
        let (first, count) = params.zone_lists(zone);
        Self {
            delta: DeltaZone::new(first, count, params.zone_bytes),
            flush_chapters: vec![0; count as usize],
            window: ChapterWindow::default(),
            counters: ZoneCounters::default(),
        }
    }

    fn slot(&self, list: u32) -> usize {
        (list - self.delta.first_list()) as usize
    }

    /// Virtual chapter of a stored value in list `list`
    fn chapter_of(&self, params: &SubIndexParams, list: u32, value: u32) -> u64 {
        let flush = self.flush_chapters[self.slot(list)];
        flush + (u64::from(value).wrapping_sub(flush) & params.chapter_mask())
    }

    fn decode(&self, codec: &ListCodec, list: u32) -> Result<Vec<DeltaEntry>> {
        let (bytes, bits) = self.delta.list(list);
        codec.decode(bytes, bits, ListCode::General)
    }

    fn store(&mut self, codec: &ListCodec, list: u32, entries: &[DeltaEntry]) -> StoreOutcome {
        let (data, bits) = codec.encode(entries, ListCode::General);
        self.delta.store(list, &data, bits)
    }

    /// Decode a list after discarding its expired entries
    fn entries(
        &mut self,
        params: &SubIndexParams,
        codec: &ListCodec,
        list: u32,
    ) -> Result<Vec<DeltaEntry>> {
        let mut entries = self.decode(codec, list)?;
        let slot = self.slot(list);
        if self.flush_chapters[slot] < self.window.low {
            if self.discard_expired(params, slot, &mut entries) > 0 {
                // Shrinking always fits in place
                self.store(codec, list, &entries);
            }
            self.flush_chapters[slot] = self.window.low;
        }
        Ok(entries)
    }

    fn discard_expired(
        &mut self,
        params: &SubIndexParams,
        slot: usize,
        entries: &mut Vec<DeltaEntry>,
    ) -> usize {
        let flush = self.flush_chapters[slot];
        let expire = self.window.low - flush;
        let mask = params.chapter_mask();

        let before = entries.len();
        let counters = &mut self.counters;
        entries.retain(|entry| {
            let relative = u64::from(entry.value).wrapping_sub(flush) & mask;
            if relative < expire {
                counters.discard_count += 1;
                counters.record_count -= 1;
                if entry.is_collision() {
                    counters.collision_count -= 1;
                }
                false
            } else {
                true
            }
        });

        // A surviving collision whose primary expired becomes the primary
        for i in 0..entries.len() {
            let first_of_key = i == 0 || entries[i - 1].key != entries[i].key;
            if first_of_key && entries[i].name.take().is_some() {
                counters.collision_count -= 1;
            }
        }
        before - entries.len()
    }

    fn flush_list(&mut self, params: &SubIndexParams, codec: &ListCodec, list: u32) -> Result<()> {
        self.entries(params, codec, list).map(|_| ())
    }

    /// Expired-but-unflushed lists whose values could become ambiguous
    fn flush_stale_lists(
        &mut self,
        params: &SubIndexParams,
        codec: &ListCodec,
        all: bool,
    ) -> Result<()> {
        let first = self.delta.first_list();
        let mask = params.chapter_mask();
        for slot in 0..self.flush_chapters.len() {
            let flush = self.flush_chapters[slot];
            if flush >= self.window.low {
                continue;
            }
            if all || self.window.high - flush > mask {
                self.flush_list(params, codec, first + slot as u32)?;
            }
        }
        Ok(())
    }
}

/// A zoned sub-index
pub(crate) struct SubIndex {
    pub params: SubIndexParams,
    pub codec: ListCodec,
    pub zones: Vec<Mutex<SubIndexZone>>,
}

impl SubIndex {
    pub fn new(params: SubIndexParams) -> Self {
        let zones = (0..params.zone_count)
            .map(|zone| Mutex::new(SubIndexZone::new(&params, zone)))
            .collect();
        Self {
            codec: params.codec(),
            params,
            zones,
        }
    }

    pub fn zone_of(&self, name: &RecordName) -> u32 {
        self.params.zone_for_list(self.params.list_for(name))
    }

    fn lock_for(&self, zone: u32, name: &RecordName) -> Result<MutexGuard<'_, SubIndexZone>> {
        let owner = self.zone_of(name);
        if zone != owner {
            return Err(IndexError::invalid(format!(
                "name belongs to zone {}, request came from zone {}",
                owner, zone
            )));
        }
        Ok(self.zones[zone as usize].lock())
    }

    fn check_window(zone: &SubIndexZone, chapter: u64) -> Result<()> {
        if !zone.window.contains(chapter) {
            return Err(IndexError::invalid(format!(
                "chapter {} outside window [{}, {}]",
                chapter, zone.window.low, zone.window.high
            )));
        }
        Ok(())
    }

    pub fn get_record(&self, zone: u32, name: &RecordName) -> Result<VolumeIndexRecord> {
        let mut guard = self.lock_for(zone, name)?;
        let list = self.params.list_for(name);
        let address = self.params.address_for(name);
        let entries = guard.entries(&self.params, &self.codec, list)?;

        Ok(match search(&entries, address, name) {
            Some((i, is_collision)) => VolumeIndexRecord {
                is_found: true,
                is_collision,
                virtual_chapter: guard.chapter_of(&self.params, list, entries[i].value),
            },
            None => VolumeIndexRecord::default(),
        })
    }

    pub fn put_record(&self, zone: u32, name: &RecordName, chapter: u64) -> Result<PutOutcome> {
        let mut guard = self.lock_for(zone, name)?;
        Self::check_window(&guard, chapter)?;
        let list = self.params.list_for(name);
        let address = self.params.address_for(name);
        let value = (chapter & self.params.chapter_mask()) as u32;
        let mut entries = guard.entries(&self.params, &self.codec, list)?;

        let outcome = match search(&entries, address, name) {
            Some((i, true)) => {
                entries[i].value = value;
                PutOutcome::Updated
            }
            Some((i, false)) => {
                entries.insert(
                    i + 1,
                    DeltaEntry {
                        key: address,
                        value,
                        name: Some(*name),
                    },
                );
                PutOutcome::Collision
            }
            None => {
                let pos = entries.partition_point(|e| e.key < address);
                entries.insert(pos, DeltaEntry::new(address, value));
                PutOutcome::Inserted
            }
        };

        if guard.store(&self.codec, list, &entries) == StoreOutcome::Overflow {
            guard.counters.overflow_count += 1;
            debug!(list, chapter, "volume index zone full, entry dropped");
            return Ok(PutOutcome::Overflow);
        }

        match outcome {
            PutOutcome::Inserted => guard.counters.record_count += 1,
            PutOutcome::Collision => {
                guard.counters.record_count += 1;
                guard.counters.collision_count += 1;
            }
            _ => {}
        }
        Ok(outcome)
    }

    pub fn set_record_chapter(&self, zone: u32, name: &RecordName, chapter: u64) -> Result<()> {
        let mut guard = self.lock_for(zone, name)?;
        Self::check_window(&guard, chapter)?;
        let list = self.params.list_for(name);
        let address = self.params.address_for(name);
        let mut entries = guard.entries(&self.params, &self.codec, list)?;

        let (i, _) = search(&entries, address, name)
            .ok_or_else(|| IndexError::invalid("no volume index entry to move"))?;
        entries[i].value = (chapter & self.params.chapter_mask()) as u32;
        // Values have a fixed width, so the list keeps its size
        if guard.store(&self.codec, list, &entries) == StoreOutcome::Overflow {
            guard.counters.overflow_count += 1;
            warn!(list, chapter, "volume index entry could not be moved");
        }
        Ok(())
    }

    pub fn remove_record(&self, zone: u32, name: &RecordName) -> Result<bool> {
        let mut guard = self.lock_for(zone, name)?;
        let list = self.params.list_for(name);
        let address = self.params.address_for(name);
        let mut entries = guard.entries(&self.params, &self.codec, list)?;

        let Some((i, is_collision)) = search(&entries, address, name) else {
            return Ok(false);
        };
        entries.remove(i);
        let promoted = !is_collision && i < entries.len() && entries[i].key == address;
        if promoted {
            // The first collision takes over as the primary entry
            entries[i].name = None;
        }
        if guard.store(&self.codec, list, &entries) == StoreOutcome::Overflow {
            guard.counters.overflow_count += 1;
            warn!(list, "volume index entry could not be removed");
            return Ok(false);
        }

        guard.counters.record_count -= 1;
        if is_collision || promoted {
            guard.counters.collision_count -= 1;
        }
        Ok(true)
    }

    /// Read-only lookup from any thread
    pub fn lookup_name(&self, name: &RecordName) -> Result<Option<u64>> {
        let zone = self.zone_of(name);
        let guard = self.zones[zone as usize].lock();
        let list = self.params.list_for(name);
        let address = self.params.address_for(name);
        let entries = guard.decode(&self.codec, list)?;

        Ok(search(&entries, address, name)
            .map(|(i, _)| guard.chapter_of(&self.params, list, entries[i].value))
            .filter(|chapter| guard.window.contains(*chapter)))
    }

    pub fn set_zone_open_chapter(&self, zone: u32, chapter: u64) -> Result<()> {
        let mut guard = self.zones[zone as usize].lock();
        if chapter < guard.window.high {
            return Err(IndexError::invalid(format!(
                "open chapter moved backwards from {} to {}",
                guard.window.high, chapter
            )));
        }

        let mut window = ChapterWindow::ending_at(chapter, self.params.chapter_count);
        window.low = window.low.max(guard.window.low);
        guard.window = window;

        let used = guard.delta.used_bits();
        let mut flush_all = false;
        if used > self.params.max_zone_bits {
            let expire = 1 + (used - self.params.max_zone_bits) / self.params.chapter_zone_bits;
            let low = (guard.window.low + expire).min(guard.window.high);
            let expired = low - guard.window.low;
            if expired > 0 {
                guard.window.low = low;
                guard.counters.early_flushes += expired;
                flush_all = true;
                warn!(
                    zone,
                    expired,
                    low,
                    used_bits = used,
                    "volume index zone over budget, expiring chapters early"
                );
            }
        }

        guard.flush_stale_lists(&self.params, &self.codec, flush_all)
    }

    pub fn window(&self, zone: u32) -> ChapterWindow {
        self.zones[zone as usize].lock().window
    }

    pub fn stats(&self) -> SubIndexStats {
        let mut stats = SubIndexStats {
            delta_lists: u64::from(self.params.list_count),
            ..SubIndexStats::default()
        };
        // Every zone is held so the counters form one snapshot
        let guards: Vec<_> = self.zones.iter().map(|zone| zone.lock()).collect();
        let mut used_bits = 0;
        for guard in &guards {
            stats.record_count += guard.counters.record_count;
            stats.collision_count += guard.counters.collision_count;
            stats.discard_count += guard.counters.discard_count;
            stats.overflow_count += guard.counters.overflow_count;
            stats.early_flushes += guard.counters.early_flushes;
            stats.rebalance_count += guard.delta.rebalance_count();
            stats.rebalance_time += guard.delta.rebalance_time();
            used_bits += guard.delta.used_bits();
        }
        stats.memory_used = used_bits.div_ceil(8);
        stats
    }

    /// Arena bytes allocated across all zones
    pub fn memory_allocated(&self) -> u64 {
        self.params.zone_bytes as u64 * u64::from(self.params.zone_count)
    }
}
