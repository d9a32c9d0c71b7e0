//! Volume index save and restore
//!
//! Each saving zone writes one self-contained stream. A restoring index may
//! have a different zone count: streams are merged back into one global list
//! table and redistributed by the restoring index's own list ownership.
//!
//! ## Stream Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ magic (8) │ sample rate │ zone │ zone count │ sub-indexes   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ per sub-index:                                              │
//! │   magic (4) │ nonce │ low │ high │ first list │ list count  │
//! │   total lists │ record count │ collision count              │
//! │   flush chapter (u64) × list count                          │
//! │   [list (u32) │ bits (u32) │ bytes] ... │ u32::MAX          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ crc32 of everything above                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//! All integers are little endian.

use std::io::{Read, Write};

use bytes::BufMut;
use parking_lot::MutexGuard;
use tracing::info;

use crate::chapter::ChapterWindow;
use crate::delta::{DeltaZone, ListCode};
use crate::error::{IndexError, Result};
use crate::storage::StreamCursor;

use super::sub_index::{SubIndex, SubIndexParams, SubIndexZone, ZoneCounters};
use super::{plan, VolumeIndex, VolumeIndexConfig};

const STREAM_MAGIC: &[u8; 8] = b"DVIDX-01";
const SUB_INDEX_MAGIC: &[u8; 4] = b"DSUB";
const END_OF_LISTS: u32 = u32::MAX;

const STREAM_HEADER_SIZE: u64 = 8 + 4 * 4;
const SUB_HEADER_SIZE: u64 = 4 + 8 * 3 + 4 * 3 + 8 * 2;
const LIST_HEADER_SIZE: u64 = 8;
const CRC_SIZE: u64 = 4;

/// One sub-index section of a parsed stream
struct SavedSubIndex {
    nonce: u64,
    window: ChapterWindow,
    first_list: u32,
    list_count: u32,
    total_lists: u32,
    record_count: u64,
    collision_count: u64,
    flush_chapters: Vec<u64>,
    lists: Vec<(u32, u64, Vec<u8>)>,
}

/// A parsed zone stream
struct SavedZone {
    sample_rate: u32,
    zone: u32,
    zone_count: u32,
    sub_indexes: Vec<SavedSubIndex>,
}

impl VolumeIndex {
    // =========================================================================
    // Save
    // =========================================================================

    /// Write one stream per zone; `writers.len()` must equal the zone count
    pub fn save<W: Write>(&self, writers: &mut [W]) -> Result<()> {
        if writers.len() != self.zone_count as usize {
            return Err(IndexError::invalid(format!(
                "{} writers for {} zones",
                writers.len(),
                self.zone_count
            )));
        }

        let sub_indexes: Vec<&SubIndex> = self.sub_indexes().collect();
        let guards: Vec<Vec<MutexGuard<'_, SubIndexZone>>> = sub_indexes
            .iter()
            .map(|sub| sub.zones.iter().map(|zone| zone.lock()).collect())
            .collect();

        let mut total = 0;
        for (zone, writer) in writers.iter_mut().enumerate() {
            let mut buf = Vec::new();
            buf.put_slice(STREAM_MAGIC);
            buf.put_u32_le(self.sample_rate);
            buf.put_u32_le(zone as u32);
            buf.put_u32_le(self.zone_count);
            buf.put_u32_le(sub_indexes.len() as u32);

            for (sub, zones) in sub_indexes.iter().zip(&guards) {
                encode_sub_index(&mut buf, sub, &zones[zone], self.nonce);
            }

            let crc = crc32fast::hash(&buf);
            buf.put_u32_le(crc);
            writer.write_all(&buf)?;
            total += buf.len();
        }

        info!(zones = self.zone_count, bytes = total, "volume index saved");
        Ok(())
    }

    /// Upper bound on the size of one zone stream when saving with `zone_count` zones
    pub fn compute_save_bytes(config: &VolumeIndexConfig, zone_count: u32) -> u64 {
        let (dense, hook) = plan(config, zone_count);
        let sub_bytes = |params: &SubIndexParams| {
            let lists = u64::from(params.max_zone_lists());
            SUB_HEADER_SIZE
                + lists * 8
                + lists * LIST_HEADER_SIZE
                + params.zone_bytes as u64
                + 4
        };
        STREAM_HEADER_SIZE + sub_bytes(&dense) + hook.as_ref().map(sub_bytes).unwrap_or(0) + CRC_SIZE
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Replace the contents of this index with saved streams
    ///
    /// The streams may come from an index with any zone count. Nothing is
    /// changed unless every stream validates.
    pub fn load<R: Read>(&self, readers: &mut [R]) -> Result<()> {
        if readers.is_empty() {
            return Err(IndexError::invalid("no volume index streams to load"));
        }

        let mut streams = Vec::with_capacity(readers.len());
        for reader in readers.iter_mut() {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            streams.push(parse_stream(&data)?);
        }
        streams.sort_by_key(|s| s.zone);

        let saved_zones = streams.len() as u32;
        let sub_indexes: Vec<&SubIndex> = self.sub_indexes().collect();
        for (i, stream) in streams.iter().enumerate() {
            if stream.zone != i as u32 || stream.zone_count != saved_zones {
                return Err(IndexError::format(format!(
                    "stream for zone {} of {} found among {} streams",
                    stream.zone, stream.zone_count, saved_zones
                )));
            }
            if stream.sample_rate != self.sample_rate {
                return Err(IndexError::format(format!(
                    "saved sample rate {} does not match {}",
                    stream.sample_rate, self.sample_rate
                )));
            }
            if stream.sub_indexes.len() != sub_indexes.len() {
                return Err(IndexError::format(format!(
                    "saved index has {} sub-indexes, expected {}",
                    stream.sub_indexes.len(),
                    sub_indexes.len()
                )));
            }
        }

        let mut staged = Vec::with_capacity(sub_indexes.len());
        for (k, sub) in sub_indexes.iter().enumerate() {
            let saved: Vec<&SavedSubIndex> = streams.iter().map(|s| &s.sub_indexes[k]).collect();
            staged.push(restore_sub_index(sub, &saved, self.nonce)?);
        }

        let mut guards: Vec<Vec<MutexGuard<'_, SubIndexZone>>> = sub_indexes
            .iter()
            .map(|sub| sub.zones.iter().map(|zone| zone.lock()).collect())
            .collect();
        for (zones, restored) in guards.iter_mut().zip(staged) {
            for (guard, zone) in zones.iter_mut().zip(restored) {
                **guard = zone;
            }
        }

        info!(
            saved_zones,
            zones = self.zone_count,
            "volume index loaded"
        );
        Ok(())
    }
}

fn encode_sub_index(buf: &mut Vec<u8>, sub: &SubIndex, zone: &SubIndexZone, nonce: u64) {
    let first = zone.delta.first_list();
    let count = zone.delta.list_count();

    buf.put_slice(SUB_INDEX_MAGIC);
    buf.put_u64_le(nonce);
    buf.put_u64_le(zone.window.low);
    buf.put_u64_le(zone.window.high);
    buf.put_u32_le(first);
    buf.put_u32_le(count);
    buf.put_u32_le(sub.params.list_count);
    buf.put_u64_le(zone.counters.record_count);
    buf.put_u64_le(zone.counters.collision_count);

    for flush in &zone.flush_chapters {
        buf.put_u64_le(*flush);
    }
    for list in first..first + count {
        let (bytes, bits) = zone.delta.list(list);
        if bits == 0 {
            continue;
        }
        buf.put_u32_le(list);
        buf.put_u32_le(bits as u32);
        buf.put_slice(bytes);
    }
    buf.put_u32_le(END_OF_LISTS);
}

fn parse_stream(data: &[u8]) -> Result<SavedZone> {
    let mut cursor = StreamCursor::new(data, "volume index stream");
    if cursor.bytes(STREAM_MAGIC.len())? != STREAM_MAGIC {
        return Err(IndexError::format("bad volume index stream magic"));
    }
    let sample_rate = cursor.u32()?;
    let zone = cursor.u32()?;
    let zone_count = cursor.u32()?;
    let sub_count = cursor.u32()?;
    if sub_count == 0 || sub_count > 2 {
        return Err(IndexError::format(format!("{} sub-indexes in stream", sub_count)));
    }

    let mut sub_indexes = Vec::with_capacity(sub_count as usize);
    for _ in 0..sub_count {
        sub_indexes.push(parse_sub_index(&mut cursor)?);
    }

    let consumed = data.len() - cursor.remaining();
    let stored_crc = cursor.u32()?;
    if crc32fast::hash(&data[..consumed]) != stored_crc {
        return Err(IndexError::format(format!(
            "checksum mismatch in volume index stream for zone {}",
            zone
        )));
    }

    Ok(SavedZone {
        sample_rate,
        zone,
        zone_count,
        sub_indexes,
    })
}

fn parse_sub_index(cursor: &mut StreamCursor<'_>) -> Result<SavedSubIndex> {
    if cursor.bytes(SUB_INDEX_MAGIC.len())? != SUB_INDEX_MAGIC {
        return Err(IndexError::format("bad sub-index magic"));
    }
    let nonce = cursor.u64()?;
    let low = cursor.u64()?;
    let high = cursor.u64()?;
    if low > high {
        return Err(IndexError::format(format!("inverted chapter window [{}, {}]", low, high)));
    }
    let first_list = cursor.u32()?;
    let list_count = cursor.u32()?;
    let total_lists = cursor.u32()?;
    if u64::from(first_list) + u64::from(list_count) > u64::from(total_lists) {
        return Err(IndexError::format("zone lists exceed the list count"));
    }
    let record_count = cursor.u64()?;
    let collision_count = cursor.u64()?;

    cursor.need(list_count as usize * 8)?;
    let mut flush_chapters = Vec::with_capacity(list_count as usize);
    for _ in 0..list_count {
        flush_chapters.push(cursor.u64()?);
    }

    let mut lists = Vec::new();
    let mut previous: Option<u32> = None;
    loop {
        let list = cursor.u32()?;
        if list == END_OF_LISTS {
            break;
        }
        if list < first_list || list - first_list >= list_count || previous >= Some(list) {
            return Err(IndexError::format(format!("unexpected list number {}", list)));
        }
        let bits = u64::from(cursor.u32()?);
        let data = cursor.bytes(bits.div_ceil(8) as usize)?.to_vec();
        lists.push((list, bits, data));
        previous = Some(list);
    }

    Ok(SavedSubIndex {
        nonce,
        window: ChapterWindow::new(low, high),
        first_list,
        list_count,
        total_lists,
        record_count,
        collision_count,
        flush_chapters,
        lists,
    })
}

/// Validate saved sections of one sub-index and lay them out in new zones
fn restore_sub_index(
    sub: &SubIndex,
    saved: &[&SavedSubIndex],
    nonce: u64,
) -> Result<Vec<SubIndexZone>> {
    let params = &sub.params;
    // Zones that expired chapters early have a higher low; their lists
    // were all flushed past it, so the lowest low is safe for every zone
    let low = saved.iter().map(|s| s.window.low).min().unwrap_or(0);
    let window = ChapterWindow::new(low, saved[0].window.high);
    let total = params.list_count as usize;

    let mut next_list = 0u32;
    for section in saved {
        if section.nonce != nonce {
            return Err(IndexError::format("volume index stream belongs to another index"));
        }
        if section.total_lists != params.list_count {
            return Err(IndexError::format(format!(
                "saved with {} delta lists, index has {}",
                section.total_lists, params.list_count
            )));
        }
        if section.window.high != window.high {
            return Err(IndexError::format("zone streams disagree on the open chapter"));
        }
        if section.first_list != next_list {
            return Err(IndexError::format(format!(
                "zone lists are not contiguous at list {}",
                next_list
            )));
        }
        next_list += section.list_count;
    }
    if next_list != params.list_count {
        return Err(IndexError::format(format!(
            "streams cover {} of {} delta lists",
            next_list, params.list_count
        )));
    }

    let mut flush_chapters = vec![0u64; total];
    let mut lists: Vec<(Vec<u8>, u64)> = vec![(Vec::new(), 0); total];
    let mut list_counters = vec![ZoneCounters::default(); total];
    let (mut records, mut collisions) = (0u64, 0u64);

    for section in saved {
        let first = section.first_list as usize;
        for (i, flush) in section.flush_chapters.iter().enumerate() {
            if *flush > window.high + 1 {
                return Err(IndexError::format(format!(
                    "flush chapter {} beyond window end {}",
                    flush, window.high
                )));
            }
            flush_chapters[first + i] = *flush;
        }
        for (list, bits, data) in &section.lists {
            let entries = sub.codec.decode(data, *bits, ListCode::General)?;
            let counters = &mut list_counters[*list as usize];
            counters.record_count = entries.len() as u64;
            counters.collision_count = entries.iter().filter(|e| e.is_collision()).count() as u64;
            lists[*list as usize] = (data.clone(), *bits);
        }
        records += section.record_count;
        collisions += section.collision_count;
    }

    let found_records: u64 = list_counters.iter().map(|c| c.record_count).sum();
    let found_collisions: u64 = list_counters.iter().map(|c| c.collision_count).sum();
    if found_records != records || found_collisions != collisions {
        return Err(IndexError::format(format!(
            "saved counts {}/{} do not match {}/{} decoded records/collisions",
            records, collisions, found_records, found_collisions
        )));
    }

    let mut zones = Vec::with_capacity(params.zone_count as usize);
    for zone in 0..params.zone_count {
        let (first, count) = params.zone_lists(zone);
        let range = first as usize..(first + count) as usize;
        let zone_lists = lists[range.clone()].to_vec();
        let delta = DeltaZone::restore(first, params.zone_bytes, zone_lists)?;

        let mut counters = ZoneCounters::default();
        for c in &list_counters[range.clone()] {
            counters.record_count += c.record_count;
            counters.collision_count += c.collision_count;
        }
        zones.push(SubIndexZone {
            delta,
            flush_chapters: flush_chapters[range].to_vec(),
            window,
            counters,
        });
    }
    Ok(zones)
}
