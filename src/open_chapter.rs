//! Open chapter
//!
//! Records posted since the last chapter closed, split by zone. Each zone
//! holds at most its share of a chapter; when any zone fills up the whole
//! chapter is closed and written to the volume.
//!
//! ## Save Format
//! ```text
//! [magic (8)][length (4)][bincode SavedOpenChapter][crc32 (4)]
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::geometry::{Geometry, BYTES_PER_RECORD};
use crate::name::{RecordData, RecordName};
use crate::record_page::Record;
use crate::storage::StreamCursor;

const OPEN_CHAPTER_MAGIC: &[u8; 8] = b"DOPENCH1";

/// One zone's part of the open chapter
#[derive(Debug, Default)]
pub struct OpenChapterZone {
    records: BTreeMap<RecordName, RecordData>,
    capacity: usize,
}

impl OpenChapterZone {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            capacity,
        }
    }

    pub fn search(&self, name: &RecordName) -> Option<RecordData> {
        self.records.get(name).copied()
    }

    /// Insert or overwrite; returns the previous metadata
    pub fn put(&mut self, name: RecordName, data: RecordData) -> Option<RecordData> {
        self.records.insert(name, data)
    }

    pub fn remove(&mut self, name: &RecordName) -> Option<RecordData> {
        self.records.remove(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Take every record, leaving the zone empty
    pub fn drain(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records).into_iter().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.records.iter().map(|(name, data)| (*name, *data))
    }
}

#[derive(Serialize, Deserialize)]
struct SavedOpenChapter {
    virtual_chapter: u64,
    records: Vec<Record>,
}

/// Upper bound on the saved size of an open chapter
pub fn compute_save_bytes(geometry: &Geometry) -> u64 {
    // bincode: chapter, vec length, then fixed size records
    let body = 8 + 8 + u64::from(geometry.records_per_chapter) * BYTES_PER_RECORD as u64;
    OPEN_CHAPTER_MAGIC.len() as u64 + 4 + body + 4
}

/// Save the records of every zone as `virtual_chapter`
pub fn save_open_chapter<W: Write>(
    writer: &mut W,
    virtual_chapter: u64,
    zones: &[&OpenChapterZone],
) -> Result<()> {
    let saved = SavedOpenChapter {
        virtual_chapter,
        records: zones.iter().flat_map(|zone| zone.records()).collect(),
    };
    let body = bincode::serialize(&saved)?;

    let mut buf = Vec::with_capacity(body.len() + 16);
    buf.put_slice(OPEN_CHAPTER_MAGIC);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    writer.write_all(&buf)?;
    Ok(())
}

/// Load a saved open chapter; returns its chapter number and records
pub fn load_open_chapter<R: Read>(reader: &mut R) -> Result<(u64, Vec<Record>)> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let mut cursor = StreamCursor::new(&data, "open chapter");
    if cursor.bytes(OPEN_CHAPTER_MAGIC.len())? != OPEN_CHAPTER_MAGIC {
        return Err(IndexError::format("bad open chapter magic"));
    }
    let len = cursor.u32()? as usize;
    let body = cursor.bytes(len)?;
    let consumed = data.len() - cursor.remaining();
    if crc32fast::hash(&data[..consumed]) != cursor.u32()? {
        return Err(IndexError::format("open chapter checksum mismatch"));
    }
    let saved: SavedOpenChapter = bincode::deserialize(body)
        .map_err(|e| IndexError::format(format!("bad open chapter: {}", e)))?;
    Ok((saved.virtual_chapter, saved.records))
}
