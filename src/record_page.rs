//! Record pages
//!
//! A record page is a sorted array of `records_per_page` (name, metadata)
//! pairs. Pages that are not full repeat their last record so the array stays
//! sorted without a count field.

use crate::error::{IndexError, Result};
use crate::geometry::{Geometry, BYTES_PER_RECORD};
use crate::name::{RecordData, RecordName, RECORD_NAME_SIZE};

/// One stored record
pub type Record = (RecordName, RecordData);

/// Build a page image from records sorted by name
pub fn encode_record_page(geometry: &Geometry, records: &[Record]) -> Vec<u8> {
    debug_assert!(records.len() <= geometry.records_per_page as usize);
    debug_assert!(records.windows(2).all(|w| w[0].0 <= w[1].0));

    let mut page = Vec::with_capacity(geometry.bytes_per_page);
    for (name, data) in records {
        page.extend_from_slice(name.as_bytes());
        page.extend_from_slice(&data.0);
    }
    let filler = records
        .last()
        .copied()
        .unwrap_or((RecordName([0xff; RECORD_NAME_SIZE]), RecordData::default()));
    while page.len() < geometry.records_per_page as usize * BYTES_PER_RECORD {
        page.extend_from_slice(filler.0.as_bytes());
        page.extend_from_slice(&filler.1 .0);
    }
    page.resize(geometry.bytes_per_page, 0);
    page
}

/// A decoded record page
#[derive(Debug)]
pub struct RecordPage {
    records: Vec<Record>,
}

impl RecordPage {
    pub fn parse(geometry: &Geometry, bytes: &[u8]) -> Result<Self> {
        let count = geometry.records_per_page as usize;
        if bytes.len() < count * BYTES_PER_RECORD {
            return Err(IndexError::format("record page is truncated"));
        }

        let mut records = Vec::with_capacity(count);
        for chunk in bytes[..count * BYTES_PER_RECORD].chunks_exact(BYTES_PER_RECORD) {
            let mut name = [0u8; RECORD_NAME_SIZE];
            let mut data = [0u8; BYTES_PER_RECORD - RECORD_NAME_SIZE];
            name.copy_from_slice(&chunk[..RECORD_NAME_SIZE]);
            data.copy_from_slice(&chunk[RECORD_NAME_SIZE..]);
            records.push((RecordName(name), RecordData(data)));
        }
        if records.windows(2).any(|w| w[0].0 > w[1].0) {
            return Err(IndexError::format("record page is not sorted"));
        }
        Ok(Self { records })
    }

    /// Metadata stored for `name`
    pub fn search(&self, name: &RecordName) -> Option<RecordData> {
        self.records
            .binary_search_by(|(candidate, _)| candidate.cmp(name))
            .ok()
            .map(|i| self.records[i].1)
    }
}
