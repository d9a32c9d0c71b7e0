//! Delta list encoding
//!
//! A delta list is a sorted bucket of entries. Each entry has a key (an
//! address), a small value (a chapter number or a record page number), and
//! a full record name when its key repeats the previous key.
//!
//! ## General code
//! ```text
//! [value: value_bits][delta code][name: 128 bits, collisions only] ...
//! ```
//! ## Octet code (lists of more than 32 entries)
//! ```text
//! [key: key_bytes][value: value_bytes][name: 16 bytes, collisions only] ...
//! ```

use crate::error::{IndexError, Result};
use crate::name::{RecordName, RECORD_NAME_SIZE};

use super::bits::{BitReader, BitWriter};
use super::code::DeltaCode;

/// Lists with more entries than this are packed with the octet code
pub const OCTET_THRESHOLD: usize = 32;

/// One decoded delta list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    pub key: u64,
    pub value: u32,
    /// Set exactly when the entry repeats the previous entry's key
    pub name: Option<RecordName>,
}

impl DeltaEntry {
    pub fn new(key: u64, value: u32) -> Self {
        Self {
            key,
            value,
            name: None,
        }
    }

    pub fn is_collision(&self) -> bool {
        self.name.is_some()
    }
}

/// Which code a packed list uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCode {
    General = 0,
    Octet = 1,
}

impl ListCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ListCode::General),
            1 => Ok(ListCode::Octet),
            other => Err(IndexError::format(format!("unknown list code {}", other))),
        }
    }

    /// Code used for a page-packed list of `entries` entries
    pub fn for_len(entries: usize) -> Self {
        if entries > OCTET_THRESHOLD {
            ListCode::Octet
        } else {
            ListCode::General
        }
    }
}

/// Encodes and decodes lists with fixed key and value widths
#[derive(Debug, Clone, Copy)]
pub struct ListCodec {
    code: DeltaCode,
    key_bits: u32,
    value_bits: u32,
}

impl ListCodec {
    pub fn new(mean_delta: u32, key_bits: u32, value_bits: u32) -> Self {
        debug_assert!(value_bits <= 32);
        Self {
            code: DeltaCode::new(mean_delta),
            key_bits,
            value_bits,
        }
    }

    pub fn code(&self) -> &DeltaCode {
        &self.code
    }

    pub fn value_bits(&self) -> u32 {
        self.value_bits
    }

    fn key_bytes(&self) -> usize {
        self.key_bits.div_ceil(8) as usize
    }

    fn value_bytes(&self) -> usize {
        self.value_bits.div_ceil(8) as usize
    }

    /// Size of `entries` in `code`, in bits, without writing anything
    pub fn encoded_bits(&self, entries: &[DeltaEntry], code: ListCode) -> u64 {
        match code {
            ListCode::General => {
                let mut previous = 0;
                let mut bits = 0;
                for entry in entries {
                    bits += u64::from(self.value_bits) + self.code.bits_for(entry.key - previous);
                    if entry.is_collision() {
                        bits += RECORD_NAME_SIZE as u64 * 8;
                    }
                    previous = entry.key;
                }
                bits
            }
            ListCode::Octet => {
                let per_entry = (self.key_bytes() + self.value_bytes()) as u64;
                let collisions = entries.iter().filter(|e| e.is_collision()).count() as u64;
                (entries.len() as u64 * per_entry + collisions * RECORD_NAME_SIZE as u64) * 8
            }
        }
    }

    /// Encode with the general code into an existing writer
    pub fn encode_general(&self, entries: &[DeltaEntry], writer: &mut BitWriter) {
        let mut previous = 0;
        for (i, entry) in entries.iter().enumerate() {
            debug_assert!(entry.key >= previous);
            let delta = entry.key - previous;
            writer.write(u64::from(entry.value), self.value_bits);
            self.code.encode(writer, delta);
            if i > 0 && delta == 0 {
                debug_assert!(entry.is_collision());
                let name = entry.name.unwrap_or(RecordName([0u8; RECORD_NAME_SIZE]));
                writer.write_bytes(name.as_bytes());
            }
            previous = entry.key;
        }
    }

    /// Encode `entries` with `code`; returns the bytes and the exact bit length
    pub fn encode(&self, entries: &[DeltaEntry], code: ListCode) -> (Vec<u8>, u64) {
        match code {
            ListCode::General => {
                let mut writer = BitWriter::new();
                self.encode_general(entries, &mut writer);
                writer.into_parts()
            }
            ListCode::Octet => {
                let mut out = Vec::with_capacity(
                    entries.len() * (self.key_bytes() + self.value_bytes()),
                );
                let mut previous: Option<u64> = None;
                for entry in entries {
                    out.extend_from_slice(&entry.key.to_le_bytes()[..self.key_bytes()]);
                    out.extend_from_slice(&entry.value.to_le_bytes()[..self.value_bytes()]);
                    if previous == Some(entry.key) {
                        let name = entry.name.unwrap_or(RecordName([0u8; RECORD_NAME_SIZE]));
                        out.extend_from_slice(name.as_bytes());
                    }
                    previous = Some(entry.key);
                }
                let bits = out.len() as u64 * 8;
                (out, bits)
            }
        }
    }

    /// Decode and validate a list
    pub fn decode(&self, bytes: &[u8], bits: u64, code: ListCode) -> Result<Vec<DeltaEntry>> {
        match code {
            ListCode::General => self.decode_general(bytes, bits),
            ListCode::Octet => self.decode_octet(bytes, bits),
        }
    }

    fn decode_general(&self, bytes: &[u8], bits: u64) -> Result<Vec<DeltaEntry>> {
        let mut reader = BitReader::new(bytes, bits)?;
        let mut entries = Vec::new();
        let mut key = 0u64;
        while !reader.at_end() {
            let value = reader.read(self.value_bits)? as u32;
            let delta = self.code.decode(&mut reader)?;
            key = key
                .checked_add(delta)
                .ok_or_else(|| IndexError::format("delta list key overflows"))?;
            self.check_key(key)?;
            let name = if !entries.is_empty() && delta == 0 {
                Some(RecordName(reader.read_bytes::<RECORD_NAME_SIZE>()?))
            } else {
                None
            };
            entries.push(DeltaEntry { key, value, name });
        }
        Ok(entries)
    }

    fn decode_octet(&self, bytes: &[u8], bits: u64) -> Result<Vec<DeltaEntry>> {
        if bits % 8 != 0 || bits / 8 > bytes.len() as u64 {
            return Err(IndexError::format("octet list is not byte aligned"));
        }
        let data = &bytes[..(bits / 8) as usize];
        let key_bytes = self.key_bytes();
        let value_bytes = self.value_bytes();
        let mut entries: Vec<DeltaEntry> = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if pos + key_bytes + value_bytes > data.len() {
                return Err(IndexError::format("octet list ends inside an entry"));
            }
            let mut key_buf = [0u8; 8];
            key_buf[..key_bytes].copy_from_slice(&data[pos..pos + key_bytes]);
            pos += key_bytes;
            let mut value_buf = [0u8; 4];
            value_buf[..value_bytes].copy_from_slice(&data[pos..pos + value_bytes]);
            pos += value_bytes;

            let key = u64::from_le_bytes(key_buf);
            let value = u32::from_le_bytes(value_buf);
            self.check_key(key)?;
            if self.value_bits < 32 && value >> self.value_bits != 0 {
                return Err(IndexError::format("octet list value out of range"));
            }

            let name = match entries.last() {
                Some(last) if last.key > key => {
                    return Err(IndexError::format("octet list keys are not sorted"));
                }
                Some(last) if last.key == key => {
                    if pos + RECORD_NAME_SIZE > data.len() {
                        return Err(IndexError::format("octet list ends inside a name"));
                    }
                    let mut name = [0u8; RECORD_NAME_SIZE];
                    name.copy_from_slice(&data[pos..pos + RECORD_NAME_SIZE]);
                    pos += RECORD_NAME_SIZE;
                    Some(RecordName(name))
                }
                _ => None,
            };
            entries.push(DeltaEntry { key, value, name });
        }
        Ok(entries)
    }

    fn check_key(&self, key: u64) -> Result<()> {
        if self.key_bits < 64 && key >> self.key_bits != 0 {
            return Err(IndexError::format(format!(
                "delta list key {} exceeds {} bits",
                key, self.key_bits
            )));
        }
        Ok(())
    }
}

/// Find the entry for `key`, preferring a collision entry that names `name`
///
/// Returns the index and whether the match is an exact collision entry.
pub fn search(entries: &[DeltaEntry], key: u64, name: &RecordName) -> Option<(usize, bool)> {
    let first = entries.partition_point(|e| e.key < key);
    if first == entries.len() || entries[first].key != key {
        return None;
    }
    let exact = entries[first + 1..]
        .iter()
        .take_while(|e| e.key == key)
        .position(|e| e.name.as_ref() == Some(name));
    match exact {
        Some(offset) => Some((first + 1 + offset, true)),
        None => Some((first, false)),
    }
}

/// A delta list being built in memory, always sorted by key
#[derive(Debug, Clone, Default)]
pub struct OpenDeltaList {
    entries: Vec<DeltaEntry>,
}

impl OpenDeltaList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry whose key is at least the last key; amortized O(1)
    ///
    /// Out of order keys fall back to [`merge`](Self::merge).
    pub fn append(&mut self, key: u64, value: u32, name: &RecordName) {
        match self.entries.last() {
            Some(last) if last.key > key => self.merge(key, value, name),
            Some(last) => {
                let name = (last.key == key).then_some(*name);
                self.entries.push(DeltaEntry { key, value, name });
            }
            None => self.entries.push(DeltaEntry::new(key, value)),
        }
    }

    /// Insert an entry at its sorted position, after any equal keys
    pub fn merge(&mut self, key: u64, value: u32, name: &RecordName) {
        let pos = self.entries.partition_point(|e| e.key <= key);
        let collision = pos > 0 && self.entries[pos - 1].key == key;
        self.entries.insert(
            pos,
            DeltaEntry {
                key,
                value,
                name: collision.then_some(*name),
            },
        );
    }

    pub fn entries(&self) -> &[DeltaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries past `len`; the remaining prefix is still well formed
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
