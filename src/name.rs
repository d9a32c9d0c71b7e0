//! Record names and metadata
//!
//! A record name is a 16 byte fingerprint of some content. Its bytes are
//! uniformly distributed, so different byte ranges feed different parts of
//! the index without any further hashing:
//!
//! ```text
//! bytes  0..8   volume index bytes   (list number + address in the volume index)
//! bytes  8..14  chapter index bytes  (list number + address in a chapter index)
//! bytes 14..16  sampling bytes       (sparse sampling decision)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;

/// Width of a record name in bytes
pub const RECORD_NAME_SIZE: usize = 16;

/// Width of record metadata in bytes
pub const RECORD_DATA_SIZE: usize = 16;

/// A 16 byte content fingerprint
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

/// Caller-supplied metadata stored alongside a name (typically a location)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordData(pub [u8; RECORD_DATA_SIZE]);

impl RecordName {
    /// Fingerprint arbitrary content with xxh3-128
    pub fn from_data(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_NAME_SIZE] {
        &self.0
    }

    /// Bytes used to place the name in the volume index
    pub fn volume_index_bytes(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[0..8]);
        u64::from_be_bytes(buf)
    }

    /// 48-bit value used to place the name in a chapter index
    pub fn chapter_index_bytes(&self) -> u64 {
        let high = u16::from_be_bytes([self.0[8], self.0[9]]);
        let low = u32::from_be_bytes([self.0[10], self.0[11], self.0[12], self.0[13]]);
        (u64::from(high) << 32) | u64::from(low)
    }

    /// Bytes used to decide whether the name is sampled
    pub fn sampling_bytes(&self) -> u16 {
        u16::from_be_bytes([self.0[14], self.0[15]])
    }

    /// Delta list holding this name inside a chapter index
    pub fn chapter_delta_list(&self, geometry: &Geometry) -> u32 {
        let list = self.chapter_index_bytes() >> geometry.chapter_address_bits;
        (list & (u64::from(geometry.delta_lists_per_chapter) - 1)) as u32
    }

    /// Key of this name inside its chapter delta list
    pub fn chapter_delta_address(&self, geometry: &Geometry) -> u64 {
        self.chapter_index_bytes() & ((1u64 << geometry.chapter_address_bits) - 1)
    }
}

impl fmt::Debug for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordName(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl RecordData {
    /// Metadata carrying a 64-bit value in its leading bytes
    pub fn from_u64(value: u64) -> Self {
        let mut data = [0u8; RECORD_DATA_SIZE];
        data[..8].copy_from_slice(&value.to_le_bytes());
        Self(data)
    }

    pub fn as_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Debug for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordData(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}
