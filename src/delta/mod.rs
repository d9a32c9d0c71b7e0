//! Delta List Module
//!
//! Compact encoding of sorted lists of small keys, shared by the volume
//! index (in-memory zone arenas) and by chapter index pages on disk.
//!
//! ## Components
//! - `bits`: little-endian bit streams
//! - `code`: the Golomb-style delta code
//! - `list`: entry encoding with the general and octet codes
//! - `zone`: per-zone arena with in-place rebalancing

mod bits;
mod code;
mod list;
mod zone;

pub use bits::{BitReader, BitWriter};
pub use code::DeltaCode;
pub use list::{search, DeltaEntry, ListCode, ListCodec, OpenDeltaList, OCTET_THRESHOLD};
pub use zone::{DeltaZone, StoreOutcome};
