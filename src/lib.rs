//! # dedupe-index
//!
//! A zoned deduplication index for block fingerprints with:
//! - A delta-encoded, zoned volume index mapping names to chapters
//! - A ring of closed chapters on block storage
//! - An index page map locating chapter index pages
//! - A page cache with a bounded asynchronous read queue
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Requests (one worker per zone)               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Engine                                │
//! │          (open chapter per zone, chapter rotation)           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │Volume Index │          │   Volume    │
//!   │ (per zone)  │          │ (page map)  │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                                   ▼
//!                           ┌─────────────┐
//!                           │ Page Cache  │
//!                           │ (readers)   │
//!                           └──────┬──────┘
//!                                  ▼
//!                           ┌─────────────┐
//!                           │BlockStorage │
//!                           └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod geometry;
pub mod name;
pub mod chapter;

pub mod storage;
pub mod delta;
pub mod volume_index;
pub mod chapter_index;
pub mod record_page;
pub mod page_map;
pub mod cache;
pub mod volume;
pub mod sparse_cache;
pub mod open_chapter;
pub mod layout;
pub mod request;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{IndexError, Result};
pub use config::Config;
pub use engine::{Engine, IndexStats};
pub use geometry::Geometry;
pub use name::{RecordData, RecordName};
pub use request::{Outcome, Request, RequestKind, RequestRestart, Response};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of dedupe-index
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
