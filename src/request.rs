//! Request and response types
//!
//! Requests arrive already routed to a zone. A request that needs a page
//! which is not cached is parked on the page cache read queue and handed
//! back on its zone's restart channel once the read finishes.

use crate::error::Result;
use crate::name::{RecordData, RecordName};

/// What a request asks the index to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Look the name up without changing anything
    Query,
    /// Look the name up and record it in the open chapter if new
    Post,
    /// Store new metadata for the name
    Update,
    /// Forget the name
    Delete,
}

/// One index request
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub name: RecordName,
    pub zone: u32,
    pub kind: RequestKind,
    /// Metadata for `Post` and `Update`
    pub new_metadata: RecordData,
}

impl Request {
    pub fn new(id: u64, name: RecordName, zone: u32, kind: RequestKind) -> Self {
        Self {
            id,
            name,
            zone,
            kind,
            new_metadata: RecordData::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: RecordData) -> Self {
        self.new_metadata = metadata;
        self
    }
}

/// Result of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    pub found: bool,
    /// Chapter the name was found in
    pub virtual_chapter: Option<u64>,
    /// Metadata stored before this request
    pub old_metadata: Option<RecordData>,
}

/// What happened to a submitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Response),
    /// Waiting on a page read; the request comes back as a [`RequestRestart`]
    Queued,
    /// The read queue is full; resubmit later
    Busy,
}

/// A parked request being handed back to its zone
#[derive(Debug)]
pub struct RequestRestart {
    pub request: Request,
    /// Status of the page read the request waited on
    pub status: Result<()>,
}
