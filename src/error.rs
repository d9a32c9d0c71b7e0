//! Error types for the deduplication index
//!
//! Provides a unified error type for all operations. Capacity conditions
//! (list overflow, a full read queue) are not errors; they are reported as
//! status values by the operations that hit them.

use thiserror::Error;

/// Result type alias using IndexError
pub type Result<T> = std::result::Result<T, IndexError>;

/// Unified error type for index operations
#[derive(Debug, Error)]
pub enum IndexError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing read failed; delivered to every request waiting on the page
    #[error("read of page {page} failed: {reason}")]
    ReadFailed { page: u32, reason: String },

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    /// Malformed, truncated, corrupt, or geometry-mismatched saved data
    #[error("Format error: {0}")]
    Format(String),

    // -------------------------------------------------------------------------
    // Contract Violations
    // -------------------------------------------------------------------------
    /// Wrong zone, chapter outside its window, page out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Index is shut down")]
    Shutdown,
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl IndexError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        IndexError::Format(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        IndexError::InvalidArgument(msg.into())
    }

    /// True for errors that describe bad persisted data
    pub fn is_format(&self) -> bool {
        matches!(self, IndexError::Format(_))
    }
}
