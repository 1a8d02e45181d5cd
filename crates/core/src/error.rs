//! Error types for Tidemark
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! `Error` is `Clone`: a single persistence result is delivered to every
//! waiter of a save batch, so I/O errors are kept behind an `Arc`.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Tidemark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the index
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Timestamp outside the range window `[base, base + halfday)`
    #[error("invalid timestamp: {ts}, base: {base}")]
    InvalidTimestamp {
        /// Offending timestamp (seconds)
        ts: i64,
        /// Range base time (seconds)
        base: i64,
    },

    /// Insert into a segment that has already been compacted
    #[error("segment {segment} is compacted (last compact: {last_compact})")]
    SegmentCompacted {
        /// Target segment index
        segment: u16,
        /// First writable segment
        last_compact: u16,
    },

    /// The current range cannot take more entries; rotate via the manager
    #[error("range full")]
    RangeFull,

    /// Malformed or truncated range file
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A file in the range directory is not a 16-digit hex name
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    /// A walk ran past the last range
    #[error("end of stream")]
    EndOfStream,

    /// The save aggregator no longer accepts tasks
    #[error("save aggregator closed")]
    Closed,

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Programming errors that must terminate the writer instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidTimestamp { .. } | Error::SegmentCompacted { .. }
        )
    }

    /// True for the walk termination sentinel.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    /// True when the underlying I/O error is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
