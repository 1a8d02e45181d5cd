//! Storage layer for Tidemark
//!
//! This crate implements the per-range index:
//! - hash: offset-mixed 16/24-bit fingerprint hashes
//! - Bitmap: two-tier roaring postings with segment compaction
//! - Range: bitmap + key postings, join and scoring
//! - format: the range file codec and atomic writes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod format;
pub mod hash;
pub mod range;

pub use bitmap::{Bitmap, MergeResult};
pub use format::{RANGE_FORMAT_VERSION, RANGE_MAGIC, TEMP_SUFFIX};
pub use range::{JoinMetrics, Posting, Range};
