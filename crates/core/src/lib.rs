//! Core types for Tidemark
//!
//! This crate defines the foundational types shared by every layer:
//! - Key: opaque 128-bit document identifier
//! - Fingerprint: 32-bit token hash, the unit of indexing
//! - KeyIdScore: a joined key with its timestamp and relevance score
//! - Window constants (halfday ranges, 600s segments, dense threshold)
//! - Clock: wall-time source contract
//! - Error: error type hierarchy
//! - IndexConfig: TOML-backed configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod limits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IndexConfig, CONFIG_FILE_NAME};
pub use error::{Error, Result};
pub use key::{fingerprint, Fingerprint, Key, KeyIdScore, KEY_SIZE};
pub use limits::{align_to_window, DENSE_SEGMENT_THRESHOLD, HALFDAY, SEGMENTS, SPAN};
