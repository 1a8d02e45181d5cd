//! Tidemark - time-partitioned approximate inverted index
//!
//! Tidemark answers "which recent seconds, and which keys, carry at least
//! one of these token fingerprints?" over halfday ranges persisted as
//! individual files.
//!
//! # Quick Start
//!
//! ```ignore
//! use tidemark::{fingerprint, Key, Manager};
//!
//! let manager = Manager::open("/data/index")?;
//!
//! // Index a document; returns once its batch is on disk
//! let fps: Vec<u32> = ["hello", "world"].iter().map(|t| fingerprint(t)).collect();
//! manager.saver()?.add(Key::from_u64(42), fps)?;
//!
//! // Find up to 10 keys, newest first
//! let mut seen = std::collections::HashSet::new();
//! let (hits, _metrics) = manager.collect(&[fingerprint("hello")], 10, &mut seen)?;
//! ```
//!
//! # Architecture
//!
//! - `tidemark-core`: keys, fingerprints, window constants, clock, errors, config
//! - `tidemark-storage`: the two-tier bitmap, ranges and their file format
//! - `tidemark-concurrency`: the save aggregator and single-flight loads
//! - `tidemark-engine`: the range directory manager and its cache

pub use tidemark_concurrency::{SaveAggregator, SaveCallback, SaveHandle, SingleFlight};
pub use tidemark_core::{
    fingerprint, Clock, Error, Fingerprint, IndexConfig, Key, KeyIdScore, ManualClock, Result,
    SystemClock, HALFDAY, SPAN,
};
pub use tidemark_engine::{Manager, ManagerBuilder, RangeCache};
pub use tidemark_storage::{Bitmap, JoinMetrics, MergeResult, Posting, Range};
