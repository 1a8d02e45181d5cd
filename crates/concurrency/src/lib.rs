//! Concurrency primitives for Tidemark
//!
//! - SaveAggregator: single-writer batching of concurrent adds into one
//!   persistence call per batch
//! - SingleFlight: collapses concurrent loads of the same key

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod singleflight;

pub use aggregator::{
    batch_deadline, SaveAggregator, SaveCallback, SaveHandle, DEFAULT_QUEUE_CAPACITY,
    MAX_BATCH_WINDOW,
};
pub use singleflight::SingleFlight;
