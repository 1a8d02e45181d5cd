//! Range management for Tidemark
//!
//! - Manager: a directory of range files with rotation of the current range,
//!   ascending and descending walks, and multi-range collection
//! - RangeCache: weight-bounded LRU of loaded ranges

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod manager;

pub use cache::RangeCache;
pub use manager::{
    file_name, parse_file_name, Manager, ManagerBuilder, ManagerEvents, OnLoaded, OnMissing,
    OnSaved,
};
