//! Index configuration via `tidemark.toml`
//!
//! All fields have defaults, so an empty or missing file yields a working
//! configuration. There are no environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::limits::DENSE_SEGMENT_THRESHOLD;

/// Config file name placed in the index directory.
pub const CONFIG_FILE_NAME: &str = "tidemark.toml";

/// Index configuration.
///
/// # Example
///
/// ```toml
/// switch_limit = 1000000
/// cache_max_bytes = 268435456
/// dir_max_files = 0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Keys per range before the manager rotates to a fresh one.
    #[serde(default = "default_switch_limit")]
    pub switch_limit: u64,
    /// Weight cap of the range cache in bytes; 0 disables caching.
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    /// Keep at most this many range files, pruning the oldest; 0 keeps all.
    #[serde(default)]
    pub dir_max_files: usize,
    /// Per-segment low-tier population above which compaction keeps the high tier.
    #[serde(default = "default_dense_threshold")]
    pub dense_threshold: u64,
    /// Bound of the save aggregator input queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_switch_limit() -> u64 {
    1_000_000
}

fn default_cache_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_dense_threshold() -> u64 {
    DENSE_SEGMENT_THRESHOLD
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            switch_limit: default_switch_limit(),
            cache_max_bytes: default_cache_max_bytes(),
            dir_max_files: 0,
            dense_threshold: default_dense_threshold(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl IndexConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: IndexConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reject values the index cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.switch_limit == 0 {
            return Err(Error::Config("switch_limit must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.dense_threshold == 0 {
            return Err(Error::Config("dense_threshold must be positive".to_string()));
        }
        Ok(())
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tidemark index configuration
#
# Keys per range before rotating to a new range file.
switch_limit = 1000000

# Range cache weight cap in bytes (0 disables caching).
cache_max_bytes = 268435456

# Keep at most this many range files (0 = unlimited).
dir_max_files = 0

# Low-tier population of a 600s segment above which compaction keeps
# the 24-bit tier instead (default 600 * 4096).
dense_threshold = 2457600

# Save aggregator queue bound; producers block when it is full.
queue_capacity = 1000
"#
    }
}
