//! Wall-time source
//!
//! The index reads time through the `Clock` trait so tests can drive it
//! deterministically. `SystemClock` anchors a monotonic `Instant` to the wall
//! clock once, at construction, so readings never go backwards even if the
//! system clock is adjusted.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic wall-time source.
pub trait Clock: Send + Sync {
    /// Nanoseconds since the unix epoch.
    fn unix_nanos(&self) -> i64;

    /// Milliseconds since the unix epoch.
    fn unix_millis(&self) -> i64 {
        self.unix_nanos() / 1_000_000
    }

    /// Seconds since the unix epoch.
    fn unix(&self) -> i64 {
        self.unix_nanos() / 1_000_000_000
    }

    /// Identifier of this server, for callers generating ids.
    fn server_id(&self) -> u32 {
        0
    }
}

/// Wall clock anchored to a monotonic timer.
#[derive(Debug)]
pub struct SystemClock {
    startup: Instant,
    startup_wall_nanos: i64,
    server_id: u32,
}

impl SystemClock {
    /// Create a clock anchored at the current wall time.
    pub fn new() -> Self {
        Self::with_server_id(0)
    }

    /// Create a clock reporting `server_id`.
    pub fn with_server_id(server_id: u32) -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        SystemClock {
            startup: Instant::now(),
            startup_wall_nanos: wall,
            server_id,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_nanos(&self) -> i64 {
        self.startup_wall_nanos + self.startup.elapsed().as_nanos() as i64
    }

    fn server_id(&self) -> u32 {
        self.server_id
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Clock set to `millis` milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        ManualClock {
            nanos: AtomicI64::new(millis * 1_000_000),
        }
    }

    /// Set the current time in milliseconds.
    pub fn set_millis(&self, millis: i64) {
        self.nanos.store(millis * 1_000_000, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis`.
    pub fn advance_millis(&self, millis: i64) {
        self.nanos.fetch_add(millis * 1_000_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
