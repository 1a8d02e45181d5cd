//! Duplicate call suppression
//!
//! Concurrent callers asking for the same key share one execution of the
//! loader: the first caller runs it, the rest block on the same cell and
//! receive a clone of its result. The entry is dropped once the call
//! completes, so a later call runs the loader again.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// Collapses concurrent calls for the same key into one.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key` unless a call for `key` is already in flight, in
    /// which case wait for it. Returns the result and whether it was shared.
    pub fn call<F>(&self, key: &str, f: F) -> (T, bool)
    where
        F: FnOnce() -> T,
    {
        let cell = {
            let mut calls = self.calls.lock();
            Arc::clone(
                calls
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let mut ran = false;
        let value = cell
            .get_or_init(|| {
                ran = true;
                f()
            })
            .clone();

        if ran {
            let mut calls = self.calls.lock();
            if calls.get(key).map_or(false, |c| Arc::ptr_eq(c, &cell)) {
                calls.remove(key);
            }
        }
        (value, !ran)
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
