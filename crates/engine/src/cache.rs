//! Weight-bounded LRU of loaded ranges
//!
//! Entries are keyed by file path and weighted by `Range::rough_size_bytes`.
//! An entry heavier than the cap is stored at the cap. Inserting evicts the
//! least recently used entries until the total weight fits again.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tidemark_storage::Range;

struct Entry {
    range: Arc<Range>,
    weight: u64,
}

struct Inner {
    lru: LruCache<String, Entry>,
    weight: u64,
}

/// Range cache bounded by total weight in bytes.
pub struct RangeCache {
    max_weight: u64,
    inner: Mutex<Inner>,
}

impl RangeCache {
    /// Cache holding at most `max_weight` bytes; 0 disables caching.
    pub fn new(max_weight: u64) -> Self {
        RangeCache {
            max_weight,
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                weight: 0,
            }),
        }
    }

    /// Insert or replace `key`, then evict down to the cap.
    pub fn add(&self, key: &str, range: Arc<Range>) {
        if self.max_weight == 0 {
            return;
        }
        let weight = range.rough_size_bytes().min(self.max_weight);

        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(key.to_string(), Entry { range, weight }) {
            inner.weight -= old.weight;
        }
        inner.weight += weight;

        while inner.weight > self.max_weight {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.weight -= evicted.weight,
                None => break,
            }
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<Range>> {
        self.inner.lock().lru.get(key).map(|e| Arc::clone(&e.range))
    }

    /// Drop `key` if cached.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(key) {
            inner.weight -= old.weight;
        }
    }

    /// Number of cached ranges.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current total weight.
    pub fn weight(&self) -> u64 {
        self.inner.lock().weight
    }

    /// Weight cap.
    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }
}
