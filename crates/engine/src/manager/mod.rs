//! Range directory manager
//!
//! A manager owns one directory of range files named by the range start in
//! milliseconds as 16 lowercase hex digits, so lexical and numeric order
//! agree. Exactly one range is current: it is written through a
//! [`SaveAggregator`] and rotated once it holds `switch_limit` keys or its
//! halfday window has passed. Every other file is read only and served
//! through a weighted LRU, with concurrent loads of the same file collapsed
//! into one disk read.
//!
//! # Locking
//!
//! - `current` serializes rotation
//! - `files` serializes directory reloads
//! - `snapshot` is a read-mostly copy of the current range as of its last
//!   successful save, served to readers instead of the file
//!
//! The save callback runs on the aggregator worker and never takes
//! `current`, so rotation can close and join the old worker while holding it.

mod builder;

pub use builder::{ManagerBuilder, ManagerEvents, OnLoaded, OnMissing, OnSaved};

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tidemark_concurrency::{SaveAggregator, SaveCallback, SingleFlight};
use tidemark_core::{
    Clock, Error, Fingerprint, IndexConfig, Key, KeyIdScore, Result, CONFIG_FILE_NAME,
};
use tidemark_storage::{JoinMetrics, Range, TEMP_SUFFIX};
use tracing::{debug, info, warn};

use crate::cache::RangeCache;

/// File name of the range starting at `start_millis`.
pub fn file_name(start_millis: i64) -> String {
    format!("{:016x}", start_millis)
}

/// Parse a range file name back to its start in milliseconds.
pub fn parse_file_name(name: &str) -> Result<i64> {
    let valid = name.len() == 16 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !valid {
        return Err(Error::InvalidFilename(name.to_string()));
    }
    i64::from_str_radix(name, 16).map_err(|_| Error::InvalidFilename(name.to_string()))
}

type LoadResult = Result<Option<Arc<Range>>>;

struct Inner {
    dir: PathBuf,
    config: IndexConfig,
    clock: Arc<dyn Clock>,
    events: ManagerEvents,
    current: Mutex<Option<Arc<SaveAggregator>>>,
    snapshot: RwLock<Arc<Range>>,
    files: Mutex<Vec<i64>>,
    loader: SingleFlight<LoadResult>,
    cache: RangeCache,
}

impl Inner {
    fn path_for(&self, start: i64) -> PathBuf {
        self.dir.join(file_name(start))
    }

    fn new_range(&self, start_millis: i64) -> Range {
        Range::new(start_millis).with_dense_threshold(self.config.dense_threshold)
    }

    fn latest(&self) -> Option<i64> {
        self.files.lock().last().copied()
    }

    /// Largest file start strictly below `mark`.
    fn find_prev(&self, mark: i64) -> Option<i64> {
        let files = self.files.lock();
        let idx = files.partition_point(|&s| s < mark);
        idx.checked_sub(1).map(|i| files[i])
    }

    /// Smallest file start strictly above `mark`.
    fn find_next(&self, mark: i64) -> Option<i64> {
        let files = self.files.lock();
        let idx = files.partition_point(|&s| s <= mark);
        files.get(idx).copied()
    }

    fn should_seal(&self, range: &Range) -> bool {
        range.len() >= self.config.switch_limit
            || range.is_exhausted(self.clock.unix())
            || range.is_sealed()
    }

    fn save_callback(self: &Arc<Self>) -> SaveCallback {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |range: &Arc<Range>| -> Result<()> {
            let inner = weak.upgrade().ok_or(Error::Closed)?;
            let seal = inner.should_seal(range);
            inner.persist(range, seal).map(|_| ())
        })
    }

    fn spawn_saver(self: &Arc<Self>, range: Arc<Range>) -> Result<Arc<SaveAggregator>> {
        let agg = SaveAggregator::new(
            range,
            Arc::clone(&self.clock),
            self.config.queue_capacity,
            self.save_callback(),
        )?;
        Ok(Arc::new(agg))
    }

    /// Write `range` to its file and refresh the snapshot and file list.
    fn persist(&self, range: &Range, seal: bool) -> Result<usize> {
        let started = Instant::now();
        let path = self.path_for(range.start());

        let result = range.save(&path, seal).and_then(|bytes| {
            self.cache.remove(&path.to_string_lossy());
            let copy = Arc::new(range.clone());
            {
                let mut snapshot = self.snapshot.write();
                if snapshot.start() == range.start() {
                    *snapshot = copy;
                }
            }
            if self.latest() != Some(range.start()) {
                self.reload_files()?;
            }
            Ok(bytes)
        });

        let elapsed = started.elapsed();
        match &result {
            Ok(bytes) => debug!(
                target: "tidemark::manager",
                path = %path.display(),
                bytes,
                keys = range.len(),
                seal,
                elapsed_us = elapsed.as_micros() as u64,
                "range saved"
            ),
            Err(e) => warn!(
                target: "tidemark::manager",
                path = %path.display(),
                error = %e,
                "range save failed"
            ),
        }
        if let Some(hook) = &self.events.on_saved {
            hook(&path, *result.as_ref().unwrap_or(&0), result.as_ref().err(), elapsed);
        }
        result
    }

    fn reload_files(&self) -> Result<()> {
        let mut files = self.files.lock();

        let mut starts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) || name == CONFIG_FILE_NAME {
                continue;
            }
            match parse_file_name(&name) {
                Ok(start) => starts.push(start),
                Err(e) => {
                    warn!(
                        target: "tidemark::manager",
                        dir = %self.dir.display(),
                        name = %name,
                        "invalid file in range directory"
                    );
                    return Err(e);
                }
            }
        }
        starts.sort_unstable();

        let max = self.config.dir_max_files;
        if max > 0 && starts.len() > max {
            let current = self.snapshot.read().start();
            let excess = starts.len() - max;
            let mut pruned = 0;
            starts.retain(|&start| {
                if pruned >= excess || start == current {
                    return true;
                }
                let path = self.path_for(start);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        self.cache.remove(&path.to_string_lossy());
                        pruned += 1;
                        false
                    }
                    Err(e) => {
                        warn!(
                            target: "tidemark::manager",
                            path = %path.display(),
                            error = %e,
                            "failed to prune range file"
                        );
                        true
                    }
                }
            });
            if pruned > 0 {
                info!(target: "tidemark::manager", pruned, kept = starts.len(), "pruned range files");
            }
        }

        *files = starts;
        Ok(())
    }

    fn load(&self, offset: i64) -> LoadResult {
        {
            let snapshot = self.snapshot.read();
            if snapshot.start() == offset {
                return Ok(Some(Arc::clone(&snapshot)));
            }
        }

        let path = self.path_for(offset);
        let key = path.to_string_lossy().into_owned();
        if let Some(range) = self.cache.get(&key) {
            return Ok(Some(range));
        }

        let (result, shared) = self.loader.call(&key, || {
            // A flight that finished after our cache check has already cached it.
            if let Some(range) = self.cache.get(&key) {
                return Ok(Some(range));
            }
            let started = Instant::now();
            let range = match Range::load(&path) {
                Ok(range) => range.with_dense_threshold(self.config.dense_threshold),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            };
            let range = Arc::new(range);
            let elapsed = started.elapsed();
            debug!(
                target: "tidemark::manager",
                path = %path.display(),
                keys = range.len(),
                elapsed_us = elapsed.as_micros() as u64,
                "range loaded"
            );
            if let Some(hook) = &self.events.on_loaded {
                hook(&path, elapsed);
            }
            self.cache.add(&key, Arc::clone(&range));
            Ok(Some(range))
        });
        if shared {
            debug!(target: "tidemark::manager", offset, "joined in-flight load");
        }
        result
    }
}

/// Directory of ranges with rotation, walks and a range cache.
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Open `dir` with the config found in it, or defaults.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        ManagerBuilder::new().dir(dir).open()
    }

    /// Start configuring a manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub(crate) fn open_with(
        dir: PathBuf,
        config: IndexConfig,
        clock: Arc<dyn Clock>,
        events: ManagerEvents,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&dir)?;

        let inner = Arc::new(Inner {
            cache: RangeCache::new(config.cache_max_bytes),
            dir,
            config,
            clock,
            events,
            current: Mutex::new(None),
            snapshot: RwLock::new(Arc::new(Range::new(0))),
            files: Mutex::new(Vec::new()),
            loader: SingleFlight::new(),
        });
        inner.reload_files()?;

        // Resume the latest file; a full or expired one rotates on first saver().
        let latest = inner.latest();
        let range = match latest {
            Some(start) => Range::load(&inner.path_for(start))?
                .with_dense_threshold(inner.config.dense_threshold),
            None => inner.new_range(inner.clock.unix_millis()),
        };
        let range = Arc::new(range);
        *inner.snapshot.write() = Arc::new(Range::clone(&range));
        let agg = inner.spawn_saver(Arc::clone(&range))?;
        *inner.current.lock() = Some(agg);

        info!(
            target: "tidemark::manager",
            dir = %inner.dir.display(),
            files = inner.files.lock().len(),
            current = range.start(),
            keys = range.len(),
            "range manager opened"
        );
        Ok(Manager { inner })
    }

    /// Directory holding the range files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Effective configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.inner.config
    }

    /// Path of the file for the range starting at `start_millis`.
    pub fn path_for(&self, start_millis: i64) -> PathBuf {
        self.inner.path_for(start_millis)
    }

    /// The aggregator of the current range, rotating first once that range
    /// stops accepting keys.
    ///
    /// Rotation closes the old aggregator (draining queued tasks), seals the
    /// old range to disk and starts a new range at the current time. A failed
    /// seal is logged; the last batch save of the old range stays on disk.
    pub fn saver(&self) -> Result<Arc<SaveAggregator>> {
        let inner = &self.inner;
        let mut current = inner.current.lock();
        let old = match current.as_ref() {
            Some(agg) => Arc::clone(agg),
            None => return Err(Error::Closed),
        };
        let range = Arc::clone(old.range());
        let full = range.len() >= inner.config.switch_limit;
        let exhausted = range.is_exhausted(inner.clock.unix());
        let sealed = range.is_sealed();
        if !full && !exhausted && !sealed {
            return Ok(old);
        }

        *current = None;
        old.close();
        if !range.is_empty() && !sealed {
            if let Err(e) = inner.persist(&range, true) {
                warn!(
                    target: "tidemark::manager",
                    start = range.start(),
                    error = %e,
                    "failed to seal range on rotation"
                );
            }
        }

        let start = inner.clock.unix_millis().max(range.start() + 1);
        let next = Arc::new(inner.new_range(start));
        *inner.snapshot.write() = Arc::new(Range::clone(&next));
        let agg = inner.spawn_saver(Arc::clone(&next))?;
        *current = Some(Arc::clone(&agg));

        info!(
            target: "tidemark::manager",
            from = range.start(),
            to = start,
            keys = range.len(),
            full,
            exhausted,
            sealed,
            "rotated range"
        );
        Ok(agg)
    }

    /// Start of the latest range file, if any.
    pub fn last(&self) -> Option<i64> {
        self.inner.latest()
    }

    /// Number of range files known.
    pub fn file_count(&self) -> usize {
        self.inner.files.lock().len()
    }

    /// Re-read the directory listing.
    ///
    /// Temp files and the config file are skipped; any other name that is not
    /// 16 lowercase hex digits fails with `InvalidFilename`. With
    /// `dir_max_files` set the oldest files are deleted, never the current one.
    pub fn reload_files(&self) -> Result<()> {
        self.inner.reload_files()
    }

    /// The range starting at `offset`, or `None` if no such file exists.
    pub fn load(&self, offset: i64) -> Result<Option<Arc<Range>>> {
        self.inner.load(offset)
    }

    /// Copy of the current range as of its last successful save.
    pub fn current_snapshot(&self) -> Arc<Range> {
        Arc::clone(&self.inner.snapshot.read())
    }

    /// Visit ranges in ascending start order, beginning with the first file
    /// at or after `start`.
    ///
    /// Returns `Ok(())` when `visit` stops the walk and `Err(EndOfStream)`
    /// after the last file.
    pub fn walk_asc<F>(&self, start: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(&Arc<Range>) -> bool,
    {
        // 0 is never a file name.
        let mut start = start.max(1);
        loop {
            let Some(next) = self.inner.find_next(start - 1) else {
                return Err(Error::EndOfStream);
            };
            if let Some(range) = self.inner.load(next)? {
                if !visit(&range) {
                    return Ok(());
                }
            }
            start = next + 1;
        }
    }

    /// Visit ranges in descending start order, beginning with the last file
    /// at or before `start`.
    ///
    /// If every file is older than `start` and an `on_missing` hook is
    /// installed, the hook is asked first for a newer in-memory range; a range
    /// it returns that starts after the latest file and no later than `start`
    /// is visited before the files. The hook only supplies ranges newer than
    /// the directory; a `start` before the earliest file ends the walk with
    /// `EndOfStream` without consulting it.
    pub fn walk_desc<F>(&self, start: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(&Arc<Range>) -> bool,
    {
        let mut cursor = start;

        if let Some(hook) = &self.inner.events.on_missing {
            let latest = self.inner.latest();
            if latest.map_or(true, |l| l < start) {
                if let Some(range) = hook(start)? {
                    if range.start() <= start && latest.map_or(true, |l| range.start() > l) {
                        if !visit(&range) {
                            return Ok(());
                        }
                        cursor = range.start() - 1;
                    }
                }
            }
        }

        loop {
            let Some(prev) = self.inner.find_prev(cursor + 1) else {
                return Err(Error::EndOfStream);
            };
            if let Some(range) = self.inner.load(prev)? {
                if !visit(&range) {
                    return Ok(());
                }
            }
            cursor = prev - 1;
        }
    }

    /// Join `query` against ranges from now backwards until `n` distinct keys
    /// are found.
    ///
    /// Keys already in `dedup` are skipped and every emitted key is added to
    /// it, so a caller can page by passing the same set again. Returns the
    /// results newest first and the join metrics of each visited range.
    pub fn collect(
        &self,
        query: &[Fingerprint],
        n: usize,
        dedup: &mut HashSet<Key>,
    ) -> Result<(Vec<KeyIdScore>, Vec<JoinMetrics>)> {
        let mut results = Vec::new();
        let mut metrics = Vec::new();
        if n == 0 {
            return Ok((results, metrics));
        }

        let walked = self.walk_desc(self.inner.clock.unix_millis(), |range| {
            let jm = range.join(query, None, true, |kis| {
                if dedup.insert(kis.key) {
                    results.push(kis);
                }
                results.len() < n
            });
            metrics.push(jm);
            results.len() < n
        });
        match walked {
            Ok(()) => {}
            Err(e) if e.is_end_of_stream() => {}
            Err(e) => return Err(e),
        }
        Ok((results, metrics))
    }

    /// Drain and stop the current aggregator. Later `saver()` calls fail
    /// with `Closed`. Idempotent.
    pub fn close(&self) {
        let agg = self.inner.current.lock().take();
        if let Some(agg) = agg {
            agg.close();
            debug!(target: "tidemark::manager", start = agg.range().start(), "range manager closed");
        }
    }

    /// Number of cached ranges and their total weight.
    pub fn cache_stats(&self) -> (usize, u64) {
        (self.inner.cache.len(), self.inner.cache.weight())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let saver = self
            .inner
            .current
            .lock()
            .as_ref()
            .map_or(0.0, |agg| agg.metrics());
        write!(
            f,
            "files: {}, saver: {:.1}, cache: {}({}b)",
            self.file_count(),
            saver,
            self.inner.cache.len(),
            self.inner.cache.weight()
        )
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("dir", &self.inner.dir)
            .field("files", &self.file_count())
            .field("current", &self.current_snapshot().start())
            .finish()
    }
}
