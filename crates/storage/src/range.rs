//! Range: one halfday bitmap plus the keys indexed into it
//!
//! The bitmap answers "which seconds might match"; the postings map those
//! seconds back to keys and score each key by its exact fingerprint overlap
//! with the query, which also filters out hash false positives.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tidemark_core::{Fingerprint, Key, KeyIdScore, Result, HALFDAY, SEGMENTS, SPAN};

use crate::bitmap::Bitmap;
use crate::format;

/// One indexed document: its key, the second it was added at (relative to
/// the range base) and its fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Document key
    pub key: Key,
    /// Seconds since the range base time
    pub offset: u16,
    /// Sorted, deduplicated fingerprints
    pub fps: Vec<Fingerprint>,
}

#[derive(Clone, Default)]
struct Postings {
    entries: Vec<Posting>,
    /// offset -> indices into `entries`, in insertion order
    by_offset: BTreeMap<u16, Vec<u32>>,
    last_offset: Option<u16>,
}

impl Postings {
    fn push(&mut self, posting: Posting) {
        let idx = self.entries.len() as u32;
        self.by_offset.entry(posting.offset).or_default().push(idx);
        self.last_offset = Some(self.last_offset.map_or(posting.offset, |o| o.max(posting.offset)));
        self.entries.push(posting);
    }
}

/// Counters reported by `Range::join`.
#[derive(Debug, Clone, Default)]
pub struct JoinMetrics {
    /// Range start in unix milliseconds
    pub start: i64,
    /// Range window start in unix seconds
    pub base_time: i64,
    /// Whether candidates were visited newest first
    pub desc: bool,
    /// Distinct fingerprints in the query
    pub query_len: usize,
    /// Candidate seconds produced by the bitmap merge
    pub candidates: usize,
    /// Candidate seconds actually scanned before stopping
    pub scanned: usize,
    /// Keys whose fingerprints were compared
    pub examined: usize,
    /// Keys handed to the visitor
    pub emitted: usize,
    /// Time spent in the bitmap merge
    pub merge_elapsed: Duration,
    /// Total time spent in the join
    pub elapsed: Duration,
}

impl fmt::Display for JoinMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "join range [{}] base {} ({}) in {}us: query={}, candidates={} (scanned {}), keys examined={}, emitted={}, merge={}us",
            self.start,
            self.base_time,
            if self.desc { "desc" } else { "asc" },
            self.elapsed.as_micros(),
            self.query_len,
            self.candidates,
            self.scanned,
            self.examined,
            self.emitted,
            self.merge_elapsed.as_micros()
        )?;
        if self.emitted == 0 {
            write!(f, " (NO HITS)")?;
        }
        Ok(())
    }
}

/// A halfday bitmap and the key → fingerprints records added into it.
pub struct Range {
    start: i64,
    bitmap: Bitmap,
    postings: RwLock<Postings>,
}

impl Range {
    /// Empty range starting at `start_millis`; its bitmap covers the
    /// halfday window containing that instant.
    pub fn new(start_millis: i64) -> Self {
        Range {
            start: start_millis,
            bitmap: Bitmap::new(start_millis.div_euclid(1000)),
            postings: RwLock::new(Postings::default()),
        }
    }

    /// Override the bitmap's dense threshold.
    pub fn with_dense_threshold(mut self, threshold: u64) -> Self {
        self.bitmap = self.bitmap.with_dense_threshold(threshold);
        self
    }

    /// Range start in unix milliseconds; also its file name.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Window start in unix seconds.
    pub fn base_time(&self) -> i64 {
        self.bitmap.base_time()
    }

    /// First unix second past the window.
    pub fn end_time(&self) -> i64 {
        self.bitmap.base_time() + HALFDAY
    }

    /// The underlying bitmap.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Number of keys added.
    pub fn len(&self) -> u64 {
        self.postings.read().entries.len() as u64
    }

    /// True if no key has been added.
    pub fn is_empty(&self) -> bool {
        self.postings.read().entries.is_empty()
    }

    /// True once `unix` is past the end of the window.
    pub fn is_exhausted(&self, unix: i64) -> bool {
        unix >= self.end_time()
    }

    /// True once a sealing save has compacted the whole window.
    pub fn is_sealed(&self) -> bool {
        self.bitmap.last_compact() as usize >= SEGMENTS
    }

    /// Copy of the postings in insertion order.
    pub fn postings(&self) -> Vec<Posting> {
        self.postings.read().entries.clone()
    }

    /// Index `key` with `fps` at unix second `unix`.
    ///
    /// Returns `Ok(false)` when the window is exhausted or the range is sealed,
    /// and the caller should rotate. Times before the window or inside a
    /// compacted segment of an open range are programming errors and fail with
    /// `InvalidTimestamp` or `SegmentCompacted`.
    pub fn add(&self, key: Key, fps: &[Fingerprint], unix: i64) -> Result<bool> {
        if self.is_exhausted(unix) || self.is_sealed() {
            return Ok(false);
        }
        let offset = self.bitmap.check(unix)?;

        let mut fps = fps.to_vec();
        fps.sort_unstable();
        fps.dedup();

        let mut postings = self.postings.write();
        self.bitmap.add_many(unix, &fps)?;
        postings.push(Posting { key, offset, fps });
        Ok(true)
    }

    /// Project `query` back to keys.
    ///
    /// Candidate seconds come from the bitmap merge; every key added at a
    /// candidate second is scored by how many query fingerprints it holds and
    /// handed to `visit` if the score is positive. Stops when `visit` returns
    /// false or `limit` keys have been emitted.
    pub fn join<F>(
        &self,
        query: &[Fingerprint],
        limit: Option<usize>,
        desc: bool,
        mut visit: F,
    ) -> JoinMetrics
    where
        F: FnMut(KeyIdScore) -> bool,
    {
        let started = Instant::now();
        let query: HashSet<Fingerprint> = query.iter().copied().collect();
        let query_vec: Vec<Fingerprint> = query.iter().copied().collect();

        let mut metrics = JoinMetrics {
            start: self.start,
            base_time: self.base_time(),
            desc,
            query_len: query.len(),
            ..JoinMetrics::default()
        };

        let merged = self.bitmap.merge(&query_vec);
        metrics.merge_elapsed = started.elapsed();
        metrics.candidates = merged.len();

        let postings = self.postings.read();
        let offsets: Box<dyn Iterator<Item = &u16>> = if desc {
            Box::new(merged.offsets().iter().rev())
        } else {
            Box::new(merged.offsets().iter())
        };

        'outer: for &offset in offsets {
            if limit.map_or(false, |n| metrics.emitted >= n) {
                break;
            }
            metrics.scanned += 1;
            let Some(indices) = postings.by_offset.get(&offset) else {
                continue;
            };
            let ordered: Box<dyn Iterator<Item = &u32>> = if desc {
                Box::new(indices.iter().rev())
            } else {
                Box::new(indices.iter())
            };
            for &idx in ordered {
                let posting = &postings.entries[idx as usize];
                metrics.examined += 1;
                let score = posting.fps.iter().filter(|fp| query.contains(fp)).count() as u32;
                if score == 0 {
                    continue;
                }
                metrics.emitted += 1;
                let kis = KeyIdScore {
                    key: posting.key,
                    unix: self.base_time() + offset as i64,
                    score,
                };
                if !visit(kis) || limit.map_or(false, |n| metrics.emitted >= n) {
                    break 'outer;
                }
            }
        }

        metrics.elapsed = started.elapsed();
        metrics
    }

    /// Compact and write this range to `path` atomically. Returns bytes written.
    ///
    /// With `seal` the whole window is compacted and the range becomes read
    /// only; otherwise only segments older than the latest indexed second are
    /// compacted so ingestion can continue.
    pub fn save(&self, path: &Path, seal: bool) -> Result<usize> {
        if seal {
            self.bitmap.compact(self.end_time() - 1);
        } else if let Some(last) = self.postings.read().last_offset {
            let current_segment = last as i64 / SPAN;
            if current_segment > 0 {
                self.bitmap
                    .compact(self.base_time() + current_segment * SPAN - 1);
            }
        }

        let data = {
            let postings = self.postings.read();
            format::encode(self.start, &self.bitmap, &postings.entries)?
        };
        format::write_atomic(path, &data)?;
        Ok(data.len())
    }

    /// Read a range written by `save`.
    pub fn load(path: &Path) -> Result<Range> {
        let file = format::read_file(path)?;
        let mut postings = Postings::default();
        for p in file.postings {
            postings.push(p);
        }
        Ok(Range {
            start: file.start_millis,
            bitmap: file.bitmap,
            postings: RwLock::new(postings),
        })
    }

    /// Approximate in-memory size, used as a cache weight.
    pub fn rough_size_bytes(&self) -> u64 {
        let postings = self.postings.read();
        let records: usize = postings
            .entries
            .iter()
            .map(|p| std::mem::size_of::<Posting>() + 4 * p.fps.len() + 4)
            .sum();
        self.bitmap.rough_size_bytes() + records as u64
    }
}

impl Clone for Range {
    /// Deep snapshot, consistent between the bitmap and the postings.
    fn clone(&self) -> Self {
        let postings = self.postings.read();
        Range {
            start: self.start,
            bitmap: self.bitmap.clone(),
            postings: RwLock::new(postings.clone()),
        }
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("start", &self.start)
            .field("keys", &self.len())
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let postings = self.postings.read();
        write!(f, "range {:016x} keys: {}", self.start, postings.entries.len())?;
        if let Some(last) = postings.entries.last() {
            write!(f, " (last={} at +{}s)", last.key, last.offset)?;
        }
        write!(f, ", {}", self.bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::Error;

    fn collect(range: &Range, query: &[u32], limit: Option<usize>, desc: bool) -> Vec<KeyIdScore> {
        let mut out = Vec::new();
        range.join(query, limit, desc, |kis| {
            out.push(kis);
            true
        });
        out
    }

    #[test]
    fn test_add_and_join_scores() {
        let range = Range::new(0);
        assert!(range.add(Key::from_u64(1), &[1, 2, 3], 10).unwrap());
        assert!(range.add(Key::from_u64(2), &[3, 4], 20).unwrap());
        assert!(range.add(Key::from_u64(3), &[9], 30).unwrap());

        let hits = collect(&range, &[3, 4], None, true);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, Key::from_u64(2));
        assert_eq!(hits[0].unix, 20);
        assert_eq!(hits[0].score, 2);
        assert_eq!(hits[1].key, Key::from_u64(1));
        assert_eq!(hits[1].score, 1);

        let asc = collect(&range, &[3, 4], None, false);
        assert_eq!(asc[0].key, Key::from_u64(1));
    }

    #[test]
    fn test_join_limit_and_early_stop() {
        let range = Range::new(0);
        for i in 0..10u64 {
            range.add(Key::from_u64(i), &[7], i as i64).unwrap();
        }
        let limited = collect(&range, &[7], Some(3), true);
        assert_eq!(
            limited.iter().map(|k| k.key.low()).collect::<Vec<_>>(),
            vec![9, 8, 7]
        );

        let mut seen = 0;
        let metrics = range.join(&[7], None, true, |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
        assert_eq!(metrics.emitted, 2);
        assert_eq!(metrics.candidates, 10);
    }

    #[test]
    fn test_join_same_second_keeps_insertion_order() {
        let range = Range::new(0);
        for i in 0..5u64 {
            range.add(Key::from_u64(i), &[1], 100).unwrap();
        }
        let asc: Vec<u64> = collect(&range, &[1], None, false)
            .iter()
            .map(|k| k.key.low())
            .collect();
        assert_eq!(asc, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_exhausted_window_returns_false() {
        let range = Range::new(1000);
        assert!(!range.add(Key::from_u64(1), &[1], HALFDAY).unwrap());
        assert!(range.is_empty());
        assert!(range.is_exhausted(HALFDAY));
        assert!(!range.is_exhausted(HALFDAY - 1));
    }

    #[test]
    fn test_before_window_is_fatal() {
        let range = Range::new(HALFDAY * 1000);
        let err = range.add(Key::from_u64(1), &[1], 5).unwrap_err();
        assert!(err.is_fatal());
        assert!(range.is_empty());
    }

    #[test]
    fn test_clone_is_snapshot() {
        let range = Range::new(0);
        range.add(Key::from_u64(1), &[1], 1).unwrap();
        let snap = range.clone();
        range.add(Key::from_u64(2), &[2], 2).unwrap();
        assert_eq!(snap.len(), 1);
        assert!(collect(&snap, &[2], None, true).is_empty());
        assert_eq!(range.len(), 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range");
        let range = Range::new(5_000);
        for i in 0..50u64 {
            range
                .add(Key::from_u64(i), &[i as u32, 1000], (i * 30) as i64)
                .unwrap();
        }
        let written = range.save(&path, false).unwrap();
        assert!(written > 0);
        // segments before the latest indexed second are compacted
        assert_eq!(range.bitmap().last_compact(), 2);

        let loaded = Range::load(&path).unwrap();
        assert_eq!(loaded.start(), 5_000);
        assert_eq!(loaded.postings(), range.postings());
        assert_eq!(
            collect(&loaded, &[1000], None, true),
            collect(&range, &[1000], None, true)
        );
        assert!(range.add(Key::from_u64(99), &[1], 1500).unwrap());
    }

    #[test]
    fn test_sealed_save_compacts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range");
        let range = Range::new(0);
        range.add(Key::from_u64(1), &[1], 1).unwrap();
        range.save(&path, true).unwrap();
        assert_eq!(range.bitmap().last_compact() as usize, SEGMENTS);
        assert!(range.is_sealed());
        assert!(!range.add(Key::from_u64(2), &[1], 2).unwrap());
        assert_eq!(range.len(), 1);
        assert_eq!(collect(&Range::load(&path).unwrap(), &[1], None, true).len(), 1);
    }

    #[test]
    fn test_partial_compaction_keeps_range_open() {
        let range = Range::new(0);
        range.add(Key::from_u64(1), &[1], 1).unwrap();
        range.add(Key::from_u64(2), &[1], 2 * SPAN).unwrap();
        range.bitmap().compact(SPAN - 1);
        assert!(!range.is_sealed());
        assert!(matches!(
            range.add(Key::from_u64(3), &[1], 5),
            Err(Error::SegmentCompacted { .. })
        ));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Range::load(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rough_size_grows() {
        let range = Range::new(0);
        let empty = range.rough_size_bytes();
        range.add(Key::from_u64(1), &[1, 2, 3], 1).unwrap();
        assert!(range.rough_size_bytes() > empty);
    }
}
