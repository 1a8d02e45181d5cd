//! Two-tier packed postings for one halfday window
//!
//! Every insert lands in both tiers:
//! - low:  `(offset << 16) | h16(offset, fp)` in a 32-bit roaring bitmap
//! - high: `(offset << 24) | h24(offset, fp)` in a 64-bit roaring treemap
//!
//! Compaction walks finished segments and keeps exactly one tier per segment:
//! the low tier while it is sparse, the high tier once the low tier's
//! population exceeds the dense threshold and 16 bits stop discriminating.
//!
//! # Serialized layout (big-endian)
//!
//! ```text
//! baseTime    : i64
//! lastCompact : u16
//! lowSize     : u64, lowBytes
//! highSize    : u64, highBytes
//! ```

use std::fmt;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use roaring::{RoaringBitmap, RoaringTreemap};
use tidemark_core::limits::align_to_window;
use tidemark_core::{Error, Fingerprint, Result, DENSE_SEGMENT_THRESHOLD, HALFDAY, SEGMENTS, SPAN};

use crate::hash::{high_key, low_key};

struct Tiers {
    low: RoaringBitmap,
    high: RoaringTreemap,
    /// Segments below this index are compacted and immutable.
    last_compact: u16,
}

/// Postings store for a single halfday window.
///
/// Guarded by a reader/writer lock: `add` and `compact` write, `merge` and
/// serialization read.
pub struct Bitmap {
    base_time: i64,
    dense_threshold: u64,
    tiers: RwLock<Tiers>,
}

/// Seconds of a range that might hold at least one queried fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeResult {
    base_time: i64,
    /// Ascending, deduplicated offsets.
    offsets: Vec<u16>,
}

impl MergeResult {
    /// Matching unix seconds, newest first.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.offsets.iter().rev().map(move |&o| self.base_time + o as i64)
    }

    /// Matching unix seconds, oldest first.
    pub fn ascending(&self) -> impl Iterator<Item = i64> + '_ {
        self.offsets.iter().map(move |&o| self.base_time + o as i64)
    }

    /// Matching offsets relative to the range base, ascending.
    pub fn offsets(&self) -> &[u16] {
        &self.offsets
    }

    /// True if `unix` is one of the matching seconds.
    pub fn contains(&self, unix: i64) -> bool {
        let rel = unix - self.base_time;
        (0..HALFDAY).contains(&rel) && self.offsets.binary_search(&(rel as u16)).is_ok()
    }

    /// Number of matching seconds.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True if nothing matched.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

fn segment_offsets(segment: u16) -> (u32, u32) {
    let lo = segment as u32 * SPAN as u32;
    (lo, lo + SPAN as u32)
}

fn low_population(low: &RoaringBitmap, segment: u16) -> u64 {
    let (lo, hi) = segment_offsets(segment);
    let below = if lo == 0 { 0 } else { low.rank((lo << 16) - 1) };
    low.rank((hi << 16) - 1) - below
}

fn high_population(high: &RoaringTreemap, segment: u16) -> u64 {
    let (lo, hi) = segment_offsets(segment);
    let (lo, hi) = ((lo as u64) << 24, (hi as u64) << 24);
    let below = if lo == 0 { 0 } else { high.rank(lo - 1) };
    high.rank(hi - 1) - below
}

impl Bitmap {
    /// Empty bitmap for the window containing `unix` (seconds).
    pub fn new(unix: i64) -> Self {
        Bitmap {
            base_time: align_to_window(unix),
            dense_threshold: DENSE_SEGMENT_THRESHOLD,
            tiers: RwLock::new(Tiers {
                low: RoaringBitmap::new(),
                high: RoaringTreemap::new(),
                last_compact: 0,
            }),
        }
    }

    /// Override the dense threshold used by `compact`.
    pub fn with_dense_threshold(mut self, threshold: u64) -> Self {
        self.dense_threshold = threshold;
        self
    }

    /// Window start in unix seconds.
    pub fn base_time(&self) -> i64 {
        self.base_time
    }

    /// First segment that still accepts inserts.
    pub fn last_compact(&self) -> u16 {
        self.tiers.read().last_compact
    }

    /// Dense threshold used by `compact`.
    pub fn dense_threshold(&self) -> u64 {
        self.dense_threshold
    }

    /// Offset of `ts` in this window, checking it is writable.
    ///
    /// Fails with `InvalidTimestamp` outside `[base, base + halfday)` and with
    /// `SegmentCompacted` below `last_compact`.
    pub fn check(&self, ts: i64) -> Result<u16> {
        let offset = self.offset_of(ts)?;
        let last_compact = self.tiers.read().last_compact;
        Self::check_segment(offset, last_compact)?;
        Ok(offset)
    }

    fn offset_of(&self, ts: i64) -> Result<u16> {
        let rel = ts - self.base_time;
        if !(0..HALFDAY).contains(&rel) {
            return Err(Error::InvalidTimestamp {
                ts,
                base: self.base_time,
            });
        }
        Ok(rel as u16)
    }

    fn check_segment(offset: u16, last_compact: u16) -> Result<()> {
        let segment = offset / SPAN as u16;
        if segment < last_compact {
            return Err(Error::SegmentCompacted {
                segment,
                last_compact,
            });
        }
        Ok(())
    }

    /// Insert `fp` at second `ts`. Returns true if the high-tier posting is new.
    pub fn add(&self, ts: i64, fp: Fingerprint) -> Result<bool> {
        let offset = self.offset_of(ts)?;
        let mut tiers = self.tiers.write();
        Self::check_segment(offset, tiers.last_compact)?;
        tiers.low.insert(low_key(offset, fp));
        Ok(tiers.high.insert(high_key(offset, fp)))
    }

    /// Insert every fingerprint of one document under a single lock.
    /// Returns how many high-tier postings were new.
    pub fn add_many(&self, ts: i64, fps: &[Fingerprint]) -> Result<usize> {
        let offset = self.offset_of(ts)?;
        let mut tiers = self.tiers.write();
        Self::check_segment(offset, tiers.last_compact)?;
        let mut novel = 0;
        for &fp in fps {
            tiers.low.insert(low_key(offset, fp));
            if tiers.high.insert(high_key(offset, fp)) {
                novel += 1;
            }
        }
        Ok(novel)
    }

    /// Seconds in this window that might contain at least one of `fps`.
    pub fn merge(&self, fps: &[Fingerprint]) -> MergeResult {
        let mut result = MergeResult {
            base_time: self.base_time,
            offsets: Vec::new(),
        };
        if fps.is_empty() {
            return result;
        }

        let tiers = self.tiers.read();

        let mut low_hits = Vec::new();
        let mut idx = 0u32;
        while let Some(v) = tiers.low.select(idx) {
            let offset = (v >> 16) as u16;
            if fps.iter().any(|&fp| tiers.low.contains(low_key(offset, fp))) {
                low_hits.push(offset);
            }
            // skip the rest of this offset
            idx = tiers.low.rank(v | 0xffff) as u32;
        }

        let mut high_hits = Vec::new();
        let mut idx = 0u64;
        while let Some(v) = tiers.high.select(idx) {
            let offset = (v >> 24) as u16;
            if fps.iter().any(|&fp| tiers.high.contains(high_key(offset, fp))) {
                high_hits.push(offset);
            }
            idx = tiers.high.rank(v | 0xff_ffff);
        }
        drop(tiers);

        let mut offsets = Vec::with_capacity(low_hits.len() + high_hits.len());
        let (mut i, mut j) = (0, 0);
        while i < low_hits.len() || j < high_hits.len() {
            let next = match (low_hits.get(i), high_hits.get(j)) {
                (Some(&a), Some(&b)) if a == b => {
                    i += 1;
                    j += 1;
                    a
                }
                (Some(&a), Some(&b)) if a < b => {
                    i += 1;
                    a
                }
                (Some(_), Some(&b)) => {
                    j += 1;
                    b
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => break,
            };
            offsets.push(next);
        }
        result.offsets = offsets;
        result
    }

    /// Compact every segment whose start is at or before `up_to` (unix seconds).
    ///
    /// Monotonic and idempotent: already compacted segments are skipped and
    /// `last_compact` never moves backwards.
    pub fn compact(&self, up_to: i64) {
        let rel = up_to - self.base_time;
        if rel < 0 {
            return;
        }
        let end = ((rel / SPAN) as usize + 1).min(SEGMENTS) as u16;

        let mut tiers = self.tiers.write();
        let start = tiers.last_compact;
        for segment in start..end {
            let (lo, hi) = segment_offsets(segment);
            if low_population(&tiers.low, segment) > self.dense_threshold {
                tiers.low.remove_range((lo << 16)..(hi << 16));
            } else {
                tiers
                    .high
                    .remove_range(((lo as u64) << 24)..((hi as u64) << 24));
            }
        }
        if end > start {
            tiers.last_compact = end;
            tracing::trace!(
                target: "tidemark::bitmap",
                base_time = self.base_time,
                from = start,
                to = end,
                "compacted segments"
            );
        }
    }

    /// Postings held by `segment` in the (low, high) tiers.
    pub fn segment_population(&self, segment: u16) -> (u64, u64) {
        let tiers = self.tiers.read();
        (
            low_population(&tiers.low, segment),
            high_population(&tiers.high, segment),
        )
    }

    /// Total postings in the (low, high) tiers.
    pub fn tier_lens(&self) -> (u64, u64) {
        let tiers = self.tiers.read();
        (tiers.low.len(), tiers.high.len())
    }

    /// Serialized size of both tiers, used as a cache weight.
    pub fn rough_size_bytes(&self) -> u64 {
        let tiers = self.tiers.read();
        (tiers.low.serialized_size() + tiers.high.serialized_size()) as u64
    }

    /// Encode under the read lock.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tiers = self.tiers.read();
        let low_size = tiers.low.serialized_size();
        let high_size = tiers.high.serialized_size();
        let mut buf = Vec::with_capacity(8 + 2 + 8 + low_size + 8 + high_size);

        buf.write_i64::<BigEndian>(self.base_time)?;
        buf.write_u16::<BigEndian>(tiers.last_compact)?;
        buf.write_u64::<BigEndian>(low_size as u64)?;
        tiers.low.serialize_into(&mut buf)?;
        buf.write_u64::<BigEndian>(high_size as u64)?;
        tiers.high.serialize_into(&mut buf)?;
        Ok(buf)
    }

    /// Write the encoded bitmap; the lock is released before any I/O.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<usize> {
        let buf = self.to_bytes()?;
        w.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Decode a bitmap written by `write_to`.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let base_time = r
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Corruption(format!("read baseTime: {}", e)))?;
        if align_to_window(base_time) != base_time {
            return Err(Error::Corruption(format!(
                "baseTime {} is not window aligned",
                base_time
            )));
        }
        let last_compact = r
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Corruption(format!("read lastCompact: {}", e)))?;
        if last_compact as usize > SEGMENTS {
            return Err(Error::Corruption(format!(
                "lastCompact {} exceeds {} segments",
                last_compact, SEGMENTS
            )));
        }

        let low_bytes = read_sized(r, "low tier")?;
        let low = RoaringBitmap::deserialize_from(&low_bytes[..])
            .map_err(|e| Error::Corruption(format!("decode low tier: {}", e)))?;
        let high_bytes = read_sized(r, "high tier")?;
        let high = RoaringTreemap::deserialize_from(&high_bytes[..])
            .map_err(|e| Error::Corruption(format!("decode high tier: {}", e)))?;

        Ok(Bitmap {
            base_time,
            dense_threshold: DENSE_SEGMENT_THRESHOLD,
            tiers: RwLock::new(Tiers {
                low,
                high,
                last_compact,
            }),
        })
    }

    /// Decode from a byte slice.
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        Self::read_from(&mut buf)
    }
}

/// Reads a u64 length prefix and that many bytes.
fn read_sized<R: Read>(r: &mut R, what: &str) -> Result<Vec<u8>> {
    let size = r
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("read {} size: {}", what, e)))?;
    let mut buf = Vec::new();
    r.take(size).read_to_end(&mut buf)?;
    if buf.len() as u64 != size {
        return Err(Error::Corruption(format!(
            "truncated {}: want {} bytes, got {}",
            what,
            size,
            buf.len()
        )));
    }
    Ok(buf)
}

impl Clone for Bitmap {
    fn clone(&self) -> Self {
        let tiers = self.tiers.read();
        Bitmap {
            base_time: self.base_time,
            dense_threshold: self.dense_threshold,
            tiers: RwLock::new(Tiers {
                low: tiers.low.clone(),
                high: tiers.high.clone(),
                last_compact: tiers.last_compact,
            }),
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers = self.tiers.read();
        f.debug_struct("Bitmap")
            .field("base_time", &self.base_time)
            .field("last_compact", &tiers.last_compact)
            .field("low", &tiers.low.len())
            .field("high", &tiers.high.len())
            .finish()
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers = self.tiers.read();
        write!(
            f,
            "[{}] compacted: {}/{}, low: {} ({}b), high: {} ({}b)",
            self.base_time,
            tiers.last_compact,
            SEGMENTS,
            tiers.low.len(),
            tiers.low.serialized_size(),
            tiers.high.len(),
            tiers.high.serialized_size()
        )
    }
}
