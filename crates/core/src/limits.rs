//! Window geometry shared by the bitmap, the range file and the manager.
//!
//! A range covers one `HALFDAY` window of seconds. The window is split into
//! `SEGMENTS` buckets of `SPAN` seconds; a segment is the unit of compaction.

/// Width of one range window in seconds.
pub const HALFDAY: i64 = 43200;

/// Width of one segment in seconds.
pub const SPAN: i64 = 600;

/// Number of segments in a range.
pub const SEGMENTS: usize = (HALFDAY / SPAN) as usize;

/// Low-tier population of a segment above which the segment is kept in the
/// high tier on compaction.
///
/// Past this point the 16-bit hashes of the low tier no longer discriminate
/// well. Deployments can override it through `IndexConfig::dense_threshold`.
pub const DENSE_SEGMENT_THRESHOLD: u64 = SPAN as u64 * 4096;

/// Align a unix second down to the start of its window.
pub fn align_to_window(unix: i64) -> i64 {
    unix.div_euclid(HALFDAY) * HALFDAY
}
