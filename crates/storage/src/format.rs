//! Range file format
//!
//! One file per range, big-endian throughout, written atomically (temp file,
//! fsync, rename).
//!
//! # File Structure
//!
//! ```text
//! +--------------------+
//! | magic "TMRG"       | 4 bytes
//! | version            | 2 bytes
//! | startMillis        | 8 bytes
//! +--------------------+
//! | Bitmap             | baseTime, lastCompact, low tier, high tier
//! +--------------------+
//! | postingsCount      | 8 bytes
//! | postings[]         | key (16) | offset (2) | fpCount (4) | fps (4 each)
//! +--------------------+
//! | Footer CRC32       | 4 bytes, over everything above
//! +--------------------+
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tidemark_core::{Error, Key, Result, HALFDAY, KEY_SIZE};

use crate::bitmap::Bitmap;
use crate::range::Posting;

/// Magic bytes: "TMRG"
pub const RANGE_MAGIC: [u8; 4] = *b"TMRG";

/// Range file format version
pub const RANGE_FORMAT_VERSION: u16 = 1;

/// Suffix of in-progress files; never a valid range name.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Decoded contents of a range file.
pub struct RangeFile {
    /// Range start in unix milliseconds
    pub start_millis: i64,
    /// Postings bitmap
    pub bitmap: Bitmap,
    /// Key to fingerprint records in insertion order
    pub postings: Vec<Posting>,
}

/// Encode a range into its on-disk bytes.
pub fn encode(start_millis: i64, bitmap: &Bitmap, postings: &[Posting]) -> Result<Vec<u8>> {
    let bitmap_bytes = bitmap.to_bytes()?;
    let postings_size: usize = postings
        .iter()
        .map(|p| KEY_SIZE + 2 + 4 + 4 * p.fps.len())
        .sum();
    let mut buf = Vec::with_capacity(14 + bitmap_bytes.len() + 8 + postings_size + 4);

    buf.write_all(&RANGE_MAGIC)?;
    buf.write_u16::<BigEndian>(RANGE_FORMAT_VERSION)?;
    buf.write_i64::<BigEndian>(start_millis)?;
    buf.write_all(&bitmap_bytes)?;

    buf.write_u64::<BigEndian>(postings.len() as u64)?;
    for p in postings {
        buf.write_all(p.key.as_bytes())?;
        buf.write_u16::<BigEndian>(p.offset)?;
        buf.write_u32::<BigEndian>(p.fps.len() as u32)?;
        for &fp in &p.fps {
            buf.write_u32::<BigEndian>(fp)?;
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.write_u32::<BigEndian>(crc)?;
    Ok(buf)
}

/// Decode bytes produced by `encode`.
pub fn decode(data: &[u8]) -> Result<RangeFile> {
    if data.len() < 4 + 2 + 8 + 4 {
        return Err(Error::Corruption(format!(
            "range file too short: {} bytes",
            data.len()
        )));
    }
    let (body, footer) = data.split_at(data.len() - 4);
    let stored = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(Error::Corruption(format!(
            "range checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    let mut rd = body;
    let mut magic = [0u8; 4];
    std::io::Read::read_exact(&mut rd, &mut magic)?;
    if magic != RANGE_MAGIC {
        return Err(Error::Corruption(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            RANGE_MAGIC, magic
        )));
    }
    let version = rd.read_u16::<BigEndian>()?;
    if version > RANGE_FORMAT_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported range version {}, max supported is {}",
            version, RANGE_FORMAT_VERSION
        )));
    }
    let start_millis = rd.read_i64::<BigEndian>()?;
    let bitmap = Bitmap::read_from(&mut rd)?;

    let count = rd
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("read postings count: {}", e)))?;
    let mut postings = Vec::with_capacity(count.min(1 << 20) as usize);
    for i in 0..count {
        let p = read_posting(&mut rd)
            .map_err(|e| Error::Corruption(format!("read posting {}: {}", i, e)))?;
        if p.offset as i64 >= HALFDAY {
            return Err(Error::Corruption(format!(
                "posting {} offset {} outside window",
                i, p.offset
            )));
        }
        postings.push(p);
    }
    if !rd.is_empty() {
        return Err(Error::Corruption(format!(
            "{} trailing bytes after postings",
            rd.len()
        )));
    }

    Ok(RangeFile {
        start_millis,
        bitmap,
        postings,
    })
}

fn read_posting(rd: &mut &[u8]) -> std::io::Result<Posting> {
    let mut key = [0u8; KEY_SIZE];
    std::io::Read::read_exact(rd, &mut key)?;
    let offset = rd.read_u16::<BigEndian>()?;
    let n = rd.read_u32::<BigEndian>()? as usize;
    if n * 4 > rd.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{} fingerprints exceed remaining {} bytes", n, rd.len()),
        ));
    }
    let mut fps = Vec::with_capacity(n);
    for _ in 0..n {
        fps.push(rd.read_u32::<BigEndian>()?);
    }
    Ok(Posting {
        key: Key::new(key),
        offset,
        fps,
    })
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!("{}.{}{}", name, seq, TEMP_SUFFIX))
}

/// Write `data` to `path` atomically: temp file, fsync, rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    let result = (|| -> Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read and decode the range file at `path`.
pub fn read_file(path: &Path) -> Result<RangeFile> {
    let data = fs::read(path)?;
    decode(&data)
}
