//! Keys and fingerprints
//!
//! A `Key` is an opaque 128-bit identifier ordered lexicographically over its
//! bytes. Callers usually pack a dense integer id into it; the index never
//! looks inside.
//!
//! A `Fingerprint` is the 32-bit hash of one token. A document contributes a
//! set of fingerprints.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Size of a serialized key in bytes.
pub const KEY_SIZE: usize = 16;

/// 32-bit token hash.
pub type Fingerprint = u32;

/// Opaque 128-bit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Build a key from raw bytes.
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Copy up to 16 bytes into a key, zero padding the tail.
    pub fn from_slice(v: &[u8]) -> Self {
        let mut k = [0u8; KEY_SIZE];
        let n = v.len().min(KEY_SIZE);
        k[..n].copy_from_slice(&v[..n]);
        Key(k)
    }

    /// Key whose low 64 bits hold `v` (big-endian), high bits zero.
    pub fn from_u64(v: u64) -> Self {
        Self::from_parts(0, v)
    }

    /// Key from high and low 64-bit halves.
    pub fn from_parts(hi: u64, lo: u64) -> Self {
        let mut k = [0u8; KEY_SIZE];
        k[..8].copy_from_slice(&hi.to_be_bytes());
        k[8..].copy_from_slice(&lo.to_be_bytes());
        Key(k)
    }

    /// High 64 bits.
    pub fn high(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap_or_default())
    }

    /// Low 64 bits.
    pub fn low(&self) -> u64 {
        u64::from_be_bytes(self.0[8..].try_into().unwrap_or_default())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The next key in byte order, wrapping at the maximum.
    pub fn incr(mut self) -> Self {
        for b in self.0.iter_mut().rev() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
        self
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEY_SIZE * 2 || !s.is_ascii() {
            return Err(Error::Corruption(format!("invalid key hex: {:?}", s)));
        }
        let mut k = [0u8; KEY_SIZE];
        for (i, b) in k.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| Error::Corruption(format!("invalid key hex {:?}: {}", s, e)))?;
        }
        Ok(Key(k))
    }
}

impl From<[u8; KEY_SIZE]> for Key {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }
}

/// Hash a token into its fingerprint (32-bit FNV, multiply then xor).
pub fn fingerprint(token: &str) -> Fingerprint {
    const OFFSET32: u32 = 2166136261;
    const PRIME32: u32 = 16777619;
    let mut hash = OFFSET32;
    for b in token.bytes() {
        hash = hash.wrapping_mul(PRIME32);
        hash ^= b as u32;
    }
    hash
}

/// A key produced by a join, with the second it was indexed at and the
/// number of query fingerprints it shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIdScore {
    /// Matched key
    pub key: Key,
    /// Unix second the key was indexed at
    pub unix: i64,
    /// Overlap between the key's fingerprints and the query
    pub score: u32,
}
