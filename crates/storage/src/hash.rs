//! Offset-mixed fingerprint hashes
//!
//! Each tier stores `(offset << width) | h(offset, fp)`. Mixing the offset into
//! the hash decorrelates collisions between neighbouring seconds. Both hashes
//! remap 0 to 1 so an all-zero hash never names a posting.

/// Murmur3-style 32-bit mix of `k` under `seed`.
#[inline]
pub fn mix32(mut k: u32, seed: u32) -> u32 {
    let mut h = seed;

    k = k.wrapping_mul(0xcc9e_2d51);
    k = k.rotate_left(15);
    k = k.wrapping_mul(0x1b87_3593);

    h ^= k;
    h = h.rotate_left(13);
    h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);

    h ^= 4;

    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// 16-bit hash of `fp` at `offset`, never 0.
#[inline]
pub fn h16(offset: u16, fp: u32) -> u32 {
    match mix32(fp, offset as u32) & 0xffff {
        0 => 1,
        h => h,
    }
}

/// 24-bit hash of `fp` at `offset`, never 0.
#[inline]
pub fn h24(offset: u16, fp: u32) -> u64 {
    let seed = (offset as u32) | 0x8000_0000;
    match mix32(fp, seed) & 0xff_ffff {
        0 => 1,
        h => h as u64,
    }
}

/// Low-tier posting for `fp` at `offset`.
#[inline]
pub fn low_key(offset: u16, fp: u32) -> u32 {
    ((offset as u32) << 16) | h16(offset, fp)
}

/// High-tier posting for `fp` at `offset`.
#[inline]
pub fn high_key(offset: u16, fp: u32) -> u64 {
    ((offset as u64) << 24) | h24(offset, fp)
}
