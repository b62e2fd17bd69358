//! 32-bit hashing for cache keys and lock stripes.

/// Hash `data` with the given seed.
///
/// Murmur-style mixing over little-endian 4-byte words, in the shape of the
/// LevelDB `Hash`. Tail bytes are added zero-extended where LevelDB
/// sign-extends them, so keys whose tail holds a byte >= 0x80 hash
/// differently from LevelDB. Nothing here relies on that hash. The output
/// is stable across platforms, so shard and stripe routing is deterministic.
pub fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4a793;
    const R: u32 = 24;

    let mut h = seed ^ (data.len() as u32).wrapping_mul(M);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        if rest.len() == 3 {
            h = h.wrapping_add((rest[2] as u32) << 16);
        }
        if rest.len() >= 2 {
            h = h.wrapping_add((rest[1] as u32) << 8);
        }
        h = h.wrapping_add(rest[0] as u32);
        h = h.wrapping_mul(M);
        h ^= h >> R;
    }

    h
}

/// Hash used for cache keys and lock-map stripes.
#[inline]
pub fn slice_hash(data: &[u8]) -> u32 {
    hash(data, 397)
}
