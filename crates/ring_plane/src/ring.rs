//! Key-to-shard mapping over a fixed-size ring.

use std::io::Cursor;

/// Seed for the ring hash. Changing it reshuffles every key's shard, so it is
/// fixed for the lifetime of any persisted region.
const RING_HASH_SEED: u32 = 0;

/// Map a key to a shard index in `[0, ring_size)`.
///
/// Uses murmur3 x64-128 (lower 64 bits) with a fixed seed: deterministic,
/// well-distributed, and stable across process restarts and platforms.
pub fn shard_of(key: &[u8], ring_size: u32) -> u32 {
    debug_assert!(ring_size > 0, "ring size must be positive");
    let mut cursor = Cursor::new(key);
    // Reading from an in-memory cursor cannot fail.
    let hash = murmur3::murmur3_x64_128(&mut cursor, RING_HASH_SEED).unwrap_or(0);
    (hash as u64 % u64::from(ring_size)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_of_is_deterministic() {
        for key in [b"user:1".as_slice(), b"".as_slice(), b"room:abc/42".as_slice()] {
            let first = shard_of(key, 16);
            for _ in 0..10 {
                assert_eq!(shard_of(key, 16), first);
            }
        }
    }

    #[test]
    fn shard_of_stays_in_range() {
        for i in 0u32..1_000 {
            let key = format!("key-{i}");
            let shard = shard_of(key.as_bytes(), 9);
            assert!(shard < 9);
        }
    }

    #[test]
    fn shard_of_spreads_keys_roughly_evenly() {
        const RING: u32 = 8;
        const KEYS: u32 = 16_000;
        let mut counts = [0u32; RING as usize];
        for i in 0..KEYS {
            let key = format!("entity/{i}");
            counts[shard_of(key.as_bytes(), RING) as usize] += 1;
        }
        let expected = KEYS / RING;
        for (shard, count) in counts.iter().enumerate() {
            assert!(
                *count > expected / 2 && *count < expected * 2,
                "shard {shard} got {count} of {KEYS} keys"
            );
        }
    }
}
