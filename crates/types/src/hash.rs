/// Stable 64-bit hash of an arbitrary byte string.
///
/// Partition routing and rate-limiter sharding both depend on the same key
/// always mapping to the same slot, across threads and across restarts, so
/// this must not use a per-process seeded hasher. The first eight bytes of
/// the blake3 digest, little-endian, are uniform enough for modular
/// reduction over small slot counts.
pub fn stable_hash64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(stable_hash64(b"cli1"), stable_hash64(b"cli1"));
        assert_ne!(stable_hash64(b"cli1"), stable_hash64(b"cli2"));
    }

    #[test]
    fn hash_spreads_across_small_modulus() {
        let mut seen = [false; 4];
        for i in 0..64 {
            let key = format!("client-{i}");
            seen[(stable_hash64(key.as_bytes()) % 4) as usize] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }
}
