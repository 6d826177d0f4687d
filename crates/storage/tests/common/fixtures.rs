use bytes::Bytes;
use murmur_core::ContentHash;

/// Hex SHA-256 of `data`.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// Deterministic pseudo-random bytes; the same seed yields the same output.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    Bytes::from(data)
}
