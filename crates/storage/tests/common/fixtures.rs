use bytes::Bytes;

/// Generate deterministic test data using a seeded pseudo-random generator.
/// Same seed produces same output (reproducible tests).
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Split data into uneven pieces to exercise chunk boundaries.
pub fn uneven_pieces(data: &Bytes) -> Vec<Bytes> {
    let mut pieces = Vec::new();
    let mut offset = 0;
    let mut size = 1;
    while offset < data.len() {
        let end = (offset + size).min(data.len());
        pieces.push(data.slice(offset..end));
        offset = end;
        size = size * 3 + 7;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
    }

    #[test]
    fn test_uneven_pieces_cover_input() {
        let data = seeded_bytes(1, 5000);
        let joined: Vec<u8> = uneven_pieces(&data).concat();
        assert_eq!(joined, data.to_vec());
    }
}
