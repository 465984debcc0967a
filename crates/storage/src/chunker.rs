use butterfly_primitives::Hash;

/// Fixed chunk size. Boundaries are content-independent: byte `n` always
/// lands in chunk `n / CHUNK_SIZE`, which is what makes the have/need
/// exchange and cross-file dedup line up.
pub const CHUNK_SIZE: u32 = 256 * 1024;

/// The file's chunks in order. Empty input yields no chunks.
pub fn chunks_of(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(CHUNK_SIZE as usize)
}

/// Hash of every chunk, in file order.
#[must_use]
pub fn chunk_hashes(bytes: &[u8]) -> Vec<Hash> {
    chunks_of(bytes).map(Hash::digest).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_has_no_chunks() {
        assert!(chunk_hashes(b"").is_empty());
    }

    #[test]
    fn test_boundaries_are_fixed() {
        let size = CHUNK_SIZE as usize;
        let bytes = vec![7u8; size * 2 + 1];

        let chunks: Vec<&[u8]> = chunks_of(&bytes).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), size);
        assert_eq!(chunks[1].len(), size);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn test_identical_prefixes_share_chunk_hashes() {
        let size = CHUNK_SIZE as usize;
        let mut first = vec![1u8; size];
        first.extend_from_slice(b"tail-one");
        let mut second = vec![1u8; size];
        second.extend_from_slice(b"tail-two");

        let first_hashes = chunk_hashes(&first);
        let second_hashes = chunk_hashes(&second);

        assert_eq!(
            first_hashes[0], second_hashes[0],
            "shared first block must dedup across files"
        );
        assert_ne!(first_hashes[1], second_hashes[1]);
    }
}
