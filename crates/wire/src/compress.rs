use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use butterfly_primitives::compression_worthwhile;

/// Compressed forms must save at least this share of the input to be
/// worth shipping.
const MIN_SAVING: f64 = 0.10;

/// The per-chunk compression gate for outgoing chunk frames.
///
/// Skips files whose extension marks them as already compressed, deflates
/// the rest, and keeps the result only when it saves at least 10% of the
/// input length.
#[must_use]
pub fn gate(path: &str, chunk: &[u8]) -> Option<Vec<u8>> {
    if !compression_worthwhile(path) {
        return None;
    }

    let deflated = deflate(chunk)?;
    let saved = chunk.len().saturating_sub(deflated.len());
    ((saved as f64) >= (chunk.len() as f64) * MIN_SAVING).then_some(deflated)
}

#[must_use]
pub fn deflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}

#[must_use]
pub fn inflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_compresses_text() {
        let chunk = vec![b'a'; 8 * 1024];

        let deflated = gate("notes.txt", &chunk).expect("text must compress");
        assert!(deflated.len() < chunk.len() / 10);
        assert_eq!(inflate(&deflated).unwrap(), chunk);
    }

    #[test]
    fn test_gate_skips_precompressed_extensions() {
        let chunk = vec![b'a'; 8 * 1024];

        assert!(gate("movie.MP4", &chunk).is_none());
        assert!(gate("photos/trip.jpg", &chunk).is_none());
    }

    #[test]
    fn test_gate_drops_marginal_wins() {
        // Deflate output barely shrinks (or grows) on deflated input.
        let noise = deflate(&vec![b'x'; 4096]).unwrap();

        assert!(gate("data.bin", &noise).is_none());
    }
}
