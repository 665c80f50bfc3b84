//! Per-block compression (spec.md §4.3).

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::algorithms::CompressionAlgorithm;
use crate::error::{Error, Result};
use crate::layout::BLOCK_SIZE;

/// Space must drop below this fraction of the source size for a
/// compressed block to be considered "effective" (spec.md §4.3: "≥ 95%
/// of the source" is discarded).
const EFFECTIVE_THRESHOLD: f64 = 0.95;

/// Compresses one block. Returns `None` if the result isn't effective
/// (the caller should store the block uncompressed), `Some(bytes)`
/// otherwise.
pub fn compress(algo: CompressionAlgorithm, src: &[u8]) -> Result<Option<Vec<u8>>> {
    debug_assert_eq!(src.len(), BLOCK_SIZE);
    let compressed = match algo {
        CompressionAlgorithm::None => return Ok(None),
        CompressionAlgorithm::Lz4 => lz4_flex::block::compress(src),
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(src)
                .map_err(|e| Error::IoError(e.into()))?;
            encoder.finish().map_err(|e| Error::IoError(e.into()))?
        }
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(src, 0).map_err(|e| Error::IoError(e.into()))?
        }
    };

    if (compressed.len() as f64) < (src.len() as f64) * EFFECTIVE_THRESHOLD {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompresses a block back to exactly `expected` bytes.
pub fn decompress(algo: CompressionAlgorithm, data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let out = match algo {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Lz4 => lz4_flex::block::decompress(data, expected)
            .map_err(|e| Error::invalid_image(format!("lz4 decompress failed: {}", e)))?,
        CompressionAlgorithm::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .map_err(|e| Error::IoError(e.into()))?;
            decoder.finish().map_err(|e| Error::IoError(e.into()))?
        }
        CompressionAlgorithm::Zstd => {
            zstd::decode_all(data).map_err(|e| Error::IoError(e.into()))?
        }
    };
    if out.len() != expected {
        return Err(Error::invalid_image(format!(
            "decompressed block is {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Vec<u8> {
        // highly compressible: repeats
        vec![b'a'; BLOCK_SIZE]
    }

    #[test]
    fn lz4_round_trips_a_compressible_block() {
        let src = sample_block();
        let compressed = compress(CompressionAlgorithm::Lz4, &src).unwrap().unwrap();
        assert!(compressed.len() < src.len());
        let out = decompress(CompressionAlgorithm::Lz4, &compressed, BLOCK_SIZE).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn zlib_round_trips_a_compressible_block() {
        let src = sample_block();
        let compressed = compress(CompressionAlgorithm::Zlib, &src).unwrap().unwrap();
        let out = decompress(CompressionAlgorithm::Zlib, &compressed, BLOCK_SIZE).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn zstd_round_trips_a_compressible_block() {
        let src = sample_block();
        let compressed = compress(CompressionAlgorithm::Zstd, &src).unwrap().unwrap();
        let out = decompress(CompressionAlgorithm::Zstd, &compressed, BLOCK_SIZE).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn incompressible_block_is_rejected_as_ineffective() {
        // Pseudo-random bytes rarely compress below the 95% threshold.
        let mut src = vec![0u8; BLOCK_SIZE];
        let mut state: u32 = 0x1234_5678;
        for b in src.iter_mut() {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            *b = (state >> 16) as u8;
        }
        let result = compress(CompressionAlgorithm::Lz4, &src).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn none_algorithm_never_compresses() {
        let src = sample_block();
        assert!(compress(CompressionAlgorithm::None, &src).unwrap().is_none());
    }
}
