//! Compress-then-encrypt codec pipeline (spec.md §4.3).
//!
//! A compressed block's payload length varies, so this codec prefixes a
//! compressed payload with its own 4-byte little-endian length before
//! padding to a full block; the prefix rides through encryption like the
//! rest of the plaintext and is read back before decompression.
//!
//! `comp_algo` lives on the extent, not the block, so every block in an
//! extent must agree on whether it is stored compressed. The write path
//! enforces this: the first block that fails to compress downgrades the
//! whole extent back to uncompressed, rewriting any of its blocks
//! already stored under the old algorithm. `ee_meta`/`FLAG_MIXED` stay
//! reserved for a future per-block scheme.

pub mod compression;
pub mod encryption;

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm};
use crate::error::{Error, Result};
use crate::layout::BLOCK_SIZE;

const LENGTH_PREFIX_BYTES: usize = 4;

pub struct EncodedBlock {
    pub bytes: [u8; BLOCK_SIZE],
    pub compressed: bool,
    pub comp_algo: CompressionAlgorithm,
}

/// Runs the write-side pipeline: compress (if requested and effective),
/// then encrypt (if requested). Returns the exactly-one-block payload to
/// store physically, plus whether compression actually took effect so
/// the caller can set the extent's flags/algorithm ids accordingly.
pub fn encode_block(
    comp_algo: CompressionAlgorithm,
    enc_algo: EncryptionAlgorithm,
    master_key: Option<&[u8; 32]>,
    block_num: u64,
    plaintext: &[u8; BLOCK_SIZE],
) -> Result<EncodedBlock> {
    let (mut bytes, compressed, effective_algo) = match compression::compress(comp_algo, plaintext)? {
        Some(compressed) if compressed.len() + LENGTH_PREFIX_BYTES < BLOCK_SIZE => {
            let mut payload = Vec::with_capacity(BLOCK_SIZE);
            payload.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            payload.extend_from_slice(&compressed);
            payload.resize(BLOCK_SIZE, 0);
            (payload, true, comp_algo)
        }
        _ => (plaintext.to_vec(), false, CompressionAlgorithm::None),
    };

    if !enc_algo.is_none() {
        let key = master_key.expect("caller must hold the master key to encrypt");
        encryption::encrypt_block(enc_algo, key, block_num, &mut bytes)?;
    }

    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&bytes);
    Ok(EncodedBlock {
        bytes: out,
        compressed,
        comp_algo: effective_algo,
    })
}

/// Runs the read-side pipeline: decrypt (if the extent says so), then
/// decompress (if the extent says so) back to exactly one block.
pub fn decode_block(
    comp_algo: CompressionAlgorithm,
    enc_algo: EncryptionAlgorithm,
    master_key: Option<&[u8; 32]>,
    block_num: u64,
    stored: &[u8; BLOCK_SIZE],
) -> Result<[u8; BLOCK_SIZE]> {
    let mut bytes = stored.to_vec();
    if !enc_algo.is_none() {
        let key = master_key.expect("caller must hold the master key to decrypt");
        encryption::decrypt_block(enc_algo, key, block_num, &mut bytes)?;
    }

    let mut out = [0u8; BLOCK_SIZE];
    if comp_algo.is_none() {
        out.copy_from_slice(&bytes);
        return Ok(out);
    }

    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Err(Error::invalid_image("block too short for a compressed payload".into()));
    }
    let comp_len = u32::from_le_bytes(bytes[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
    if LENGTH_PREFIX_BYTES + comp_len > bytes.len() {
        return Err(Error::invalid_image("compressed payload length out of range".into()));
    }
    let decompressed = compression::decompress(
        comp_algo,
        &bytes[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + comp_len],
        BLOCK_SIZE,
    )?;
    out.copy_from_slice(&decompressed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_no_compression_no_encryption() {
        let mut plain = [0u8; BLOCK_SIZE];
        plain[0] = 9;
        let encoded = encode_block(
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            None,
            0,
            &plain,
        )
        .unwrap();
        let decoded = decode_block(
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            None,
            0,
            &encoded.bytes,
        )
        .unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn round_trips_with_compression_and_encryption() {
        let plain = [b'z'; BLOCK_SIZE];
        let key = [5u8; 32];
        let encoded = encode_block(
            CompressionAlgorithm::Lz4,
            EncryptionAlgorithm::Aes256Xts,
            Some(&key),
            3,
            &plain,
        )
        .unwrap();
        assert!(encoded.compressed);

        let decoded = decode_block(
            encoded.comp_algo,
            EncryptionAlgorithm::Aes256Xts,
            Some(&key),
            3,
            &encoded.bytes,
        )
        .unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn incompressible_data_falls_back_to_uncompressed_storage() {
        let mut plain = [0u8; BLOCK_SIZE];
        let mut state: u32 = 0xC0FF_EE11;
        for b in plain.iter_mut() {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            *b = (state >> 16) as u8;
        }
        let encoded = encode_block(
            CompressionAlgorithm::Lz4,
            EncryptionAlgorithm::None,
            None,
            0,
            &plain,
        )
        .unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.comp_algo, CompressionAlgorithm::None);
        assert_eq!(encoded.bytes, plain);
    }
}
