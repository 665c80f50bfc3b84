//! Per-block encryption (spec.md §4.3/§4.4/§9).
//!
//! AES-256-XTS is grounded in the `xts-mode` crate's own example usage:
//! two ciphers keyed from the two halves of a 64-byte XTS key. This
//! repo's master key is 32 bytes, so per spec.md §9's conforming choice
//! the key is replicated across both halves rather than split.

use aes::Aes256;
use chacha20poly1305::aead::{Aead, KeyInit as AeadKeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use xts_mode::{get_tweak_default, Xts128};

use crate::algorithms::EncryptionAlgorithm;
use crate::error::{Error, Result};

fn xts(master_key: &[u8; 32]) -> Xts128<Aes256> {
    use aes::cipher::KeyInit;
    let cipher_1 = Aes256::new_from_slice(master_key).expect("32-byte key");
    let cipher_2 = Aes256::new_from_slice(master_key).expect("32-byte key");
    Xts128::new(cipher_1, cipher_2)
}

/// Encrypts exactly one block in place. `block_num` is the logical block
/// index used to derive the IV/tweak.
pub fn encrypt_block(
    algo: EncryptionAlgorithm,
    master_key: &[u8; 32],
    block_num: u64,
    data: &mut [u8],
) -> Result<()> {
    match algo {
        EncryptionAlgorithm::None => Ok(()),
        EncryptionAlgorithm::Aes256Xts => {
            let cipher = xts(master_key);
            let tweak = get_tweak_default(block_num as u128);
            cipher.encrypt_sector(data, tweak);
            Ok(())
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => Err(Error::auth_failure(
            "ChaCha20-Poly1305 needs per-block tag storage this layout does not reserve"
                .to_string(),
        )),
    }
}

pub fn decrypt_block(
    algo: EncryptionAlgorithm,
    master_key: &[u8; 32],
    block_num: u64,
    data: &mut [u8],
) -> Result<()> {
    match algo {
        EncryptionAlgorithm::None => Ok(()),
        EncryptionAlgorithm::Aes256Xts => {
            let cipher = xts(master_key);
            let tweak = get_tweak_default(block_num as u128);
            cipher.decrypt_sector(data, tweak);
            Ok(())
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => Err(Error::auth_failure(
            "ChaCha20-Poly1305 needs per-block tag storage this layout does not reserve"
                .to_string(),
        )),
    }
}

/// Derives the 12-byte ChaCha20-Poly1305 nonce from a block number, per
/// spec.md §4.3's IV derivation rule. Exposed for testing even though no
/// on-disk path currently invokes it (the algorithm is declined at
/// format time, see `superblock::build_superblock`).
#[allow(dead_code)]
fn chacha_nonce(block_num: u64) -> Nonce {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&block_num.to_le_bytes());
    Nonce::clone_from_slice(&iv)
}

#[allow(dead_code)]
fn chacha_round_trip_for_tests(key: &[u8; 32], block_num: u64, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = chacha_nonce(block_num);
    cipher
        .encrypt(&nonce, plaintext)
        .expect("encryption does not fail for well-formed input")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_xts_round_trips_a_block() {
        let master_key = [11u8; 32];
        let mut block = vec![0u8; 4096];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let plaintext = block.clone();

        encrypt_block(EncryptionAlgorithm::Aes256Xts, &master_key, 42, &mut block).unwrap();
        assert_ne!(block, plaintext);

        decrypt_block(EncryptionAlgorithm::Aes256Xts, &master_key, 42, &mut block).unwrap();
        assert_eq!(block, plaintext);
    }

    #[test]
    fn aes_xts_tweak_depends_on_block_number() {
        let master_key = [3u8; 32];
        let plaintext = vec![7u8; 4096];

        let mut a = plaintext.clone();
        encrypt_block(EncryptionAlgorithm::Aes256Xts, &master_key, 0, &mut a).unwrap();

        let mut b = plaintext.clone();
        encrypt_block(EncryptionAlgorithm::Aes256Xts, &master_key, 1, &mut b).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn chacha20_poly1305_block_ops_are_declined() {
        let master_key = [1u8; 32];
        let mut block = vec![0u8; 4096];
        let err = encrypt_block(
            EncryptionAlgorithm::ChaCha20Poly1305,
            &master_key,
            0,
            &mut block,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
    }

    #[test]
    fn chacha_helper_round_trips_for_its_own_unit_test() {
        let key = [4u8; 32];
        let pt = b"hello lolfs";
        let ct = chacha_round_trip_for_tests(&key, 5, pt);
        let cipher = ChaCha20Poly1305::new((&key).into());
        let nonce = chacha_nonce(5);
        let recovered = cipher.decrypt(&nonce, ct.as_slice()).unwrap();
        assert_eq!(recovered, pt);
    }
}
