//! Tagged algorithm identifiers shared by the superblock, extents and
//! codec. Stored on disk as plain `u32`s; these enums are the boundary
//! lift spec.md §9 calls for ("mode bits... should be lifted into a
//! tagged variant at the boundary").

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zlib,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            2 => Ok(CompressionAlgorithm::Zlib),
            3 => Ok(CompressionAlgorithm::Zstd),
            other => Err(Error::invalid_image(format!(
                "unknown compression algorithm id {}",
                other
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zlib => 2,
            CompressionAlgorithm::Zstd => 3,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, CompressionAlgorithm::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    None,
    Aes256Xts,
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(EncryptionAlgorithm::None),
            1 => Ok(EncryptionAlgorithm::Aes256Xts),
            2 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            other => Err(Error::invalid_image(format!(
                "unknown encryption algorithm id {}",
                other
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            EncryptionAlgorithm::None => 0,
            EncryptionAlgorithm::Aes256Xts => 1,
            EncryptionAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, EncryptionAlgorithm::None)
    }

    /// IV/tweak size in bytes for this algorithm's native nonce/tweak.
    pub fn iv_size(self) -> usize {
        match self {
            EncryptionAlgorithm::None => 0,
            EncryptionAlgorithm::Aes256Xts => 16,
            EncryptionAlgorithm::ChaCha20Poly1305 => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    Pbkdf2,
    Argon2id,
}

impl KdfAlgorithm {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(KdfAlgorithm::Pbkdf2),
            1 => Ok(KdfAlgorithm::Argon2id),
            other => Err(Error::invalid_image(format!(
                "unknown KDF algorithm id {}",
                other
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            KdfAlgorithm::Pbkdf2 => 0,
            KdfAlgorithm::Argon2id => 1,
        }
    }
}
