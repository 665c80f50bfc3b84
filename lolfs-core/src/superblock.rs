//! Superblock layout, `format()` and the superblock half of `check()`.
//!
//! Grounded in the teacher's `rfs_lib::desc::Ext2SuperBlock` /
//! `rfs_lib::mem::Ext2SuperBlockMem` pair: a `#[repr(C)]` on-disk record
//! plus a friendlier in-memory mirror kept in sync by `ApplyMem`. The
//! on-disk record here uses `zerocopy::{AsBytes, FromBytes}` instead of
//! the teacher's `serialize_row`/`deserialize_row` pointer casts.

use lolfs_driver::{BlockStore, BLOCK_SIZE};
use lolfs_macros::ApplyMem;
use log::{debug, info};
use rand::RngCore;
use zerocopy::{AsBytes, FromBytes};

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm, KdfAlgorithm};
use crate::error::{Error, Result};
use crate::keymanager::{derive_user_key, wrap_master_key};
use crate::layout::{RegionSizes, MAGIC};

const RESERVED_BYTES: usize = BLOCK_SIZE
    - (7 * 8) // u64 fields
    - (14 * 4) // u32 fields
    - (32 + 32); // salt + wrapped master key

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct SuperblockRaw {
    pub total_blocks: u64,
    pub inode_count: u64,
    pub inode_store_blocks: u64,
    pub inode_bitmap_blocks: u64,
    pub block_bitmap_blocks: u64,
    pub free_inodes: u64,
    pub free_blocks: u64,

    pub magic: u32,
    pub version: u32,

    pub comp_algo: u32,
    pub comp_enabled: u32,
    pub comp_min_block_size: u32,
    pub comp_feature_bits: u32,
    pub comp_max_extent_blocks: u32,

    pub enc_enabled: u32,
    pub enc_algo: u32,
    pub kdf_algo: u32,
    pub kdf_iterations: u32,
    pub kdf_memory: u32,
    pub kdf_parallelism: u32,
    pub enc_feature_bits: u32,

    pub salt: [u8; 32],
    pub wrapped_master_key: [u8; 32],

    pub reserved: [u8; RESERVED_BYTES],
}

const _: () = assert!(std::mem::size_of::<SuperblockRaw>() == BLOCK_SIZE);

impl Default for SuperblockRaw {
    fn default() -> Self {
        SuperblockRaw {
            total_blocks: 0,
            inode_count: 0,
            inode_store_blocks: 0,
            inode_bitmap_blocks: 0,
            block_bitmap_blocks: 0,
            free_inodes: 0,
            free_blocks: 0,
            magic: 0,
            version: 1,
            comp_algo: 0,
            comp_enabled: 0,
            comp_min_block_size: 0,
            comp_feature_bits: 0,
            comp_max_extent_blocks: 0,
            enc_enabled: 0,
            enc_algo: 0,
            kdf_algo: 0,
            kdf_iterations: 0,
            kdf_memory: 0,
            kdf_parallelism: 0,
            enc_feature_bits: 0,
            salt: [0; 32],
            wrapped_master_key: [0; 32],
            reserved: [0; RESERVED_BYTES],
        }
    }
}

/// Friendlier mirror of the region-sizing fields, kept in sync with
/// `SuperblockRaw` via `ApplyMem` the way the teacher's
/// `Ext2SuperBlockMem` mirrors `Ext2SuperBlock`.
#[derive(ApplyMem, Debug, Default, Clone, Copy)]
#[ApplyMemTo(SuperblockRaw)]
pub struct SuperblockMem {
    pub total_blocks: u64,
    pub inode_count: u64,
    pub inode_store_blocks: u64,
    pub inode_bitmap_blocks: u64,
    pub block_bitmap_blocks: u64,
    pub free_inodes: u64,
    pub free_blocks: u64,
}

impl SuperblockMem {
    pub fn to_string(&self) -> String {
        format!(
            "lolfs: {} blocks, {} inodes ({} free), {} blocks free",
            self.total_blocks, self.inode_count, self.free_inodes, self.free_blocks
        )
    }
}

#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub algorithm: CompressionAlgorithm,
    pub min_block_size: u32,
    pub max_extent_blocks: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            min_block_size: 0,
            max_extent_blocks: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionOptions {
    pub algorithm: EncryptionAlgorithm,
    pub kdf_iterations: u32,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    pub compression: CompressionOptions,
    pub encryption: Option<EncryptionOptions>,
}

impl SuperblockRaw {
    pub fn read_from_store(store: &mut dyn BlockStore) -> Result<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        store
            .read_block(0, &mut buf)
            .map_err(|e| Error::IoError(e))?;
        let sb = SuperblockRaw::read_from(&buf[..]).ok_or_else(|| {
            Error::invalid_image("superblock block has the wrong size".to_string())
        })?;
        sb.validate_magic_and_algos()?;
        Ok(sb)
    }

    pub fn write_to_store(&self, store: &mut dyn BlockStore) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(self.as_bytes());
        store
            .write_block(0, &buf)
            .map_err(|e| Error::IoError(e))?;
        Ok(())
    }

    pub fn validate_magic_and_algos(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::invalid_image(format!(
                "bad magic {:#x}, expected {:#x}",
                self.magic, MAGIC
            )));
        }
        CompressionAlgorithm::from_u32(self.comp_algo)?;
        if self.enc_enabled != 0 {
            EncryptionAlgorithm::from_u32(self.enc_algo)?;
            KdfAlgorithm::from_u32(self.kdf_algo)?;
        }
        Ok(())
    }

    pub fn compression(&self) -> Result<CompressionAlgorithm> {
        CompressionAlgorithm::from_u32(self.comp_algo)
    }

    pub fn encryption(&self) -> Result<EncryptionAlgorithm> {
        if self.enc_enabled == 0 {
            return Ok(EncryptionAlgorithm::None);
        }
        EncryptionAlgorithm::from_u32(self.enc_algo)
    }

    pub fn regions(&self) -> RegionSizes {
        RegionSizes {
            total_blocks: self.total_blocks,
            inode_count: self.inode_count,
            inode_store_blocks: self.inode_store_blocks,
            inode_bitmap_blocks: self.inode_bitmap_blocks,
            block_bitmap_blocks: self.block_bitmap_blocks,
            data_blocks: self.total_blocks
                - (1 + self.inode_store_blocks + self.inode_bitmap_blocks + self.block_bitmap_blocks),
        }
    }
}

/// Builds the superblock for a freshly formatted image. Does not write
/// anything beyond block 0; callers (the handle's `format()`) are
/// responsible for zeroing the inode store, seeding the root inode and
/// marking the reserved bitmap bits, which need the bitmap/inode-store
/// modules and so cannot live in this module without a dependency
/// cycle.
pub fn build_superblock(
    total_blocks: u64,
    options: &FormatOptions,
) -> Result<(SuperblockRaw, Option<[u8; 32]>)> {
    if total_blocks < 100 {
        return Err(Error::invalid_image(
            "image must be at least 100 blocks".to_string(),
        ));
    }
    let regions = RegionSizes::compute(total_blocks);
    let mut sb = SuperblockRaw {
        total_blocks: regions.total_blocks,
        inode_count: regions.inode_count,
        inode_store_blocks: regions.inode_store_blocks,
        inode_bitmap_blocks: regions.inode_bitmap_blocks,
        block_bitmap_blocks: regions.block_bitmap_blocks,
        free_inodes: regions.inode_count - 1,
        free_blocks: regions.data_blocks - 1,
        magic: MAGIC,
        version: 1,
        comp_algo: options.compression.algorithm.as_u32(),
        comp_enabled: (!options.compression.algorithm.is_none()) as u32,
        comp_min_block_size: options.compression.min_block_size,
        comp_feature_bits: 0,
        comp_max_extent_blocks: options.compression.max_extent_blocks,
        ..SuperblockRaw::default()
    };

    let mut plaintext_master_key = None;
    match &options.encryption {
        None => {
            sb.enc_enabled = 0;
        }
        Some(enc) => {
            if matches!(enc.algorithm, EncryptionAlgorithm::ChaCha20Poly1305) {
                return Err(Error::invalid_image(
                    "ChaCha20-Poly1305 is recognized but declined at format time: this layout reserves no space for AEAD tags".to_string(),
                ));
            }
            let password = enc.password.as_deref().ok_or_else(|| {
                Error::invalid_image("encryption requires a password".to_string())
            })?;
            let mut salt = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut salt);
            let mut master_key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut master_key);

            let user_key = derive_user_key(password, &salt, enc.kdf_iterations);
            let wrapped = wrap_master_key(&user_key, &master_key);

            sb.enc_enabled = 1;
            sb.enc_algo = enc.algorithm.as_u32();
            sb.kdf_algo = KdfAlgorithm::Pbkdf2.as_u32();
            sb.kdf_iterations = enc.kdf_iterations;
            sb.salt = salt;
            sb.wrapped_master_key = wrapped;
            plaintext_master_key = Some(master_key);
            debug!("format: seeded encryption fields, master key wrapped under PBKDF2 user key");
        }
    }

    info!(
        "built superblock: {} total blocks, {} inodes, {} data blocks",
        sb.total_blocks, sb.inode_count, regions.data_blocks
    );
    Ok((sb, plaintext_master_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_struct_is_exactly_one_block() {
        assert_eq!(std::mem::size_of::<SuperblockRaw>(), BLOCK_SIZE);
    }

    #[test]
    fn build_superblock_matches_200_mib_scenario() {
        let total_blocks = (200 * 1024 * 1024 / BLOCK_SIZE) as u64;
        let (sb, key) = build_superblock(total_blocks, &FormatOptions::default()).unwrap();
        assert!(key.is_none());
        assert_eq!(sb.magic, MAGIC);
        assert_eq!(sb.total_blocks, 51200);
        assert_eq!(sb.inode_store_blocks, 915);
        assert_eq!(sb.inode_bitmap_blocks, 2);
        assert_eq!(sb.block_bitmap_blocks, 2);
        assert_eq!(sb.free_inodes, sb.inode_count - 1);
    }

    #[test]
    fn chacha20_poly1305_is_declined_at_format_time() {
        let opts = FormatOptions {
            compression: CompressionOptions::default(),
            encryption: Some(EncryptionOptions {
                algorithm: EncryptionAlgorithm::ChaCha20Poly1305,
                kdf_iterations: 10_000,
                password: Some("p".to_string()),
            }),
        };
        let err = build_superblock(51200, &opts).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn mirror_round_trips_region_fields() {
        let (sb, _) = build_superblock(51200, &FormatOptions::default()).unwrap();
        let mem = SuperblockMem::from_raw(&sb);
        assert_eq!(mem.total_blocks, sb.total_blocks);
        assert_eq!(mem.inode_store_blocks, sb.inode_store_blocks);
    }
}
