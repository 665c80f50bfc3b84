//! Read/write path composing the extent index, codec and key manager
//! (spec.md §4.8).

use lolfs_driver::{BlockStore, BLOCK_SIZE};

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm};
use crate::bitmap::Bitmap;
use crate::codec::{decode_block, encode_block};
use crate::error::{Error, Result};
use crate::extent::{ExtentIndexBlockRaw, ExtentRaw};
use crate::keymanager::KeyManager;

/// The largest byte range the engine will address for one file, per
/// spec.md §4.8's `too-big` failure condition.
pub fn max_file_bytes(max_extent_blocks: u32, max_extents: usize) -> u64 {
    max_extent_blocks as u64 * max_extents as u64 * BLOCK_SIZE as u64
}

fn logical_block_of(byte_offset: u64) -> u32 {
    (byte_offset / BLOCK_SIZE as u64) as u32
}

/// An extent stores one `comp_algo` for all of its blocks, so once a
/// block fails to compress the whole extent must stop claiming
/// compression: re-stores every already-written block from `e.ee_block`
/// up to (not including) `upto` as plain, undecorated ciphertext-or-
/// plaintext, decoded under the extent's old (still-compressed) algorithm
/// first. Blocks at or beyond `upto` have not been written yet and need
/// no rewriting.
fn downgrade_extent_to_uncompressed(
    store: &mut dyn BlockStore,
    e: &ExtentRaw,
    old_comp: CompressionAlgorithm,
    enc_algo: EncryptionAlgorithm,
    key_manager: &KeyManager,
    upto: u32,
) -> Result<()> {
    let key = if enc_algo.is_none() {
        None
    } else {
        Some(*key_manager.master_key()?)
    };
    for logical in e.ee_block..upto {
        let physical = e.ee_start + (logical - e.ee_block);
        let mut raw = [0u8; BLOCK_SIZE];
        store
            .read_block(physical as usize, &mut raw)
            .map_err(Error::IoError)?;
        let plaintext = decode_block(old_comp, enc_algo, key.as_ref(), logical as u64, &raw)?;
        let encoded = encode_block(
            CompressionAlgorithm::None,
            enc_algo,
            key.as_ref(),
            logical as u64,
            &plaintext,
        )?;
        store
            .write_block(physical as usize, &encoded.bytes)
            .map_err(Error::IoError)?;
    }
    Ok(())
}

/// Reads `len` bytes starting at `offset`. Logical blocks with no
/// backing extent read back as zeros (a sparse hole).
pub fn read(
    store: &mut dyn BlockStore,
    index: &ExtentIndexBlockRaw,
    key_manager: &KeyManager,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    let mut remaining = len;
    let mut pos = offset;

    while remaining > 0 {
        let logical = logical_block_of(pos);
        let in_block_off = (pos % BLOCK_SIZE as u64) as usize;
        let take = ((BLOCK_SIZE - in_block_off) as u64).min(remaining) as usize;

        let block = match index.search(logical) {
            Ok(idx) => {
                let e = &index.extents[idx];
                let physical = e.ee_start + (logical - e.ee_block);
                let comp_algo = e.compression()?;
                let enc_algo = e.encryption()?;
                let mut raw = [0u8; BLOCK_SIZE];
                store
                    .read_block(physical as usize, &mut raw)
                    .map_err(Error::IoError)?;
                let key = if enc_algo.is_none() {
                    None
                } else {
                    Some(key_manager.master_key()?)
                };
                decode_block(comp_algo, enc_algo, key, logical as u64, &raw)?
            }
            Err(_) => [0u8; BLOCK_SIZE],
        };
        out.extend_from_slice(&block[in_block_off..in_block_off + take]);
        pos += take as u64;
        remaining -= take as u64;
    }
    Ok(out)
}

/// Writes `data` starting at `offset`, extending allocations as needed.
/// Returns the number of bytes written (always `data.len()` unless an
/// error interrupts the loop).
#[allow(clippy::too_many_arguments)]
pub fn write(
    store: &mut dyn BlockStore,
    index: &mut ExtentIndexBlockRaw,
    block_bitmap: &mut Bitmap,
    max_extent_blocks: u32,
    default_comp: CompressionAlgorithm,
    default_enc: EncryptionAlgorithm,
    key_manager: &KeyManager,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    if !default_enc.is_none() && !key_manager.is_unlocked() {
        return Err(Error::permission_denied(
            "filesystem is locked".to_string(),
        ));
    }

    let mut written = 0usize;
    let mut pos = offset;
    let mut remaining = data.len();

    while remaining > 0 {
        let logical = logical_block_of(pos);
        let in_block_off = (pos % BLOCK_SIZE as u64) as usize;
        let take = (BLOCK_SIZE - in_block_off).min(remaining);

        let idx = index.allocate_for(logical, block_bitmap, max_extent_blocks, default_comp, default_enc)?;
        let e = index.extents[idx];
        let physical = e.ee_start + (logical - e.ee_block);
        let comp_algo = e.compression()?;
        let enc_algo = e.encryption()?;

        let mut plaintext = if take == BLOCK_SIZE {
            [0u8; BLOCK_SIZE]
        } else {
            // merge with existing contents for a partial write
            let key = if enc_algo.is_none() {
                None
            } else {
                Some(key_manager.master_key()?)
            };
            let mut raw = [0u8; BLOCK_SIZE];
            store
                .read_block(physical as usize, &mut raw)
                .map_err(Error::IoError)?;
            decode_block(comp_algo, enc_algo, key, logical as u64, &raw)?
        };
        plaintext[in_block_off..in_block_off + take]
            .copy_from_slice(&data[written..written + take]);

        let key = if enc_algo.is_none() {
            None
        } else {
            Some(key_manager.master_key()?)
        };
        let encoded = encode_block(comp_algo, enc_algo, key, logical as u64, &plaintext)?;

        if !comp_algo.is_none() && !encoded.compressed {
            // This block didn't compress, but earlier blocks in the same
            // extent were already stored under `comp_algo`. The extent
            // can only record one algorithm, so bring it all in line
            // rather than let the stale id misdecode those blocks later.
            downgrade_extent_to_uncompressed(store, &e, comp_algo, enc_algo, key_manager, logical)?;
            let entry = &mut index.extents[idx];
            entry.comp_algo = CompressionAlgorithm::None.as_u32() as u8;
            entry.set_flags_from_algos()?;
        }

        store
            .write_block(physical as usize, &encoded.bytes)
            .map_err(Error::IoError)?;

        written += take;
        pos += take as u64;
        remaining -= take;
    }
    Ok(written)
}

/// Frees trailing extents beyond `new_block_count` (spec.md §4.8's
/// truncate-down path; growth happens implicitly via `write`).
pub fn truncate(index: &mut ExtentIndexBlockRaw, new_block_count: u32, block_bitmap: &mut Bitmap) {
    index.truncate(new_block_count, block_bitmap);
}

#[cfg(test)]
mod tests {
    use super::*;
    use lolfs_driver::MemoryBlockStore;

    fn setup() -> (MemoryBlockStore, ExtentIndexBlockRaw, Bitmap) {
        let store = MemoryBlockStore::new(200);
        let index = ExtentIndexBlockRaw::default();
        let mut bm_store = MemoryBlockStore::new(1);
        let buf = [0xFFu8; BLOCK_SIZE];
        bm_store.write_block(0, &buf).unwrap();
        let bitmap = Bitmap::load(&mut bm_store, 0, 1, 200).unwrap();
        (store, index, bitmap)
    }

    #[test]
    fn write_then_read_round_trips_small_data() {
        let (mut store, mut index, mut bm) = setup();
        let km = KeyManager::disabled();
        write(
            &mut store,
            &mut index,
            &mut bm,
            32,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            &km,
            0,
            b"hello",
        )
        .unwrap();
        let out = read(&mut store, &index, &km, 0, 5).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn read_of_unallocated_region_returns_zeros() {
        let (mut store, index, _bm) = setup();
        let km = KeyManager::disabled();
        let out = read(&mut store, &index, &km, 0, 16).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn partial_write_merges_with_existing_block_contents() {
        let (mut store, mut index, mut bm) = setup();
        let km = KeyManager::disabled();
        write(
            &mut store,
            &mut index,
            &mut bm,
            32,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            &km,
            0,
            b"0123456789",
        )
        .unwrap();
        write(
            &mut store,
            &mut index,
            &mut bm,
            32,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            &km,
            2,
            b"XY",
        )
        .unwrap();
        let out = read(&mut store, &index, &km, 0, 10).unwrap();
        assert_eq!(out, b"01XY456789");
    }

    #[test]
    fn write_fails_when_locked_and_encrypted() {
        let (mut store, mut index, mut bm) = setup();
        let km = KeyManager::locked();
        let err = write(
            &mut store,
            &mut index,
            &mut bm,
            32,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::Aes256Xts,
            &km,
            0,
            b"secret",
        )
        .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn mixed_compressibility_blocks_in_one_extent_round_trip() {
        let (mut store, mut index, mut bm) = setup();
        let km = KeyManager::disabled();
        let mut payload = vec![0u8; BLOCK_SIZE * 2];
        // block 0: highly compressible
        // block 1: incompressible, won't shrink under lz4
        let mut state: u32 = 0xC0FF_EE11;
        for b in payload[BLOCK_SIZE..].iter_mut() {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            *b = (state >> 16) as u8;
        }
        write(
            &mut store,
            &mut index,
            &mut bm,
            32,
            CompressionAlgorithm::Lz4,
            EncryptionAlgorithm::None,
            &km,
            0,
            &payload,
        )
        .unwrap();
        let out = read(&mut store, &index, &km, 0, payload.len() as u64).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn truncate_frees_extents_beyond_new_size() {
        let (mut store, mut index, mut bm) = setup();
        let km = KeyManager::disabled();
        write(
            &mut store,
            &mut index,
            &mut bm,
            2,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            &km,
            0,
            &vec![1u8; BLOCK_SIZE * 3],
        )
        .unwrap();
        let used_before = index.used_count();
        assert!(used_before >= 1);
        truncate(&mut index, 1, &mut bm);
        let out = read(&mut store, &index, &km, 0, BLOCK_SIZE as u64).unwrap();
        assert_eq!(out, vec![1u8; BLOCK_SIZE]);
    }
}
