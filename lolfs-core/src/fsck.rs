//! `check(image)` (spec.md §4.10): validates superblock, bitmap and
//! extent invariants without needing an unlocked key manager, since
//! structural consistency doesn't depend on file content being
//! readable.

use lolfs_driver::BlockStore;

use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::inode::FileType;
use crate::inode::InodeStore;
use crate::layout::RegionSizes;
use crate::superblock::SuperblockRaw;

#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Walks the image structures and reports every invariant violation
/// found, rather than stopping at the first one. A superblock that
/// fails its own magic/algorithm check is reported and ends the walk
/// early, since nothing past it can be trusted to even be addressed
/// correctly.
pub fn check(store: &mut dyn BlockStore) -> Result<CheckReport> {
    let mut report = CheckReport::default();

    let sb = match SuperblockRaw::read_from_store(store) {
        Ok(sb) => sb,
        Err(e) => {
            report.errors.push(format!("superblock: {}", e));
            return Ok(report);
        }
    };

    let expected = RegionSizes::compute(sb.total_blocks);
    if sb.inode_count != expected.inode_count
        || sb.inode_store_blocks != expected.inode_store_blocks
        || sb.inode_bitmap_blocks != expected.inode_bitmap_blocks
        || sb.block_bitmap_blocks != expected.block_bitmap_blocks
    {
        report.errors.push(
            "superblock region sizes are inconsistent with total_blocks".to_string(),
        );
        return Ok(report);
    }
    let data_start = expected.data_start();

    let inode_bitmap = Bitmap::load(
        store,
        expected.inode_bitmap_start(),
        sb.inode_bitmap_blocks,
        sb.inode_count,
    )?;
    let block_bitmap = Bitmap::load(
        store,
        expected.block_bitmap_start(),
        sb.block_bitmap_blocks,
        sb.total_blocks,
    )?;

    if inode_bitmap.free_count() != sb.free_inodes {
        report.errors.push(format!(
            "inode bitmap has {} free bits but the superblock counter says {}",
            inode_bitmap.free_count(),
            sb.free_inodes
        ));
    }
    if block_bitmap.free_count() != sb.free_blocks {
        report.errors.push(format!(
            "block bitmap has {} free bits but the superblock counter says {}",
            block_bitmap.free_count(),
            sb.free_blocks
        ));
    }

    let inode_store = InodeStore::new(expected.inode_store_start(), sb.inode_count);
    let max_extent_blocks = sb.comp_max_extent_blocks.max(1);

    let root = match inode_store.get(store, crate::layout::ROOT_INODE as u64) {
        Ok(r) => r,
        Err(e) => {
            report.errors.push(format!("root inode: {}", e));
            return Ok(report);
        }
    };
    if root.is_free() {
        report.errors.push("root inode is not allocated".to_string());
    } else {
        match root.file_type() {
            Ok(FileType::Directory) => {}
            Ok(other) => report.errors.push(format!(
                "root inode has type {:?}, expected Directory",
                other
            )),
            Err(e) => report.errors.push(format!("root inode: {}", e)),
        }
    }

    for ino in 0..sb.inode_count {
        let inode = match inode_store.get(store, ino) {
            Ok(i) => i,
            Err(e) => {
                report.errors.push(format!("inode {}: {}", ino, e));
                continue;
            }
        };
        if inode.is_free() {
            continue;
        }
        if let Err(e) = inode.file_type() {
            report.errors.push(format!("inode {}: {}", ino, e));
        }
        for block_ptr in [inode.ei_block, inode.xattr_block] {
            if block_ptr == 0 {
                continue;
            }
            if (block_ptr as u64) < data_start || (block_ptr as u64) >= sb.total_blocks {
                report.errors.push(format!(
                    "inode {} has an out-of-range index block pointer {}",
                    ino, block_ptr
                ));
                continue;
            }
            match crate::extent::ExtentIndexBlockRaw::read_from_store(store, block_ptr as usize) {
                Ok(index) => {
                    if let Err(e) = index.validate(max_extent_blocks, data_start, sb.total_blocks)
                    {
                        report
                            .errors
                            .push(format!("inode {} extent index at block {}: {}", ino, block_ptr, e));
                    }
                }
                Err(e) => report.errors.push(format!(
                    "inode {} extent index at block {}: {}",
                    ino, block_ptr, e
                )),
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Filesystem;
    use crate::superblock::FormatOptions;
    use lolfs_driver::MemoryBlockStore;

    #[test]
    fn a_freshly_formatted_image_checks_clean() {
        let store = MemoryBlockStore::new(256);
        let mut fs = Filesystem::format(store, 256, FormatOptions::default()).unwrap();
        let report = check(fs.store_mut()).unwrap();
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn a_corrupted_magic_is_reported_as_an_error() {
        let store = MemoryBlockStore::new(256);
        let mut fs = Filesystem::format(store, 256, FormatOptions::default()).unwrap();
        let mut block = [0u8; lolfs_driver::BLOCK_SIZE];
        fs.store_mut().read_block(0, &mut block).unwrap();
        block[8] = !block[8];
        fs.store_mut().write_block(0, &block).unwrap();
        let report = check(fs.store_mut()).unwrap();
        assert!(!report.errors.is_empty());
    }
}
