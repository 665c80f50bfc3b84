//! Fixed-size inode records (spec.md §4.6).

use lolfs_driver::{BlockStore, BLOCK_SIZE};
use zerocopy::{AsBytes, FromBytes};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::extent::ExtentIndexBlockRaw;
use crate::layout::{inodes_per_block, INODE_SIZE, SYMLINK_INLINE_MAX};

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl FileType {
    fn type_bits(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }

    fn from_mode(mode: u32) -> Result<Self> {
        match mode & S_IFMT {
            S_IFREG => Ok(FileType::Regular),
            S_IFDIR => Ok(FileType::Directory),
            S_IFLNK => Ok(FileType::Symlink),
            other => Err(Error::invalid_image(format!(
                "inode mode {:#o} has an unrecognized type bits {:#o}",
                mode, other
            ))),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct InodeRaw {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub blocks: u32,
    pub nlink: u32,
    pub ei_block: u32,
    pub xattr_block: u32,
    pub inline_data: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<InodeRaw>() == INODE_SIZE);

impl Default for InodeRaw {
    fn default() -> Self {
        InodeRaw {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            ctime: 0,
            atime: 0,
            mtime: 0,
            blocks: 0,
            nlink: 0,
            ei_block: 0,
            xattr_block: 0,
            inline_data: [0; 28],
        }
    }
}

impl InodeRaw {
    pub fn is_free(&self) -> bool {
        self.nlink == 0
    }

    pub fn file_type(&self) -> Result<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn new(kind: FileType, perm: u32, uid: u32, gid: u32, now: u32) -> Self {
        InodeRaw {
            mode: kind.type_bits() | (perm & 0o7777),
            uid,
            gid,
            size: 0,
            ctime: now,
            atime: now,
            mtime: now,
            blocks: 0,
            nlink: 0,
            ei_block: 0,
            xattr_block: 0,
            inline_data: [0; 28],
        }
    }

    pub fn set_inline_symlink(&mut self, target: &str) -> Result<()> {
        if target.len() > SYMLINK_INLINE_MAX {
            return Err(Error::too_big(format!(
                "symlink target {} bytes exceeds the {} byte inline limit",
                target.len(),
                SYMLINK_INLINE_MAX
            )));
        }
        self.inline_data = [0; 28];
        self.inline_data[..target.len()].copy_from_slice(target.as_bytes());
        self.size = target.len() as u32;
        Ok(())
    }

    pub fn inline_symlink(&self) -> Result<String> {
        let nul = self
            .inline_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.inline_data.len());
        String::from_utf8(self.inline_data[..nul].to_vec())
            .map_err(|e| Error::invalid_image(format!("symlink target is not valid UTF-8: {}", e)))
    }
}

/// Flat array of fixed-size inode records, addressed by inode number.
pub struct InodeStore {
    start_block: u64,
    inode_count: u64,
}

impl InodeStore {
    pub fn new(start_block: u64, inode_count: u64) -> Self {
        Self {
            start_block,
            inode_count,
        }
    }

    fn location(&self, ino: u64) -> Result<(usize, usize)> {
        if ino >= self.inode_count {
            return Err(Error::not_found(format!("inode {} out of range", ino)));
        }
        let per_block = inodes_per_block() as u64;
        let block = self.start_block + ino / per_block;
        let offset = (ino % per_block) as usize * INODE_SIZE;
        Ok((block as usize, offset))
    }

    pub fn get(&self, store: &mut dyn BlockStore, ino: u64) -> Result<InodeRaw> {
        let (block, offset) = self.location(ino)?;
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(block, &mut buf).map_err(Error::IoError)?;
        InodeRaw::read_from(&buf[offset..offset + INODE_SIZE])
            .ok_or_else(|| Error::invalid_image("corrupt inode record".to_string()))
    }

    pub fn put(&self, store: &mut dyn BlockStore, ino: u64, record: &InodeRaw) -> Result<()> {
        let (block, offset) = self.location(ino)?;
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(block, &mut buf).map_err(Error::IoError)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(record.as_bytes());
        store.write_block(block, &buf).map_err(Error::IoError)
    }

    pub fn allocate(&self, inode_bitmap: &mut Bitmap) -> Result<u64> {
        inode_bitmap
            .alloc_one()
            .ok_or_else(|| Error::no_space("no free inodes".to_string()))
    }

    /// Clears the record, frees blocks reachable from `ei_block` and
    /// `xattr_block`, then releases the inode bit.
    pub fn free(
        &self,
        store: &mut dyn BlockStore,
        ino: u64,
        inode_bitmap: &mut Bitmap,
        block_bitmap: &mut Bitmap,
    ) -> Result<()> {
        let inode = self.get(store, ino)?;
        for block_ptr in [inode.ei_block, inode.xattr_block] {
            if block_ptr != 0 {
                let mut index = ExtentIndexBlockRaw::read_from_store(store, block_ptr as usize)?;
                index.truncate(0, block_bitmap);
                index.write_to_store(store, block_ptr as usize)?;
                block_bitmap.free_one(block_ptr as u64);
            }
        }
        self.put(store, ino, &InodeRaw::default())?;
        inode_bitmap.free_one(ino);
        Ok(())
    }
}
