//! The top-level filesystem handle (spec.md §6): composes the
//! superblock, both bitmaps, the inode store and the key manager into
//! the actual operations a frontend calls.
//!
//! Grounded in the teacher's `rfs_lib::fs::Ext2FileSystem`, which plays
//! the same composing role over its own desc/mem/disk_driver layers; the
//! FUSE adapter's own `ino -> parent ino` table (`rfs_lib::fuse`) is the
//! model for `parent_of` here, since fixed-size inodes have no spare
//! field for a parent pointer.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use lolfs_driver::BlockStore;

use crate::algorithms::KdfAlgorithm;
use crate::bitmap::Bitmap;
use crate::directory::{self, DirListEntry};
use crate::error::{Error, Result};
use crate::extent::ExtentIndexBlockRaw;
use crate::file_io;
use crate::fsck::{self, CheckReport};
use crate::inode::{FileType, InodeRaw, InodeStore};
use crate::keymanager::KeyManager;
use crate::layout::{BLOCK_SIZE, MAX_EXTENTS_PER_BLOCK, ROOT_INODE};
use crate::superblock::{build_superblock, FormatOptions, SuperblockMem, SuperblockRaw};
use crate::xattr::{self, SetFlags, XattrEntry, XattrNamespace};

/// Every directory extent is exactly this many blocks (spec.md §4.7);
/// see directory.rs's module doc for why that differs from file data's
/// adaptive policy.
const BLOCKS_PER_DIR_EXTENT: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub unlocked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub ino: u32,
    pub file_type: FileType,
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as u32
}

pub struct Filesystem<S: BlockStore> {
    store: S,
    sb: SuperblockRaw,
    inode_bitmap: Bitmap,
    block_bitmap: Bitmap,
    inode_store: InodeStore,
    key_manager: KeyManager,
    parent_of: HashMap<u32, u32>,
}

impl<S: BlockStore> Filesystem<S> {
    /// Lays out a brand-new image: superblock, zeroed inode store, fully
    /// free bitmaps with the fixed region reserved, and a root directory
    /// at inode 0.
    pub fn format(mut store: S, total_blocks: u64, options: FormatOptions) -> Result<Self> {
        let (mut sb, master_key) = build_superblock(total_blocks, &options)?;
        sb.write_to_store(&mut store)?;

        let regions = sb.regions();
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..regions.inode_store_blocks {
            store
                .write_block((regions.inode_store_start() + i) as usize, &zero)
                .map_err(Error::IoError)?;
        }

        let all_free = [0xFFu8; BLOCK_SIZE];
        for i in 0..regions.inode_bitmap_blocks {
            store
                .write_block((regions.inode_bitmap_start() + i) as usize, &all_free)
                .map_err(Error::IoError)?;
        }
        for i in 0..regions.block_bitmap_blocks {
            store
                .write_block((regions.block_bitmap_start() + i) as usize, &all_free)
                .map_err(Error::IoError)?;
        }
        let mut inode_bitmap = Bitmap::load(
            &mut store,
            regions.inode_bitmap_start(),
            regions.inode_bitmap_blocks,
            regions.inode_count,
        )?;
        let mut block_bitmap = Bitmap::load(
            &mut store,
            regions.block_bitmap_start(),
            regions.block_bitmap_blocks,
            regions.total_blocks,
        )?;

        block_bitmap
            .alloc_run(regions.data_start())
            .ok_or_else(|| Error::no_space("cannot reserve the fixed region".to_string()))?;

        let inode_store = InodeStore::new(regions.inode_store_start(), regions.inode_count);
        let root_ino = inode_store.allocate(&mut inode_bitmap)?;

        let ei_block = block_bitmap
            .alloc_one()
            .ok_or_else(|| Error::no_space("no free block for the root directory".to_string()))?;
        ExtentIndexBlockRaw::default().write_to_store(&mut store, ei_block as usize)?;

        let ts = now();
        let mut root_inode = InodeRaw::new(FileType::Directory, 0o755, 0, 0, ts);
        root_inode.nlink = 2;
        root_inode.ei_block = ei_block as u32;
        inode_store.put(&mut store, root_ino, &root_inode)?;

        sb.free_inodes = inode_bitmap.free_count();
        sb.free_blocks = block_bitmap.free_count();
        sb.write_to_store(&mut store)?;
        inode_bitmap.flush(&mut store)?;
        block_bitmap.flush(&mut store)?;
        store.flush().map_err(Error::IoError)?;

        let key_manager = match master_key {
            Some(k) => KeyManager::unlocked_with(k),
            None => KeyManager::disabled(),
        };

        let mut parent_of = HashMap::new();
        parent_of.insert(ROOT_INODE, ROOT_INODE);

        Ok(Self {
            store,
            sb,
            inode_bitmap,
            block_bitmap,
            inode_store,
            key_manager,
            parent_of,
        })
    }

    /// Opens an existing image. Encrypted images start locked; call
    /// `unlock` before any `read`/`write` that touches an encrypted
    /// extent.
    pub fn open(mut store: S) -> Result<Self> {
        let sb = SuperblockRaw::read_from_store(&mut store)?;
        let regions = sb.regions();
        let inode_bitmap = Bitmap::load(
            &mut store,
            regions.inode_bitmap_start(),
            sb.inode_bitmap_blocks,
            sb.inode_count,
        )?;
        let block_bitmap = Bitmap::load(
            &mut store,
            regions.block_bitmap_start(),
            sb.block_bitmap_blocks,
            sb.total_blocks,
        )?;
        let inode_store = InodeStore::new(regions.inode_store_start(), sb.inode_count);
        let key_manager = if sb.encryption()?.is_none() {
            KeyManager::disabled()
        } else {
            KeyManager::locked()
        };

        let mut fs = Self {
            store,
            sb,
            inode_bitmap,
            block_bitmap,
            inode_store,
            key_manager,
            parent_of: HashMap::new(),
        };
        fs.parent_of = fs.rebuild_parent_map()?;
        Ok(fs)
    }

    /// Flushes metadata and returns the underlying store.
    pub fn close(mut self) -> Result<S> {
        self.sync_meta()?;
        self.store.flush().map_err(Error::IoError)?;
        Ok(self.store)
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn root_ino(&self) -> u32 {
        ROOT_INODE
    }

    pub fn encryption_status(&self) -> EncryptionStatus {
        EncryptionStatus {
            enabled: self.key_manager.is_enabled(),
            unlocked: self.key_manager.is_unlocked(),
        }
    }

    pub fn unlock(&mut self, password: &str) -> Result<()> {
        let kdf = KdfAlgorithm::from_u32(self.sb.kdf_algo)?;
        self.key_manager.unlock(
            password,
            kdf,
            self.sb.kdf_iterations,
            &self.sb.salt,
            &self.sb.wrapped_master_key,
        )
    }

    pub fn lock(&mut self) {
        self.key_manager.lock();
    }

    pub fn check(&mut self) -> Result<CheckReport> {
        fsck::check(&mut self.store)
    }

    pub fn summary(&self) -> String {
        SuperblockMem::from_raw(&self.sb).to_string()
    }

    fn sync_meta(&mut self) -> Result<()> {
        self.sb.free_inodes = self.inode_bitmap.free_count();
        self.sb.free_blocks = self.block_bitmap.free_count();
        self.sb.write_to_store(&mut self.store)?;
        self.inode_bitmap.flush(&mut self.store)?;
        self.block_bitmap.flush(&mut self.store)
    }

    fn load_dir(&mut self, ino: u32) -> Result<(InodeRaw, ExtentIndexBlockRaw)> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Directory {
            return Err(Error::invalid_image(format!(
                "inode {} is not a directory",
                ino
            )));
        }
        let index = if inode.ei_block == 0 {
            ExtentIndexBlockRaw::default()
        } else {
            ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.ei_block as usize)?
        };
        Ok((inode, index))
    }

    fn save_dir_index(&mut self, inode: &InodeRaw, index: &ExtentIndexBlockRaw) -> Result<()> {
        index.write_to_store(&mut self.store, inode.ei_block as usize)
    }

    fn rebuild_parent_map(&mut self) -> Result<HashMap<u32, u32>> {
        let mut map = HashMap::new();
        map.insert(ROOT_INODE, ROOT_INODE);
        let mut stack = vec![ROOT_INODE];
        while let Some(dir_ino) = stack.pop() {
            let (_, index) = self.load_dir(dir_ino)?;
            let nr_files = index.header.nr_files as u64;
            let (entries, _) = directory::iterate(
                &mut self.store,
                &index,
                nr_files,
                BLOCKS_PER_DIR_EXTENT,
                dir_ino,
                dir_ino,
                2, // skip the synthetic "." / ".." entries
                usize::MAX,
            )?;
            for entry in entries {
                map.entry(entry.ino).or_insert(dir_ino);
                let child = self.inode_store.get(&mut self.store, entry.ino as u64)?;
                if child.file_type()? == FileType::Directory {
                    stack.push(entry.ino);
                }
            }
        }
        Ok(map)
    }

    pub fn metadata(&mut self, ino: u32) -> Result<Metadata> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        Ok(Metadata {
            ino,
            file_type: inode.file_type()?,
            size: inode.size as u64,
            nlink: inode.nlink,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        })
    }

    pub fn lookup(&mut self, parent_ino: u32, name: &str) -> Result<u32> {
        let (_, index) = self.load_dir(parent_ino)?;
        let nr_files = index.header.nr_files as u64;
        directory::lookup(&mut self.store, &index, nr_files, BLOCKS_PER_DIR_EXTENT, name)?
            .ok_or_else(|| Error::not_found(format!("no such entry: {}", name)))
    }

    /// `.`/`..` then real entries in on-disk order, resuming from
    /// `cursor` (spec.md §4.7).
    pub fn list_dir(
        &mut self,
        ino: u32,
        cursor: u64,
        max_entries: usize,
    ) -> Result<(Vec<DirListEntry>, u64)> {
        let (_, index) = self.load_dir(ino)?;
        let nr_files = index.header.nr_files as u64;
        let parent = *self.parent_of.get(&ino).unwrap_or(&ino);
        directory::iterate(
            &mut self.store,
            &index,
            nr_files,
            BLOCKS_PER_DIR_EXTENT,
            ino,
            parent,
            cursor,
            max_entries,
        )
    }

    fn create_entry(
        &mut self,
        parent_ino: u32,
        name: &str,
        file_type: FileType,
        perm: u32,
    ) -> Result<u32> {
        let (mut parent_inode, mut parent_index) = self.load_dir(parent_ino)?;
        let mut nr_files = parent_index.header.nr_files as u64;
        if directory::lookup(&mut self.store, &parent_index, nr_files, BLOCKS_PER_DIR_EXTENT, name)?
            .is_some()
        {
            return Err(Error::exists(format!("{} already exists", name)));
        }

        let ino = self.inode_store.allocate(&mut self.inode_bitmap)? as u32;
        let ts = now();
        let mut inode = InodeRaw::new(file_type, perm, 0, 0, ts);
        inode.nlink = if file_type == FileType::Directory { 2 } else { 1 };
        if file_type == FileType::Directory {
            let ei_block = self.block_bitmap.alloc_one().ok_or_else(|| {
                Error::no_space("no free block for a new directory".to_string())
            })?;
            ExtentIndexBlockRaw::default().write_to_store(&mut self.store, ei_block as usize)?;
            inode.ei_block = ei_block as u32;
            parent_inode.nlink += 1;
        }
        self.inode_store.put(&mut self.store, ino as u64, &inode)?;

        let comp = self.sb.compression()?;
        let enc = self.sb.encryption()?;
        directory::insert(
            &mut self.store,
            &mut parent_index,
            &mut nr_files,
            BLOCKS_PER_DIR_EXTENT,
            MAX_EXTENTS_PER_BLOCK,
            &mut self.block_bitmap,
            comp,
            enc,
            name,
            ino,
        )?;
        self.save_dir_index(&parent_inode, &parent_index)?;
        if file_type == FileType::Directory {
            self.inode_store
                .put(&mut self.store, parent_ino as u64, &parent_inode)?;
        }
        self.parent_of.insert(ino, parent_ino);
        self.sync_meta()?;
        Ok(ino)
    }

    pub fn create_file(&mut self, parent_ino: u32, name: &str, perm: u32) -> Result<u32> {
        self.create_entry(parent_ino, name, FileType::Regular, perm)
    }

    pub fn create_dir(&mut self, parent_ino: u32, name: &str, perm: u32) -> Result<u32> {
        self.create_entry(parent_ino, name, FileType::Directory, perm)
    }

    pub fn create_symlink(&mut self, parent_ino: u32, name: &str, target: &str) -> Result<u32> {
        let ino = self.create_entry(parent_ino, name, FileType::Symlink, 0o777)?;
        let mut inode = self.inode_store.get(&mut self.store, ino as u64)?;
        inode.set_inline_symlink(target)?;
        self.inode_store.put(&mut self.store, ino as u64, &inode)?;
        Ok(ino)
    }

    pub fn read_symlink(&mut self, ino: u32) -> Result<String> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Symlink {
            return Err(Error::invalid_image(format!("inode {} is not a symlink", ino)));
        }
        inode.inline_symlink()
    }

    pub fn read(&mut self, ino: u32, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Regular {
            return Err(Error::invalid_image(format!("inode {} is not a regular file", ino)));
        }
        let avail = (inode.size as u64).saturating_sub(offset);
        let len = len.min(avail);
        if len == 0 {
            return Ok(Vec::new());
        }
        let index = if inode.ei_block == 0 {
            ExtentIndexBlockRaw::default()
        } else {
            ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.ei_block as usize)?
        };
        file_io::read(&mut self.store, &index, &self.key_manager, offset, len)
    }

    pub fn write(&mut self, ino: u32, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Regular {
            return Err(Error::invalid_image(format!("inode {} is not a regular file", ino)));
        }
        let max_extent_blocks = self.sb.comp_max_extent_blocks.max(1);
        let max_bytes = file_io::max_file_bytes(max_extent_blocks, MAX_EXTENTS_PER_BLOCK);
        if offset + data.len() as u64 > max_bytes {
            return Err(Error::too_big(format!(
                "write would exceed the {} byte file size limit",
                max_bytes
            )));
        }

        if inode.ei_block == 0 {
            let ei_block = self.block_bitmap.alloc_one().ok_or_else(|| {
                Error::no_space("no free block for a new file's extent index".to_string())
            })?;
            ExtentIndexBlockRaw::default().write_to_store(&mut self.store, ei_block as usize)?;
            inode.ei_block = ei_block as u32;
        }
        let mut index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.ei_block as usize)?;
        let comp = self.sb.compression()?;
        let enc = self.sb.encryption()?;
        let written = file_io::write(
            &mut self.store,
            &mut index,
            &mut self.block_bitmap,
            max_extent_blocks,
            comp,
            enc,
            &self.key_manager,
            offset,
            data,
        )?;
        index.write_to_store(&mut self.store, inode.ei_block as usize)?;

        inode.size = inode.size.max((offset + written as u64) as u32);
        inode.blocks = index.used_count() as u32;
        inode.mtime = now();
        self.inode_store.put(&mut self.store, ino as u64, &inode)?;
        self.sync_meta()?;
        Ok(written)
    }

    pub fn truncate(&mut self, ino: u32, new_size: u64) -> Result<()> {
        let mut inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Regular {
            return Err(Error::invalid_image(format!("inode {} is not a regular file", ino)));
        }
        if inode.ei_block != 0 {
            let mut index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.ei_block as usize)?;
            let new_block_count = ((new_size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as u32;
            file_io::truncate(&mut index, new_block_count, &mut self.block_bitmap);
            index.write_to_store(&mut self.store, inode.ei_block as usize)?;
            inode.blocks = index.used_count() as u32;
        }
        inode.size = new_size as u32;
        inode.mtime = now();
        self.inode_store.put(&mut self.store, ino as u64, &inode)?;
        self.sync_meta()
    }

    fn detach_dirent(&mut self, parent_ino: u32, name: &str, ino: u32) -> Result<()> {
        let (parent_inode, mut parent_index) = self.load_dir(parent_ino)?;
        let mut nr_files = parent_index.header.nr_files as u64;
        directory::remove(&mut self.store, &mut parent_index, &mut nr_files, BLOCKS_PER_DIR_EXTENT, name)?;
        self.save_dir_index(&parent_inode, &parent_index)?;

        let mut inode = self.inode_store.get(&mut self.store, ino as u64)?;
        inode.nlink = inode.nlink.saturating_sub(1);
        if inode.nlink == 0 {
            self.inode_store
                .free(&mut self.store, ino as u64, &mut self.inode_bitmap, &mut self.block_bitmap)?;
            self.parent_of.remove(&ino);
        } else {
            self.inode_store.put(&mut self.store, ino as u64, &inode)?;
        }
        self.sync_meta()
    }

    /// Removes a file or symlink entry. Refuses directories; use `rmdir`.
    pub fn unlink(&mut self, parent_ino: u32, name: &str) -> Result<()> {
        let ino = self.lookup(parent_ino, name)?;
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? == FileType::Directory {
            return Err(Error::invalid_image(
                "unlink: is a directory, use rmdir".to_string(),
            ));
        }
        self.detach_dirent(parent_ino, name, ino)
    }

    /// Removes an empty directory entry.
    pub fn rmdir(&mut self, parent_ino: u32, name: &str) -> Result<()> {
        let ino = self.lookup(parent_ino, name)?;
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.file_type()? != FileType::Directory {
            return Err(Error::invalid_image("rmdir: not a directory".to_string()));
        }
        let (_, child_index) = self.load_dir(ino)?;
        if child_index.header.nr_files != 0 {
            return Err(Error::exists("directory not empty".to_string()));
        }
        self.detach_dirent(parent_ino, name, ino)?;
        let mut parent_inode = self.inode_store.get(&mut self.store, parent_ino as u64)?;
        parent_inode.nlink = parent_inode.nlink.saturating_sub(1);
        self.inode_store
            .put(&mut self.store, parent_ino as u64, &parent_inode)?;
        self.sync_meta()
    }

    /// Adds another name for an existing file (hard link). Directories
    /// cannot be hard-linked.
    pub fn link(&mut self, existing_ino: u32, new_parent_ino: u32, new_name: &str) -> Result<()> {
        let mut inode = self.inode_store.get(&mut self.store, existing_ino as u64)?;
        if inode.file_type()? == FileType::Directory {
            return Err(Error::invalid_image(
                "link: hard links to directories are not allowed".to_string(),
            ));
        }
        let (parent_inode, mut parent_index) = self.load_dir(new_parent_ino)?;
        let mut nr_files = parent_index.header.nr_files as u64;
        if directory::lookup(&mut self.store, &parent_index, nr_files, BLOCKS_PER_DIR_EXTENT, new_name)?
            .is_some()
        {
            return Err(Error::exists(format!("{} already exists", new_name)));
        }
        let comp = self.sb.compression()?;
        let enc = self.sb.encryption()?;
        directory::insert(
            &mut self.store,
            &mut parent_index,
            &mut nr_files,
            BLOCKS_PER_DIR_EXTENT,
            MAX_EXTENTS_PER_BLOCK,
            &mut self.block_bitmap,
            comp,
            enc,
            new_name,
            existing_ino,
        )?;
        self.save_dir_index(&parent_inode, &parent_index)?;
        inode.nlink += 1;
        self.inode_store.put(&mut self.store, existing_ino as u64, &inode)?;
        self.sync_meta()
    }

    /// Moves `old_name` under `old_parent` to `new_name` under
    /// `new_parent`, overwriting an existing destination entry (an
    /// existing non-empty destination directory is refused, matching
    /// `rmdir`'s own rule).
    pub fn rename(
        &mut self,
        old_parent: u32,
        old_name: &str,
        new_parent: u32,
        new_name: &str,
    ) -> Result<()> {
        let ino = self.lookup(old_parent, old_name)?;

        let (_, new_index) = self.load_dir(new_parent)?;
        let new_nr = new_index.header.nr_files as u64;
        if let Some(existing) =
            directory::lookup(&mut self.store, &new_index, new_nr, BLOCKS_PER_DIR_EXTENT, new_name)?
        {
            let existing_inode = self.inode_store.get(&mut self.store, existing as u64)?;
            if existing_inode.file_type()? == FileType::Directory {
                self.rmdir(new_parent, new_name)?;
            } else {
                self.unlink(new_parent, new_name)?;
            }
        }

        let (old_parent_inode, mut old_index) = self.load_dir(old_parent)?;
        let mut old_nr = old_index.header.nr_files as u64;
        directory::remove(&mut self.store, &mut old_index, &mut old_nr, BLOCKS_PER_DIR_EXTENT, old_name)?;
        self.save_dir_index(&old_parent_inode, &old_index)?;

        let (new_parent_inode, mut new_index) = self.load_dir(new_parent)?;
        let mut new_nr = new_index.header.nr_files as u64;
        let comp = self.sb.compression()?;
        let enc = self.sb.encryption()?;
        directory::insert(
            &mut self.store,
            &mut new_index,
            &mut new_nr,
            BLOCKS_PER_DIR_EXTENT,
            MAX_EXTENTS_PER_BLOCK,
            &mut self.block_bitmap,
            comp,
            enc,
            new_name,
            ino,
        )?;
        self.save_dir_index(&new_parent_inode, &new_index)?;

        if old_parent != new_parent {
            let inode = self.inode_store.get(&mut self.store, ino as u64)?;
            if inode.file_type()? == FileType::Directory {
                let mut old_parent_inode = self.inode_store.get(&mut self.store, old_parent as u64)?;
                old_parent_inode.nlink = old_parent_inode.nlink.saturating_sub(1);
                self.inode_store
                    .put(&mut self.store, old_parent as u64, &old_parent_inode)?;
                let mut new_parent_inode = self.inode_store.get(&mut self.store, new_parent as u64)?;
                new_parent_inode.nlink += 1;
                self.inode_store
                    .put(&mut self.store, new_parent as u64, &new_parent_inode)?;
            }
        }
        self.parent_of.insert(ino, new_parent);
        self.sync_meta()
    }

    pub fn list_xattr(&mut self, ino: u32) -> Result<Vec<XattrEntry>> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.xattr_block == 0 {
            return Ok(Vec::new());
        }
        let index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.xattr_block as usize)?;
        xattr::list(&mut self.store, &index)
    }

    pub fn get_xattr(&mut self, ino: u32, name: &str) -> Result<Vec<u8>> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.xattr_block == 0 {
            return Err(Error::not_found(format!("no such xattr: {}", name)));
        }
        let index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.xattr_block as usize)?;
        xattr::get(&mut self.store, &index, name)
    }

    pub fn set_xattr(
        &mut self,
        ino: u32,
        namespace: XattrNamespace,
        name: &str,
        value: &[u8],
        flags: SetFlags,
    ) -> Result<()> {
        let mut inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.xattr_block == 0 {
            let block = self
                .block_bitmap
                .alloc_one()
                .ok_or_else(|| Error::no_space("no free block for xattr storage".to_string()))?;
            ExtentIndexBlockRaw::default().write_to_store(&mut self.store, block as usize)?;
            inode.xattr_block = block as u32;
            self.inode_store.put(&mut self.store, ino as u64, &inode)?;
        }
        let mut index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.xattr_block as usize)?;
        let max_extent_blocks = self.sb.comp_max_extent_blocks.max(1);
        xattr::set(
            &mut self.store,
            &mut index,
            &mut self.block_bitmap,
            max_extent_blocks,
            namespace,
            name,
            value,
            flags,
        )?;
        index.write_to_store(&mut self.store, inode.xattr_block as usize)?;
        self.sync_meta()
    }

    pub fn remove_xattr(&mut self, ino: u32, name: &str) -> Result<()> {
        let inode = self.inode_store.get(&mut self.store, ino as u64)?;
        if inode.xattr_block == 0 {
            return Err(Error::not_found(format!("no such xattr: {}", name)));
        }
        let mut index = ExtentIndexBlockRaw::read_from_store(&mut self.store, inode.xattr_block as usize)?;
        xattr::remove(&mut self.store, &mut index, name)?;
        index.write_to_store(&mut self.store, inode.xattr_block as usize)?;
        self.sync_meta()
    }
}
