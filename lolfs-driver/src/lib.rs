//! Backing-store abstraction for lolfs.
//!
//! Generalizes the teacher's `disk_driver` crate: instead of a disk-unit
//! open/seek/read/write/ioctl interface, `BlockStore` works directly in
//! fixed 4 KiB blocks against a backing byte array, biased by a `base`
//! offset that is zero for a raw image and the byte offset of a host
//! container section (e.g. an ELF `.lolfs.super` section) otherwise.
//! The store never interprets block contents.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use log::{debug, trace};

pub const BLOCK_SIZE: usize = 4096;

/// Backing-store abstraction: read/write fixed-size blocks against a byte
/// array, biased by a base offset. `phys` is a block index relative to
/// `base()`, not an absolute byte offset.
pub trait BlockStore {
    /// Total number of blocks available beyond the base offset.
    fn block_count(&self) -> usize;

    /// Byte offset added to every block access; zero for raw images.
    fn base(&self) -> u64;

    fn read_block(&mut self, phys: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    fn write_block(&mut self, phys: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Flush any buffering so that prior writes are durable before a
    /// dependent write is issued, per spec.md §5's ordering guarantees.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn check_bounds(phys: usize, block_count: usize) -> Result<()> {
    if phys >= block_count {
        return Err(anyhow!(
            "block {} out of range (block_count = {})",
            phys,
            block_count
        ));
    }
    Ok(())
}

/// A backing store that lives entirely in memory. Used for tests and for
/// `mkfs`-then-`check` round trips that don't need a real file.
pub struct MemoryBlockStore {
    data: Vec<u8>,
    base: u64,
    block_count: usize,
}

impl MemoryBlockStore {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            data: vec![0u8; total_blocks * BLOCK_SIZE],
            base: 0,
            block_count: total_blocks,
        }
    }

    /// Wrap an existing byte buffer (e.g. one already embedded inside an
    /// ELF image) at the given base byte offset.
    pub fn from_bytes(data: Vec<u8>, base: u64) -> Self {
        let usable = data.len().saturating_sub(base as usize);
        let block_count = usable / BLOCK_SIZE;
        Self {
            data,
            base,
            block_count,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn read_block(&mut self, phys: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_bounds(phys, self.block_count)?;
        let start = self.base as usize + phys * BLOCK_SIZE;
        trace!("memory store: read block {} at byte {}", phys, start);
        buf.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, phys: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_bounds(phys, self.block_count)?;
        let start = self.base as usize + phys * BLOCK_SIZE;
        trace!("memory store: write block {} at byte {}", phys, start);
        self.data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// A backing store that reads/writes through a regular file (or block
/// device), the on-disk counterpart of `MemoryBlockStore`.
pub struct FileBlockStore {
    file: File,
    base: u64,
    block_count: usize,
}

impl FileBlockStore {
    /// Opens `path` for read/write. `total_blocks` is the filesystem size
    /// as understood by the caller (for a raw image this is the whole
    /// file; for an embedded image the caller computes it from the
    /// container's section size).
    pub fn open<P: AsRef<Path>>(path: P, base: u64, total_blocks: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            base,
            block_count: total_blocks,
        })
    }

    /// Creates a new file of the right size (zero-filled) and opens it.
    pub fn create<P: AsRef<Path>>(path: P, total_blocks: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((total_blocks * BLOCK_SIZE) as u64)?;
        debug!(
            "created backing file of {} blocks ({} bytes)",
            total_blocks,
            total_blocks * BLOCK_SIZE
        );
        Ok(Self {
            file,
            base: 0,
            block_count: total_blocks,
        })
    }
}

impl BlockStore for FileBlockStore {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn read_block(&mut self, phys: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_bounds(phys, self.block_count)?;
        let offset = self.base + (phys * BLOCK_SIZE) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, phys: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_bounds(phys, self.block_count)?;
        let offset = self.base + (phys * BLOCK_SIZE) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Read-through / write-through LRU cache in front of another store,
/// generalized from the teacher's `CacheDiskDriver`. Writes still reach
/// the inner store immediately (this spec makes no crash-safety claims
/// beyond ordered single-block writes, so there is nothing to gain from
/// deferring them) but repeated reads of hot metadata blocks (bitmaps,
/// extent index blocks) skip the inner store entirely.
pub struct CachingBlockStore<T: BlockStore> {
    inner: T,
    cache: lru::LruCache<usize, [u8; BLOCK_SIZE]>,
}

impl<T: BlockStore> CachingBlockStore<T> {
    pub fn new(inner: T, capacity: usize) -> Self {
        Self {
            inner,
            cache: lru::LruCache::new(std::num::NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }
}

impl<T: BlockStore> BlockStore for CachingBlockStore<T> {
    fn block_count(&self) -> usize {
        self.inner.block_count()
    }

    fn base(&self) -> u64 {
        self.inner.base()
    }

    fn read_block(&mut self, phys: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if let Some(cached) = self.cache.get(&phys) {
            buf.copy_from_slice(cached);
            return Ok(());
        }
        self.inner.read_block(phys, buf)?;
        self.cache.put(phys, *buf);
        Ok(())
    }

    fn write_block(&mut self, phys: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.inner.write_block(phys, buf)?;
        self.cache.put(phys, *buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_a_block() {
        let mut store = MemoryBlockStore::new(4);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        store.write_block(2, &block).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        store.read_block(2, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn memory_store_rejects_out_of_range_block() {
        let mut store = MemoryBlockStore::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(store.read_block(4, &mut buf).is_err());
    }

    #[test]
    fn memory_store_honors_base_offset() {
        let mut raw = vec![0u8; BLOCK_SIZE * 5];
        raw[BLOCK_SIZE] = 0x42;
        let mut store = MemoryBlockStore::from_bytes(raw, BLOCK_SIZE as u64);
        assert_eq!(store.block_count(), 4);
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn caching_store_serves_reads_without_touching_inner() {
        let inner = MemoryBlockStore::new(4);
        let mut cached = CachingBlockStore::new(inner, 2);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 7;
        cached.write_block(0, &block).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        cached.read_block(0, &mut out).unwrap();
        assert_eq!(out[0], 7);
    }
}
