//! Per-inode extent index (spec.md §4.5).

use lolfs_driver::{BlockStore, BLOCK_SIZE};
use zerocopy::{AsBytes, FromBytes};

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm};
use crate::bitmap::{optimal_run, Bitmap};
use crate::error::{Error, Result};
use crate::layout::{EXTENT_INDEX_HEADER_SIZE, MAX_EXTENTS_PER_BLOCK};

pub const FLAG_COMPRESSED: u8 = 1 << 0;
pub const FLAG_ENCRYPTED: u8 = 1 << 1;
pub const FLAG_HAS_META: u8 = 1 << 2;
pub const FLAG_MIXED: u8 = 1 << 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, PartialEq, Eq)]
pub struct ExtentRaw {
    pub ee_block: u32,
    pub ee_len: u32,
    pub ee_start: u32,
    pub comp_algo: u8,
    pub enc_algo: u8,
    pub flags: u8,
    pub _pad0: u8,
    pub ee_meta: u32,
    pub _reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<ExtentRaw>() == 24);

impl Default for ExtentRaw {
    fn default() -> Self {
        ExtentRaw {
            ee_block: 0,
            ee_len: 0,
            ee_start: 0,
            comp_algo: 0,
            enc_algo: 0,
            flags: 0,
            _pad0: 0,
            ee_meta: 0,
            _reserved: [0; 4],
        }
    }
}

impl ExtentRaw {
    pub fn is_used(&self) -> bool {
        self.ee_start != 0
    }

    pub fn logical_end(&self) -> u32 {
        self.ee_block + self.ee_len
    }

    pub fn covers(&self, logical: u32) -> bool {
        self.is_used() && logical >= self.ee_block && logical < self.logical_end()
    }

    pub fn compression(&self) -> Result<CompressionAlgorithm> {
        CompressionAlgorithm::from_u32(self.comp_algo as u32)
    }

    pub fn encryption(&self) -> Result<EncryptionAlgorithm> {
        EncryptionAlgorithm::from_u32(self.enc_algo as u32)
    }

    pub fn set_flags_from_algos(&mut self) -> Result<()> {
        let comp = self.compression()?;
        let enc = self.encryption()?;
        let mut flags = self.flags & (FLAG_HAS_META | FLAG_MIXED);
        if !comp.is_none() {
            flags |= FLAG_COMPRESSED;
        }
        if !enc.is_none() {
            flags |= FLAG_ENCRYPTED;
        }
        self.flags = flags;
        Ok(())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct ExtentIndexHeader {
    pub nr_files: u32,
    pub _reserved: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<ExtentIndexHeader>() == EXTENT_INDEX_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct ExtentIndexBlockRaw {
    pub header: ExtentIndexHeader,
    pub extents: [ExtentRaw; MAX_EXTENTS_PER_BLOCK],
}

const _: () = assert!(std::mem::size_of::<ExtentIndexBlockRaw>() == BLOCK_SIZE);

impl Default for ExtentIndexBlockRaw {
    fn default() -> Self {
        ExtentIndexBlockRaw {
            header: ExtentIndexHeader {
                nr_files: 0,
                _reserved: [0; 12],
            },
            extents: [ExtentRaw::default(); MAX_EXTENTS_PER_BLOCK],
        }
    }
}

impl ExtentIndexBlockRaw {
    pub fn read_from_store(store: &mut dyn BlockStore, phys: usize) -> Result<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(phys, &mut buf).map_err(Error::IoError)?;
        ExtentIndexBlockRaw::read_from(&buf[..])
            .ok_or_else(|| Error::invalid_image("extent index block has the wrong size".into()))
    }

    pub fn write_to_store(&self, store: &mut dyn BlockStore, phys: usize) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(self.as_bytes());
        store.write_block(phys, &buf).map_err(Error::IoError)
    }

    /// Number of leading entries with a nonzero `ee_start` (spec.md
    /// §4.5: "the count of used extents is the number of leading
    /// entries with nonzero start").
    pub fn used_count(&self) -> usize {
        self.extents.iter().take_while(|e| e.is_used()).count()
    }

    /// Binary search over the used prefix for the extent covering
    /// `logical`. Returns `Ok(index)` if found, `Err(Some(next_free))`
    /// if there's room to allocate, `Err(None)` if the block is full.
    pub fn search(&self, logical: u32) -> std::result::Result<usize, Option<usize>> {
        let used = self.used_count();
        let mut lo = 0usize;
        let mut hi = used;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = &self.extents[mid];
            if logical < e.ee_block {
                hi = mid;
            } else if logical >= e.logical_end() {
                lo = mid + 1;
            } else {
                return Ok(mid);
            }
        }
        if used < self.extents.len() {
            Err(Some(used))
        } else {
            Err(None)
        }
    }

    /// Hint variant: tries `last` and `last + 1` before falling back to
    /// full binary search, for O(1) sequential access.
    pub fn search_hinted(
        &self,
        logical: u32,
        last: Option<usize>,
    ) -> std::result::Result<usize, Option<usize>> {
        if let Some(last) = last {
            if let Some(e) = self.extents.get(last) {
                if e.covers(logical) {
                    return Ok(last);
                }
            }
            if let Some(e) = self.extents.get(last + 1) {
                if e.covers(logical) {
                    return Ok(last + 1);
                }
            }
        }
        self.search(logical)
    }

    /// Checks the invariants of spec.md §3: ordering, contiguity,
    /// bounded lengths, physical starts inside the data region
    /// (`[data_start, total_blocks)`; extents never point into the
    /// superblock, inode store or bitmaps).
    pub fn validate(
        &self,
        max_extent_blocks: u32,
        data_start: u64,
        total_blocks: u64,
    ) -> Result<()> {
        let used = self.used_count();
        let mut expected_start = 0u32;
        for (i, e) in self.extents[..used].iter().enumerate() {
            if e.ee_block != expected_start {
                return Err(Error::invalid_image(format!(
                    "extent {} starts at logical {} but {} was expected (a hole or overlap)",
                    i, e.ee_block, expected_start
                )));
            }
            if e.ee_len == 0 || e.ee_len > max_extent_blocks {
                return Err(Error::invalid_image(format!(
                    "extent {} has invalid length {}",
                    i, e.ee_len
                )));
            }
            if (e.ee_start as u64) < data_start || (e.ee_start as u64) >= total_blocks {
                return Err(Error::invalid_image(format!(
                    "extent {} has out-of-range physical start {}",
                    i, e.ee_start
                )));
            }
            let comp = e.compression()?;
            let enc = e.encryption()?;
            if (e.flags & FLAG_COMPRESSED != 0) != !comp.is_none() {
                return Err(Error::invalid_image(format!(
                    "extent {} flag/algorithm mismatch for compression",
                    i
                )));
            }
            if (e.flags & FLAG_ENCRYPTED != 0) != !enc.is_none() {
                return Err(Error::invalid_image(format!(
                    "extent {} flag/algorithm mismatch for encryption",
                    i
                )));
            }
            expected_start = e.logical_end();
        }
        for e in &self.extents[used..] {
            if e.is_used() {
                return Err(Error::invalid_image(
                    "extent index has a used entry after the first unused slot".into(),
                ));
            }
        }
        Ok(())
    }

    /// If `logical` already falls in an extent, returns it; otherwise
    /// appends a new extent with an adaptively-sized run (spec.md
    /// §4.2/§4.5), defaulting its algorithm ids from the superblock.
    pub fn allocate_for(
        &mut self,
        logical: u32,
        block_bitmap: &mut Bitmap,
        max_extent_blocks: u32,
        default_comp: CompressionAlgorithm,
        default_enc: EncryptionAlgorithm,
    ) -> Result<usize> {
        match self.search(logical) {
            Ok(idx) => Ok(idx),
            Err(Some(idx)) => {
                let current_file_blocks: u64 =
                    self.extents[..idx].iter().map(|e| e.ee_len as u64).sum();
                let free = block_bitmap.free_count();
                let run = optimal_run(current_file_blocks, max_extent_blocks as u64, free);
                let first = block_bitmap
                    .alloc_run_hinted(run)
                    .ok_or_else(|| Error::no_space("no free run for extent allocation"))?;
                let ee_block = if idx == 0 {
                    0
                } else {
                    self.extents[idx - 1].logical_end()
                };
                let mut e = ExtentRaw {
                    ee_block,
                    ee_len: run as u32,
                    ee_start: first as u32,
                    comp_algo: default_comp.as_u32() as u8,
                    enc_algo: default_enc.as_u32() as u8,
                    ..ExtentRaw::default()
                };
                e.set_flags_from_algos()?;
                self.extents[idx] = e;
                Ok(idx)
            }
            Err(None) => Err(Error::no_space("extent index block has no free slots")),
        }
    }

    /// From the extent covering `new_block_count - 1` forward, frees
    /// every extent's physical run and clears its entry (spec.md
    /// §4.5). `new_block_count == 0` clears every used extent.
    pub fn truncate(&mut self, new_block_count: u32, block_bitmap: &mut Bitmap) {
        let used = self.used_count();
        let mut start_idx = used;
        for (i, e) in self.extents[..used].iter().enumerate() {
            if new_block_count == 0 || e.ee_block >= new_block_count {
                start_idx = i;
                break;
            }
        }
        for i in start_idx..used {
            let e = self.extents[i];
            block_bitmap.free_run(e.ee_start as u64, e.ee_len as u64);
            self.extents[i] = ExtentRaw::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(extents: &[(u32, u32, u32)]) -> ExtentIndexBlockRaw {
        let mut b = ExtentIndexBlockRaw::default();
        for (i, &(ee_block, ee_len, ee_start)) in extents.iter().enumerate() {
            b.extents[i] = ExtentRaw {
                ee_block,
                ee_len,
                ee_start,
                ..ExtentRaw::default()
            };
        }
        b
    }

    #[test]
    fn raw_structs_match_disk_sizes() {
        assert_eq!(std::mem::size_of::<ExtentRaw>(), 24);
        assert_eq!(std::mem::size_of::<ExtentIndexBlockRaw>(), BLOCK_SIZE);
    }

    #[test]
    fn used_count_stops_at_first_unused_entry() {
        let b = block_with(&[(0, 2, 100), (2, 4, 102)]);
        assert_eq!(b.used_count(), 2);
    }

    #[test]
    fn search_finds_the_covering_extent() {
        let b = block_with(&[(0, 2, 100), (2, 4, 200), (6, 8, 300)]);
        for logical in 0..2 {
            assert_eq!(b.search(logical), Ok(0));
        }
        for logical in 2..6 {
            assert_eq!(b.search(logical), Ok(1));
        }
        for logical in 6..14 {
            assert_eq!(b.search(logical), Ok(2));
        }
    }

    #[test]
    fn search_past_the_end_returns_next_free_slot() {
        let b = block_with(&[(0, 2, 100)]);
        assert_eq!(b.search(100), Err(Some(1)));
    }

    #[test]
    fn search_hinted_matches_plain_search() {
        let b = block_with(&[(0, 2, 100), (2, 4, 200), (6, 8, 300)]);
        assert_eq!(b.search_hinted(7, Some(2)), Ok(2));
        assert_eq!(b.search_hinted(0, Some(2)), Ok(0));
    }

    #[test]
    fn validate_accepts_contiguous_extents() {
        let mut b = block_with(&[(0, 2, 100), (2, 4, 200)]);
        for e in b.extents[..2].iter_mut() {
            e.set_flags_from_algos().unwrap();
        }
        assert!(b.validate(32, 50, 10_000).is_ok());
    }

    #[test]
    fn validate_rejects_a_logical_hole() {
        let b = block_with(&[(0, 2, 100), (3, 4, 200)]);
        assert!(b.validate(32, 50, 10_000).is_err());
    }

    #[test]
    fn validate_rejects_zero_physical_start() {
        let b = block_with(&[(0, 2, 0)]);
        assert!(b.validate(32, 50, 10_000).is_err());
    }

    fn free_bitmap(num_bits: u64) -> Bitmap {
        use lolfs_driver::MemoryBlockStore;
        let num_blocks = ((num_bits + 8 * BLOCK_SIZE as u64 - 1) / (8 * BLOCK_SIZE as u64)).max(1);
        let mut store = MemoryBlockStore::new(num_blocks as usize);
        let buf = [0xFFu8; BLOCK_SIZE];
        for i in 0..num_blocks {
            store.write_block(i as usize, &buf).unwrap();
        }
        Bitmap::load(&mut store, 0, num_blocks, num_bits).unwrap()
    }

    #[test]
    fn allocate_for_appends_an_adaptive_run_starting_at_zero() {
        let mut b = ExtentIndexBlockRaw::default();
        let mut bm = free_bitmap(1000);
        let idx = b
            .allocate_for(0, &mut bm, 32, CompressionAlgorithm::None, EncryptionAlgorithm::None)
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(b.extents[0].ee_block, 0);
        assert_eq!(b.extents[0].ee_len, 2);
    }

    #[test]
    fn allocate_for_reuses_an_existing_extent() {
        let mut b = ExtentIndexBlockRaw::default();
        let mut bm = free_bitmap(1000);
        b.allocate_for(0, &mut bm, 32, CompressionAlgorithm::None, EncryptionAlgorithm::None)
            .unwrap();
        let idx = b
            .allocate_for(1, &mut bm, 32, CompressionAlgorithm::None, EncryptionAlgorithm::None)
            .unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn truncate_frees_trailing_extents() {
        let mut b = block_with(&[(0, 2, 100), (2, 4, 200)]);
        let mut bm = free_bitmap(1000);
        b.truncate(2, &mut bm);
        assert_eq!(b.used_count(), 1);
        assert_eq!(b.extents[1], ExtentRaw::default());
    }
}
