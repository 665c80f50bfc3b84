//! Extent-backed directory blocks of fixed-width name entries (spec.md
//! §4.7).
//!
//! Directories use fixed-length extents (every directory extent is
//! exactly `blocks_per_extent` blocks) rather than the adaptive runs
//! §4.2 describes for file data; that is what makes the
//! `n -> (extent_index, block_in_extent, entry_in_block)` addressing
//! formula in spec.md §4.7 well-defined, and the same formula doubles as
//! the restart cursor for `iterate` (an absolute entry position decodes
//! back into that exact triple).

use lolfs_driver::{BlockStore, BLOCK_SIZE};
use zerocopy::{AsBytes, FromBytes};

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm};
use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::extent::ExtentIndexBlockRaw;
use crate::layout::{DIRENT_NAME_MAX, DIRENT_SIZE, FILES_PER_BLOCK};

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct DirEntryRaw {
    pub ino: u32,
    pub name: [u8; DIRENT_SIZE - 4],
}

const _: () = assert!(std::mem::size_of::<DirEntryRaw>() == DIRENT_SIZE);

impl Default for DirEntryRaw {
    fn default() -> Self {
        DirEntryRaw {
            ino: 0,
            name: [0; DIRENT_SIZE - 4],
        }
    }
}

impl DirEntryRaw {
    fn name_str(&self) -> Result<String> {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8(self.name[..nul].to_vec())
            .map_err(|e| Error::invalid_image(format!("directory entry name is not UTF-8: {}", e)))
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        if name.len() > DIRENT_NAME_MAX {
            return Err(Error::too_big(format!(
                "name {} bytes exceeds the {} byte limit",
                name.len(),
                DIRENT_NAME_MAX
            )));
        }
        self.name = [0; DIRENT_SIZE - 4];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub ino: u32,
    pub name: String,
}

fn position_to_triple(n: u64, blocks_per_extent: u64) -> (usize, usize, usize) {
    let files_per_ext = blocks_per_extent * FILES_PER_BLOCK as u64;
    let extent_index = n / files_per_ext;
    let block_in_extent = (n % files_per_ext) / FILES_PER_BLOCK as u64;
    let entry_in_block = n % FILES_PER_BLOCK as u64;
    (extent_index as usize, block_in_extent as usize, entry_in_block as usize)
}

fn read_entry(
    store: &mut dyn BlockStore,
    index: &ExtentIndexBlockRaw,
    n: u64,
    blocks_per_extent: u64,
) -> Result<DirEntryRaw> {
    let (ext_i, block_in_ext, entry_i) = position_to_triple(n, blocks_per_extent);
    let extent = index
        .extents
        .get(ext_i)
        .filter(|e| e.is_used())
        .ok_or_else(|| Error::not_found(format!("directory position {} is unallocated", n)))?;
    let phys = extent.ee_start as usize + block_in_ext;
    let mut buf = [0u8; BLOCK_SIZE];
    store.read_block(phys, &mut buf).map_err(Error::IoError)?;
    let off = entry_i * DIRENT_SIZE;
    DirEntryRaw::read_from(&buf[off..off + DIRENT_SIZE])
        .ok_or_else(|| Error::invalid_image("corrupt directory entry".to_string()))
}

fn write_entry(
    store: &mut dyn BlockStore,
    index: &ExtentIndexBlockRaw,
    n: u64,
    blocks_per_extent: u64,
    entry: &DirEntryRaw,
) -> Result<()> {
    let (ext_i, block_in_ext, entry_i) = position_to_triple(n, blocks_per_extent);
    let extent = index
        .extents
        .get(ext_i)
        .filter(|e| e.is_used())
        .ok_or_else(|| Error::not_found(format!("directory position {} is unallocated", n)))?;
    let phys = extent.ee_start as usize + block_in_ext;
    let mut buf = [0u8; BLOCK_SIZE];
    store.read_block(phys, &mut buf).map_err(Error::IoError)?;
    let off = entry_i * DIRENT_SIZE;
    buf[off..off + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
    store.write_block(phys, &buf).map_err(Error::IoError)
}

/// Scans used extents in order, stopping at the first inode-0 entry
/// within a block or when `nr_files` entries have been seen.
pub fn lookup(
    store: &mut dyn BlockStore,
    index: &ExtentIndexBlockRaw,
    nr_files: u64,
    blocks_per_extent: u64,
    name: &str,
) -> Result<Option<u32>> {
    for n in 0..nr_files {
        let entry = read_entry(store, index, n, blocks_per_extent)?;
        if entry.ino == 0 {
            break;
        }
        if entry.name_str()? == name {
            return Ok(Some(entry.ino));
        }
    }
    Ok(None)
}

/// Inserts `name -> ino` at the position `nr_files` names, allocating a
/// new fixed-length extent first if that position's extent doesn't
/// exist yet.
pub fn insert(
    store: &mut dyn BlockStore,
    index: &mut ExtentIndexBlockRaw,
    nr_files: &mut u64,
    blocks_per_extent: u64,
    max_extents: usize,
    block_bitmap: &mut Bitmap,
    default_comp: CompressionAlgorithm,
    default_enc: EncryptionAlgorithm,
    name: &str,
    ino: u32,
) -> Result<()> {
    if name.len() > DIRENT_NAME_MAX {
        return Err(Error::too_big(format!(
            "name {} bytes exceeds the {} byte limit",
            name.len(),
            DIRENT_NAME_MAX
        )));
    }
    let n = *nr_files;
    let (ext_i, _, _) = position_to_triple(n, blocks_per_extent);
    if ext_i >= max_extents {
        return Err(Error::no_space(
            "directory has reached its maximum entry count".to_string(),
        ));
    }
    if !index.extents[ext_i].is_used() {
        let first = block_bitmap
            .alloc_run_hinted(blocks_per_extent)
            .ok_or_else(|| Error::no_space("no free run for a directory extent".to_string()))?;
        let mut e = crate::extent::ExtentRaw {
            ee_block: ext_i as u32 * blocks_per_extent as u32,
            ee_len: blocks_per_extent as u32,
            ee_start: first as u32,
            comp_algo: default_comp.as_u32() as u8,
            enc_algo: default_enc.as_u32() as u8,
            ..crate::extent::ExtentRaw::default()
        };
        e.set_flags_from_algos()?;
        index.extents[ext_i] = e;
    }

    let mut entry = DirEntryRaw { ino, ..DirEntryRaw::default() };
    entry.set_name(name)?;
    write_entry(store, index, n, blocks_per_extent, &entry)?;
    *nr_files += 1;
    index.header.nr_files = *nr_files as u32;
    Ok(())
}

/// Looks up `name`, then compacts: every entry after it shifts down by
/// one position, and `nr_files` decreases by one (spec.md §9's chosen
/// resolution of the `remove` Open Question).
pub fn remove(
    store: &mut dyn BlockStore,
    index: &mut ExtentIndexBlockRaw,
    nr_files: &mut u64,
    blocks_per_extent: u64,
    name: &str,
) -> Result<u32> {
    let mut found: Option<u64> = None;
    for n in 0..*nr_files {
        let entry = read_entry(store, index, n, blocks_per_extent)?;
        if entry.ino == 0 {
            break;
        }
        if entry.name_str()? == name {
            found = Some(n);
            break;
        }
    }
    let removed_at = found.ok_or_else(|| Error::not_found(format!("no such entry: {}", name)))?;
    let removed_ino = read_entry(store, index, removed_at, blocks_per_extent)?.ino;

    for n in removed_at..(*nr_files - 1) {
        let next = read_entry(store, index, n + 1, blocks_per_extent)?;
        write_entry(store, index, n, blocks_per_extent, &next)?;
    }
    write_entry(
        store,
        index,
        *nr_files - 1,
        blocks_per_extent,
        &DirEntryRaw::default(),
    )?;
    *nr_files -= 1;
    index.header.nr_files = *nr_files as u32;
    Ok(removed_ino)
}

/// Synthetic `.`/`..` first, then real entries in on-disk order,
/// starting at `cursor`. Returns the entries and the cursor to resume
/// from.
pub fn iterate(
    store: &mut dyn BlockStore,
    index: &ExtentIndexBlockRaw,
    nr_files: u64,
    blocks_per_extent: u64,
    self_ino: u32,
    parent_ino: u32,
    cursor: u64,
    max_entries: usize,
) -> Result<(Vec<DirListEntry>, u64)> {
    let mut out = Vec::new();
    let mut pos = cursor;
    let total = nr_files + 2;

    while pos < total && out.len() < max_entries {
        if pos == 0 {
            out.push(DirListEntry {
                ino: self_ino,
                name: ".".to_string(),
            });
        } else if pos == 1 {
            out.push(DirListEntry {
                ino: parent_ino,
                name: "..".to_string(),
            });
        } else {
            let n = pos - 2;
            let entry = read_entry(store, index, n, blocks_per_extent)?;
            if entry.ino != 0 {
                out.push(DirListEntry {
                    ino: entry.ino,
                    name: entry.name_str()?,
                });
            }
        }
        pos += 1;
    }
    Ok((out, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lolfs_driver::MemoryBlockStore;

    fn setup() -> (MemoryBlockStore, ExtentIndexBlockRaw, Bitmap) {
        let mut store = MemoryBlockStore::new(40);
        let index = ExtentIndexBlockRaw::default();
        let mut bm_store = MemoryBlockStore::new(1);
        let buf = [0xFFu8; BLOCK_SIZE];
        bm_store.write_block(0, &buf).unwrap();
        let bitmap = Bitmap::load(&mut bm_store, 0, 1, 40).unwrap();
        (store, index, bitmap)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let (mut store, mut index, mut bm) = setup();
        let mut nr_files = 0u64;
        insert(
            &mut store,
            &mut index,
            &mut nr_files,
            4,
            170,
            &mut bm,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            "hello.txt",
            7,
        )
        .unwrap();
        assert_eq!(nr_files, 1);
        let found = lookup(&mut store, &index, nr_files, 4, "hello.txt").unwrap();
        assert_eq!(found, Some(7));
        assert_eq!(lookup(&mut store, &index, nr_files, 4, "missing").unwrap(), None);
    }

    #[test]
    fn remove_compacts_trailing_entries() {
        let (mut store, mut index, mut bm) = setup();
        let mut nr_files = 0u64;
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            insert(
                &mut store,
                &mut index,
                &mut nr_files,
                4,
                170,
                &mut bm,
                CompressionAlgorithm::None,
                EncryptionAlgorithm::None,
                name,
                (i + 1) as u32,
            )
            .unwrap();
        }
        let removed = remove(&mut store, &mut index, &mut nr_files, 4, "a").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(nr_files, 2);
        assert_eq!(lookup(&mut store, &index, nr_files, 4, "a").unwrap(), None);
        assert_eq!(lookup(&mut store, &index, nr_files, 4, "b").unwrap(), Some(2));
        assert_eq!(lookup(&mut store, &index, nr_files, 4, "c").unwrap(), Some(3));
    }

    #[test]
    fn iterate_yields_dot_and_dotdot_first() {
        let (mut store, mut index, mut bm) = setup();
        let mut nr_files = 0u64;
        insert(
            &mut store,
            &mut index,
            &mut nr_files,
            4,
            170,
            &mut bm,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            "child",
            9,
        )
        .unwrap();
        let (entries, next_cursor) =
            iterate(&mut store, &index, nr_files, 4, 2, 1, 0, 100).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[2].name, "child");
        assert_eq!(next_cursor, 3);
    }

    #[test]
    fn iterate_is_restartable_from_any_cursor() {
        let (mut store, mut index, mut bm) = setup();
        let mut nr_files = 0u64;
        for name in ["one", "two", "three"] {
            insert(
                &mut store,
                &mut index,
                &mut nr_files,
                4,
                170,
                &mut bm,
                CompressionAlgorithm::None,
                EncryptionAlgorithm::None,
                name,
                1,
            )
            .unwrap();
        }
        let (first, cursor) = iterate(&mut store, &index, nr_files, 4, 2, 1, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let (rest, _) = iterate(&mut store, &index, nr_files, 4, 2, 1, cursor, 100).unwrap();
        let names: Vec<_> = rest.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn insert_rejects_name_over_255_bytes_without_mutating() {
        let (mut store, mut index, mut bm) = setup();
        let mut nr_files = 0u64;
        let long_name = "a".repeat(300);
        let err = insert(
            &mut store,
            &mut index,
            &mut nr_files,
            4,
            170,
            &mut bm,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
            &long_name,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::TooBig(_)));
        assert_eq!(nr_files, 0);
    }
}
