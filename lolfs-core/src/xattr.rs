//! Per-inode namespaced extended attributes (spec.md §4.9).
//!
//! Reuses the extent index block pattern (spec.md §9: "arena+index is
//! the natural shape") but, unlike the fixed-width directory entries,
//! packs variable-width records into one contiguous byte stream spread
//! across the extent's blocks; growth reuses
//! `ExtentIndexBlockRaw::allocate_for` exactly as file I/O does, simply
//! addressing "the next logical block of the attribute stream" instead
//! of a byte offset into file contents.

use lolfs_driver::{BlockStore, BLOCK_SIZE};

use crate::algorithms::{CompressionAlgorithm, EncryptionAlgorithm};
use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::extent::ExtentIndexBlockRaw;
use crate::layout::{XATTR_NAME_MAX, XATTR_VALUE_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrNamespace {
    User,
    Trusted,
    System,
    Security,
}

impl XattrNamespace {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(XattrNamespace::User),
            1 => Ok(XattrNamespace::Trusted),
            2 => Ok(XattrNamespace::System),
            3 => Ok(XattrNamespace::Security),
            other => Err(Error::invalid_image(format!(
                "unknown xattr namespace tag {}",
                other
            ))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            XattrNamespace::User => 0,
            XattrNamespace::Trusted => 1,
            XattrNamespace::System => 2,
            XattrNamespace::Security => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct XattrEntry {
    pub namespace: XattrNamespace,
    pub name: String,
    pub value: Vec<u8>,
}

/// `create`-only vs `replace`-only semantics for `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFlags {
    Any,
    CreateOnly,
    ReplaceOnly,
}

fn round_up_4(n: usize) -> usize {
    (n + 3) & !3
}

fn serialize(entries: &[XattrEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in entries {
        let name_bytes = e.name.as_bytes();
        let header_at = buf.len();
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.push(e.namespace.as_u8());
        buf.push(0); // pad
        buf.extend_from_slice(&(e.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // value_offset patched below
        buf.extend_from_slice(name_bytes);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        let value_offset = (buf.len() - header_at) as u32;
        buf[header_at + 8..header_at + 12].copy_from_slice(&value_offset.to_le_bytes());
        buf.extend_from_slice(&e.value);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }
    buf
}

fn deserialize(buf: &[u8], entry_count: usize) -> Result<Vec<XattrEntry>> {
    let mut entries = Vec::with_capacity(entry_count);
    let mut pos = 0usize;
    for _ in 0..entry_count {
        if pos + 12 > buf.len() {
            return Err(Error::invalid_image("truncated xattr entry header".to_string()));
        }
        let name_len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        let namespace = XattrNamespace::from_u8(buf[pos + 2])?;
        let value_len = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let value_offset = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
        let name_start = pos + 12;
        let name =
            String::from_utf8(buf[name_start..name_start + name_len].to_vec()).map_err(|e| {
                Error::invalid_image(format!("xattr name is not valid UTF-8: {}", e))
            })?;
        let value_start = pos + value_offset;
        let value = buf[value_start..value_start + value_len].to_vec();
        let entry_len = round_up_4(value_offset + value_len);
        entries.push(XattrEntry {
            namespace,
            name,
            value,
        });
        pos += entry_len;
    }
    Ok(entries)
}

fn capacity_blocks(index: &ExtentIndexBlockRaw) -> u32 {
    index.extents[..index.used_count()]
        .iter()
        .map(|e| e.ee_len)
        .sum()
}

fn read_stream(store: &mut dyn BlockStore, index: &ExtentIndexBlockRaw) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for e in index.extents[..index.used_count()].iter() {
        for i in 0..e.ee_len {
            let mut block = [0u8; BLOCK_SIZE];
            store
                .read_block((e.ee_start + i) as usize, &mut block)
                .map_err(Error::IoError)?;
            buf.extend_from_slice(&block);
        }
    }
    Ok(buf)
}

fn write_stream(store: &mut dyn BlockStore, index: &ExtentIndexBlockRaw, data: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    for e in index.extents[..index.used_count()].iter() {
        for i in 0..e.ee_len {
            let mut block = [0u8; BLOCK_SIZE];
            let end = (offset + BLOCK_SIZE).min(data.len());
            if offset < data.len() {
                block[..end - offset].copy_from_slice(&data[offset..end]);
            }
            store
                .write_block((e.ee_start + i) as usize, &block)
                .map_err(Error::IoError)?;
            offset += BLOCK_SIZE;
        }
    }
    Ok(())
}

/// Grows the xattr extent index, one block at a time, until its
/// capacity is at least `needed_bytes`.
fn ensure_capacity(
    index: &mut ExtentIndexBlockRaw,
    needed_bytes: usize,
    block_bitmap: &mut Bitmap,
    max_extent_blocks: u32,
) -> Result<()> {
    while (capacity_blocks(index) as usize) * BLOCK_SIZE < needed_bytes {
        let logical = capacity_blocks(index);
        index.allocate_for(
            logical,
            block_bitmap,
            max_extent_blocks,
            CompressionAlgorithm::None,
            EncryptionAlgorithm::None,
        )?;
    }
    Ok(())
}

pub fn list(store: &mut dyn BlockStore, index: &ExtentIndexBlockRaw) -> Result<Vec<XattrEntry>> {
    let entry_count = index.header.nr_files as usize;
    let stream = read_stream(store, index)?;
    deserialize(&stream, entry_count)
}

pub fn get(store: &mut dyn BlockStore, index: &ExtentIndexBlockRaw, name: &str) -> Result<Vec<u8>> {
    list(store, index)?
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.value)
        .ok_or_else(|| Error::not_found(format!("no such xattr: {}", name)))
}

pub fn set(
    store: &mut dyn BlockStore,
    index: &mut ExtentIndexBlockRaw,
    block_bitmap: &mut Bitmap,
    max_extent_blocks: u32,
    namespace: XattrNamespace,
    name: &str,
    value: &[u8],
    flags: SetFlags,
) -> Result<()> {
    if name.len() > XATTR_NAME_MAX {
        return Err(Error::too_big(format!(
            "xattr name {} bytes exceeds {} byte limit",
            name.len(),
            XATTR_NAME_MAX
        )));
    }
    if value.len() > XATTR_VALUE_MAX {
        return Err(Error::too_big(format!(
            "xattr value {} bytes exceeds {} byte limit",
            value.len(),
            XATTR_VALUE_MAX
        )));
    }

    let mut entries = list(store, index)?;
    let existing = entries.iter().position(|e| e.name == name);
    match (existing, flags) {
        (Some(_), SetFlags::CreateOnly) => {
            return Err(Error::exists(format!("xattr {} already exists", name)))
        }
        (None, SetFlags::ReplaceOnly) => {
            return Err(Error::not_found(format!("no such xattr: {}", name)))
        }
        (Some(i), _) => {
            entries[i] = XattrEntry {
                namespace,
                name: name.to_string(),
                value: value.to_vec(),
            };
        }
        (None, _) => entries.push(XattrEntry {
            namespace,
            name: name.to_string(),
            value: value.to_vec(),
        }),
    }

    let serialized = serialize(&entries);
    ensure_capacity(index, serialized.len(), block_bitmap, max_extent_blocks)?;
    write_stream(store, index, &serialized)?;
    index.header.nr_files = entries.len() as u32;
    Ok(())
}

pub fn remove(
    store: &mut dyn BlockStore,
    index: &mut ExtentIndexBlockRaw,
    name: &str,
) -> Result<()> {
    let mut entries = list(store, index)?;
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(Error::not_found(format!("no such xattr: {}", name)));
    }
    let serialized = serialize(&entries);
    write_stream(store, index, &serialized)?;
    index.header.nr_files = entries.len() as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lolfs_driver::MemoryBlockStore;

    fn setup() -> (MemoryBlockStore, ExtentIndexBlockRaw, Bitmap) {
        let store = MemoryBlockStore::new(40);
        let index = ExtentIndexBlockRaw::default();
        let mut bm_store = MemoryBlockStore::new(1);
        let buf = [0xFFu8; BLOCK_SIZE];
        bm_store.write_block(0, &buf).unwrap();
        let bitmap = Bitmap::load(&mut bm_store, 0, 1, 40).unwrap();
        (store, index, bitmap)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (mut store, mut index, mut bm) = setup();
        set(
            &mut store,
            &mut index,
            &mut bm,
            32,
            XattrNamespace::User,
            "user.comment",
            b"hello",
            SetFlags::Any,
        )
        .unwrap();
        assert_eq!(get(&mut store, &index, "user.comment").unwrap(), b"hello");
    }

    #[test]
    fn create_only_rejects_existing_name() {
        let (mut store, mut index, mut bm) = setup();
        set(
            &mut store,
            &mut index,
            &mut bm,
            32,
            XattrNamespace::User,
            "a",
            b"1",
            SetFlags::Any,
        )
        .unwrap();
        let err = set(
            &mut store,
            &mut index,
            &mut bm,
            32,
            XattrNamespace::User,
            "a",
            b"2",
            SetFlags::CreateOnly,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn remove_shifts_entries_to_fill_the_gap() {
        let (mut store, mut index, mut bm) = setup();
        for (name, value) in [("a", b"1" as &[u8]), ("b", b"2"), ("c", b"3")] {
            set(
                &mut store,
                &mut index,
                &mut bm,
                32,
                XattrNamespace::User,
                name,
                value,
                SetFlags::Any,
            )
            .unwrap();
        }
        remove(&mut store, &mut index, "b").unwrap();
        assert!(get(&mut store, &index, "b").is_err());
        assert_eq!(get(&mut store, &index, "a").unwrap(), b"1");
        assert_eq!(get(&mut store, &index, "c").unwrap(), b"3");
    }

    #[test]
    fn list_reports_every_entry() {
        let (mut store, mut index, mut bm) = setup();
        for name in ["a", "b"] {
            set(
                &mut store,
                &mut index,
                &mut bm,
                32,
                XattrNamespace::User,
                name,
                b"v",
                SetFlags::Any,
            )
            .unwrap();
        }
        let entries = list(&mut store, &index).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
