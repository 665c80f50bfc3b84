//! Property-style assertions for the structural invariants spec.md §8
//! calls out: write/read round-tripping for arbitrary payloads, name
//! length limits, and free-count bookkeeping staying internally
//! consistent across a sequence of mutations.

use proptest::collection::vec;
use proptest::prelude::*;

use lolfs_core::{Filesystem, FormatOptions};
use lolfs_driver::MemoryBlockStore;

const TOTAL_BLOCKS: u64 = 1024;

fn fresh() -> Filesystem<MemoryBlockStore> {
    let store = MemoryBlockStore::new(TOTAL_BLOCKS as usize);
    Filesystem::format(store, TOTAL_BLOCKS, FormatOptions::default()).unwrap()
}

proptest! {
    #[test]
    fn write_then_read_round_trips_for_arbitrary_payloads(
        data in vec(any::<u8>(), 0..8192),
        offset in 0u64..4096,
    ) {
        let mut fs = fresh();
        let root = fs.root_ino();
        let ino = fs.create_file(root, "f", 0o644).unwrap();
        fs.write(ino, offset, &data).unwrap();
        let out = fs.read(ino, offset, data.len() as u64).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn arbitrary_name_lengths_either_succeed_or_fail_cleanly(len in 0usize..400) {
        let mut fs = fresh();
        let root = fs.root_ino();
        let name: String = "a".repeat(len);
        let result = fs.create_file(root, &name, 0o644);
        if len > 255 {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn free_block_count_matches_the_walked_image_after_random_churn(
        ops in vec(0u8..4, 1..30),
    ) {
        let mut fs = fresh();
        let root = fs.root_ino();
        let mut created = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            match op {
                0 => {
                    let name = format!("file{}", i);
                    if let Ok(ino) = fs.create_file(root, &name, 0o644) {
                        let _ = fs.write(ino, 0, b"some bytes of payload data");
                        created.push((name, ino));
                    }
                }
                1 => {
                    if let Some((name, _)) = created.pop() {
                        let _ = fs.unlink(root, &name);
                    }
                }
                2 => {
                    let name = format!("dir{}", i);
                    let _ = fs.create_dir(root, &name, 0o755);
                }
                _ => {
                    let (entries, _) = fs.list_dir(root, 0, 1000).unwrap();
                    prop_assert!(entries.len() >= 2); // at least "." and ".."
                }
            }
        }
        let mut store = fs.close().unwrap();
        let report = lolfs_core::fsck::check(&mut store).unwrap();
        prop_assert!(report.errors.is_empty(), "fsck errors: {:?}", report.errors);
    }
}
