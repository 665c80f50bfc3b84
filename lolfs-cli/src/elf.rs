//! ELF-container embedding (spec.md §6): turns a host binary's bytes into
//! the `base_offset` the engine's `find_section` contract expects.
//!
//! spec.md excludes "ELF section discovery" from the core and only
//! consumes its result, so this frontend owns the actual parsing. The
//! `.lolfs.super` section is ELF-specific enough that hand parsing it
//! would mean reimplementing a chunk of the ELF format; the `object`
//! crate already does this safely.

use object::{Object, ObjectSection};

pub const SECTION_NAME: &str = ".lolfs.super";

/// Returns the file offset of `.lolfs.super` if `container_bytes` parses
/// as an object file containing that section, `0` otherwise (a raw,
/// unembedded image starts at offset zero).
pub fn find_section(container_bytes: &[u8]) -> u64 {
    let file = match object::File::parse(container_bytes) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    match file.section_by_name(SECTION_NAME) {
        Some(section) => section.file_range().map(|(offset, _)| offset).unwrap_or(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_elf_input_returns_zero_base() {
        assert_eq!(find_section(b"not an object file"), 0);
    }

    #[test]
    fn empty_input_returns_zero_base() {
        assert_eq!(find_section(&[]), 0);
    }
}
