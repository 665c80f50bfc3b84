//! lolfs: a fixed-layout disk filesystem engine with bitmap/extent
//! allocation, a compress-then-encrypt codec pipeline, and a
//! password-gated master-key unlock protocol.

pub mod algorithms;
pub mod bitmap;
pub mod codec;
pub mod directory;
pub mod error;
pub mod extent;
pub mod file_io;
pub mod fsck;
pub mod handle;
pub mod inode;
pub mod keymanager;
pub mod layout;
pub mod superblock;
pub mod xattr;

pub use algorithms::{CompressionAlgorithm, EncryptionAlgorithm, KdfAlgorithm};
pub use directory::DirListEntry;
pub use error::{Error, Result};
pub use handle::{EncryptionStatus, Filesystem, Metadata};
pub use inode::FileType;
pub use superblock::{CompressionOptions, EncryptionOptions, FormatOptions};
pub use xattr::{SetFlags, XattrEntry, XattrNamespace};
