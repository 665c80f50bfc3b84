//! Command-line frontend for lolfs images (spec.md §6's "CLI or
//! kernel" adapter). Thin: every subcommand is a handful of calls into
//! `lolfs_core::Filesystem`'s operational surface, grounded in the
//! teacher's `src/main.rs` argument layout but without its daemon/fork
//! machinery, which lolfs has no use for.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use lolfs_core::{
    CompressionAlgorithm, CompressionOptions, EncryptionAlgorithm, EncryptionOptions,
    FormatOptions, SetFlags, XattrNamespace,
};
use lolfs_driver::{BlockStore, FileBlockStore, BLOCK_SIZE};

mod elf;
#[cfg(feature = "fuse")]
mod fuse_adapter;

#[derive(Parser)]
#[command(name = "lolfs", about = "lolfs disk image tool")]
struct Cli {
    #[arg(short, long, help = "Print more debug information, or set RUST_LOG")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new lolfs image.
    Mkfs {
        image: PathBuf,
        #[arg(long, default_value_t = 64)]
        size_mb: u64,
        #[arg(long, default_value = "none")]
        compression: String,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value_t = 100_000)]
        kdf_iterations: u32,
    },
    /// Validate an image's structural invariants.
    Check { image: PathBuf },
    /// List a directory's entries.
    Ls { image: PathBuf, path: String },
    /// Create a directory.
    Mkdir { image: PathBuf, path: String },
    /// Print a file's contents to stdout.
    Cat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Write a local file's contents into the image.
    Put {
        image: PathBuf,
        path: String,
        local_file: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Remove a file or symlink entry.
    Rm { image: PathBuf, path: String },
    /// Remove an empty directory.
    Rmdir { image: PathBuf, path: String },
    /// Create a hard link.
    Ln {
        image: PathBuf,
        target: String,
        link_name: String,
    },
    /// Create a symlink.
    Symlink {
        image: PathBuf,
        target: String,
        link_name: String,
    },
    /// Move/rename an entry.
    Mv {
        image: PathBuf,
        from: String,
        to: String,
    },
    /// List an entry's extended attributes.
    ListXattr { image: PathBuf, path: String },
    /// Read one extended attribute.
    GetXattr { image: PathBuf, path: String, name: String },
    /// Set one extended attribute.
    SetXattr {
        image: PathBuf,
        path: String,
        name: String,
        value: String,
    },
    /// Remove one extended attribute.
    RemoveXattr { image: PathBuf, path: String, name: String },
    /// Mount the image over FUSE (requires the `fuse` feature).
    #[cfg(feature = "fuse")]
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
}

fn init_logs(verbose: bool) {
    if verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    let _ = env_logger::Builder::from_default_env().try_init();
}

fn parse_compression(s: &str) -> Result<CompressionAlgorithm> {
    match s {
        "none" => Ok(CompressionAlgorithm::None),
        "lz4" => Ok(CompressionAlgorithm::Lz4),
        "zlib" => Ok(CompressionAlgorithm::Zlib),
        "zstd" => Ok(CompressionAlgorithm::Zstd),
        other => bail!("unknown compression algorithm: {}", other),
    }
}

/// Opens a possibly ELF-embedded image file as a block store. Detects
/// the `.lolfs.super` section via `elf::find_section`; falls back to a
/// raw image starting at byte 0 when the file isn't (or doesn't
/// contain) an ELF object.
fn open_store(path: &Path) -> Result<FileBlockStore> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let base = elf::find_section(&bytes);
    let usable = (bytes.len() as u64).saturating_sub(base);
    let block_count = (usable / BLOCK_SIZE as u64) as usize;
    FileBlockStore::open(path, base, block_count)
        .with_context(|| format!("opening {}", path.display()))
}

fn open_fs(path: &Path, password: Option<&str>) -> Result<lolfs_core::Filesystem<FileBlockStore>> {
    let store = open_store(path)?;
    let mut fs = lolfs_core::Filesystem::open(store).map_err(|e| anyhow!(e))?;
    if let Some(password) = password {
        fs.unlock(password).map_err(|e| anyhow!(e))?;
    }
    Ok(fs)
}

fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

fn resolve<S: BlockStore>(fs: &mut lolfs_core::Filesystem<S>, path: &str) -> Result<u32> {
    let mut ino = fs.root_ino();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        ino = fs.lookup(ino, part).map_err(|e| anyhow!("{}: {}", path, e))?;
    }
    Ok(ino)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logs(cli.verbose);

    match cli.command {
        Command::Mkfs {
            image,
            size_mb,
            compression,
            encrypt,
            password,
            kdf_iterations,
        } => {
            let total_blocks = (size_mb * 1024 * 1024) / BLOCK_SIZE as u64;
            let store = FileBlockStore::create(&image, total_blocks as usize)
                .with_context(|| format!("creating {}", image.display()))?;
            let options = FormatOptions {
                compression: CompressionOptions {
                    algorithm: parse_compression(&compression)?,
                    ..CompressionOptions::default()
                },
                encryption: if encrypt {
                    Some(EncryptionOptions {
                        algorithm: EncryptionAlgorithm::Aes256Xts,
                        kdf_iterations,
                        password,
                    })
                } else {
                    None
                },
            };
            let fs = lolfs_core::Filesystem::format(store, total_blocks, options)
                .map_err(|e| anyhow!(e))?;
            info!("{}", fs.summary());
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Check { image } => {
            let mut store = open_store(&image)?;
            let report = lolfs_core::fsck::check(&mut store).map_err(|e| anyhow!(e))?;
            for w in &report.warnings {
                println!("warning: {}", w);
            }
            for e in &report.errors {
                println!("error: {}", e);
            }
            if !report.errors.is_empty() {
                bail!("{} structural error(s) found", report.errors.len());
            }
            println!("clean");
        }

        Command::Ls { image, path } => {
            let mut fs = open_fs(&image, None)?;
            let dir_ino = resolve(&mut fs, &path)?;
            let mut cursor = 0u64;
            loop {
                let (entries, next) = fs.list_dir(dir_ino, cursor, 256).map_err(|e| anyhow!(e))?;
                if entries.is_empty() {
                    break;
                }
                for e in &entries {
                    println!("{}\t{}", e.ino, e.name);
                }
                if next == cursor {
                    break;
                }
                cursor = next;
            }
        }

        Command::Mkdir { image, path } => {
            let mut fs = open_fs(&image, None)?;
            let (parent, name) = split_parent(&path);
            let parent_ino = resolve(&mut fs, &parent)?;
            fs.create_dir(parent_ino, &name, 0o755).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Cat { image, path, password } => {
            let mut fs = open_fs(&image, password.as_deref())?;
            let ino = resolve(&mut fs, &path)?;
            let size = fs.metadata(ino).map_err(|e| anyhow!(e))?.size;
            let data = fs.read(ino, 0, size).map_err(|e| anyhow!(e))?;
            std::io::stdout().write_all(&data)?;
        }

        Command::Put { image, path, local_file, password } => {
            let contents = std::fs::read(&local_file)
                .with_context(|| format!("reading {}", local_file.display()))?;
            let mut fs = open_fs(&image, password.as_deref())?;
            let ino = match resolve(&mut fs, &path) {
                Ok(ino) => ino,
                Err(_) => {
                    let (parent, name) = split_parent(&path);
                    let parent_ino = resolve(&mut fs, &parent)?;
                    fs.create_file(parent_ino, &name, 0o644).map_err(|e| anyhow!(e))?
                }
            };
            fs.write(ino, 0, &contents).map_err(|e| anyhow!(e))?;
            fs.truncate(ino, contents.len() as u64).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Rm { image, path } => {
            let mut fs = open_fs(&image, None)?;
            let (parent, name) = split_parent(&path);
            let parent_ino = resolve(&mut fs, &parent)?;
            fs.unlink(parent_ino, &name).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Rmdir { image, path } => {
            let mut fs = open_fs(&image, None)?;
            let (parent, name) = split_parent(&path);
            let parent_ino = resolve(&mut fs, &parent)?;
            fs.rmdir(parent_ino, &name).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Ln { image, target, link_name } => {
            let mut fs = open_fs(&image, None)?;
            let target_ino = resolve(&mut fs, &target)?;
            let (parent, name) = split_parent(&link_name);
            let parent_ino = resolve(&mut fs, &parent)?;
            fs.link(target_ino, parent_ino, &name).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Symlink { image, target, link_name } => {
            let mut fs = open_fs(&image, None)?;
            let (parent, name) = split_parent(&link_name);
            let parent_ino = resolve(&mut fs, &parent)?;
            fs.create_symlink(parent_ino, &name, &target).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::Mv { image, from, to } => {
            let mut fs = open_fs(&image, None)?;
            let (old_parent, old_name) = split_parent(&from);
            let (new_parent, new_name) = split_parent(&to);
            let old_parent_ino = resolve(&mut fs, &old_parent)?;
            let new_parent_ino = resolve(&mut fs, &new_parent)?;
            fs.rename(old_parent_ino, &old_name, new_parent_ino, &new_name)
                .map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::ListXattr { image, path } => {
            let mut fs = open_fs(&image, None)?;
            let ino = resolve(&mut fs, &path)?;
            for entry in fs.list_xattr(ino).map_err(|e| anyhow!(e))? {
                println!("{:?}:{}", entry.namespace, entry.name);
            }
        }

        Command::GetXattr { image, path, name } => {
            let mut fs = open_fs(&image, None)?;
            let ino = resolve(&mut fs, &path)?;
            let value = fs.get_xattr(ino, &name).map_err(|e| anyhow!(e))?;
            std::io::stdout().write_all(&value)?;
        }

        Command::SetXattr { image, path, name, value } => {
            let mut fs = open_fs(&image, None)?;
            let ino = resolve(&mut fs, &path)?;
            fs.set_xattr(ino, XattrNamespace::User, &name, value.as_bytes(), SetFlags::Any)
                .map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        Command::RemoveXattr { image, path, name } => {
            let mut fs = open_fs(&image, None)?;
            let ino = resolve(&mut fs, &path)?;
            fs.remove_xattr(ino, &name).map_err(|e| anyhow!(e))?;
            fs.close().map_err(|e| anyhow!(e))?;
        }

        #[cfg(feature = "fuse")]
        Command::Mount { image, mountpoint, password } => {
            let fs = open_fs(&image, password.as_deref())?;
            fuse_adapter::mount(fs, &mountpoint)?;
        }
    }
    Ok(())
}
