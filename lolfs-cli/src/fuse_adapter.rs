//! FUSE adapter (feature `fuse`): exposes a `lolfs_core::Filesystem`
//! through the kernel's FUSE interface.
//!
//! Grounded in the teacher's `rfs_lib::fuse` module, which implements
//! the same `fuser::Filesystem` trait over `rfs_lib::fs::Ext2FileSystem`.
//! FUSE reserves inode 1 for the mount root; lolfs inodes start at 0, so
//! every inode crossing the boundary is shifted by one, the same trick
//! the teacher's `RFS::shift_ino` performs.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem as FuserFilesystem, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyWrite, Request,
};
use libc::ENOENT;
use log::warn;

use lolfs_core::{Error, FileType as LolfsFileType, Metadata};
use lolfs_driver::BlockStore;

const TTL: Duration = Duration::from_secs(1);

fn to_kind(ft: LolfsFileType) -> FuseFileType {
    match ft {
        LolfsFileType::Regular => FuseFileType::RegularFile,
        LolfsFileType::Directory => FuseFileType::Directory,
        LolfsFileType::Symlink => FuseFileType::Symlink,
    }
}

fn to_attr(meta: &Metadata) -> FileAttr {
    let mtime = UNIX_EPOCH + Duration::from_secs(meta.mtime as u64);
    let atime = UNIX_EPOCH + Duration::from_secs(meta.atime as u64);
    let ctime = UNIX_EPOCH + Duration::from_secs(meta.ctime as u64);
    FileAttr {
        ino: (meta.ino as u64) + 1,
        size: meta.size,
        blocks: (meta.size + 4095) / 4096,
        atime,
        mtime,
        ctime,
        crtime: ctime,
        kind: to_kind(meta.file_type),
        perm: (meta.mode & 0o7777) as u16,
        nlink: meta.nlink,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Maps a core error to the `errno` FUSE expects back from a reply.
fn errno(err: &Error) -> i32 {
    match err {
        Error::NotFound(_) => libc::ENOENT,
        Error::Exists(_) => libc::EEXIST,
        Error::NoSpace(_) => libc::ENOSPC,
        Error::TooBig(_) => libc::EFBIG,
        Error::PermissionDenied(_) => libc::EACCES,
        Error::AuthFailure(_) => libc::EACCES,
        Error::InvalidImage(_) => libc::EIO,
        Error::IoError(_) => libc::EIO,
    }
}

pub struct LolFs<S: BlockStore> {
    fs: lolfs_core::Filesystem<S>,
}

impl<S: BlockStore> LolFs<S> {
    fn to_lolfs_ino(fuse_ino: u64) -> u32 {
        if fuse_ino == fuser::FUSE_ROOT_ID {
            0
        } else {
            (fuse_ino - 1) as u32
        }
    }

    fn to_fuse_ino(lolfs_ino: u32) -> u64 {
        lolfs_ino as u64 + 1
    }
}

impl<S: BlockStore> FuserFilesystem for LolFs<S> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent = Self::to_lolfs_ino(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        match self
            .fs
            .lookup(parent, name)
            .and_then(|ino| self.fs.metadata(ino))
        {
            Ok(meta) => reply.entry(&TTL, &to_attr(&meta), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ino = Self::to_lolfs_ino(ino);
        match self.fs.metadata(ino) {
            Ok(meta) => reply.attr(&TTL, &to_attr(&meta)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let ino = Self::to_lolfs_ino(ino);
        match self.fs.read_symlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        match self
            .fs
            .create_file(parent, name, mode)
            .and_then(|ino| self.fs.metadata(ino))
        {
            Ok(meta) => reply.entry(&TTL, &to_attr(&meta), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        match self
            .fs
            .create_dir(parent, name, mode)
            .and_then(|ino| self.fs.metadata(ino))
        {
            Ok(meta) => reply.entry(&TTL, &to_attr(&meta), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        match self.fs.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        match self.fs.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        let target = link.to_str().unwrap_or("");
        match self
            .fs
            .create_symlink(parent, name, target)
            .and_then(|ino| self.fs.metadata(ino))
        {
            Ok(meta) => reply.entry(&TTL, &to_attr(&meta), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let parent = Self::to_lolfs_ino(parent);
        let newparent = Self::to_lolfs_ino(newparent);
        let name = name.to_str().unwrap_or("");
        let newname = newname.to_str().unwrap_or("");
        match self.fs.rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ino = Self::to_lolfs_ino(ino);
        let newparent = Self::to_lolfs_ino(newparent);
        let newname = newname.to_str().unwrap_or("");
        match self
            .fs
            .link(ino, newparent, newname)
            .and_then(|()| self.fs.metadata(ino))
        {
            Ok(meta) => reply.entry(&TTL, &to_attr(&meta), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ino = Self::to_lolfs_ino(ino);
        match self.fs.read(ino, offset.max(0) as u64, size as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ino = Self::to_lolfs_ino(ino);
        match self.fs.write(ino, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if let Err(e) = self.fs.store_mut().flush() {
            warn!("flush failed: {}", e);
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dir_ino = Self::to_lolfs_ino(ino);
        match self.fs.list_dir(dir_ino, offset.max(0) as u64, 512) {
            Ok((entries, next_cursor)) => {
                for (i, entry) in entries.iter().enumerate() {
                    let meta = match self.fs.metadata(entry.ino) {
                        Ok(m) => m,
                        Err(_) => continue,
                    };
                    let next_offset = if i + 1 == entries.len() {
                        next_cursor as i64
                    } else {
                        offset + i as i64 + 1
                    };
                    let full = reply.add(
                        Self::to_fuse_ino(entry.ino),
                        next_offset,
                        to_kind(meta.file_type),
                        &entry.name,
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let ino = Self::to_lolfs_ino(ino);
        match self.fs.metadata(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let parent = Self::to_lolfs_ino(parent);
        let name = name.to_str().unwrap_or("");
        match self
            .fs
            .create_file(parent, name, mode)
            .and_then(|ino| self.fs.metadata(ino))
        {
            Ok(meta) => reply.created(&TTL, &to_attr(&meta), 0, 0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }
}

pub fn mount<S: BlockStore + Send + 'static>(
    fs: lolfs_core::Filesystem<S>,
    mountpoint: &Path,
) -> anyhow::Result<()> {
    let options = vec![MountOption::FSName("lolfs".to_string())];
    fuser::mount2(LolFs { fs }, mountpoint, &options)?;
    Ok(())
}
