//! FUSE dispatch layer
//!
//! Thin delegation from `fuser` callbacks to a [`MirrorBackend`]: an
//! inode/path table on top of a path-addressed backend, flag-to-mode
//! translation, and errno conversion. No cipher or buffering logic lives
//! here.

use crate::fs::backend::{AccessMode, FileInfo, FileKind, MirrorBackend, OpenMode, WritePos};
use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// TTL for cached attributes
const TTL: Duration = Duration::from_secs(1);

/// Inode of the mount root
const ROOT_INO: u64 = 1;

/// Bidirectional inode/path table. The backend is path-addressed; FUSE
/// speaks inodes, so every path the kernel learns about gets a stable id.
struct InodeTable {
    paths: DashMap<u64, PathBuf>,
    inos: DashMap<PathBuf, u64>,
    next: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let table = InodeTable {
            paths: DashMap::new(),
            inos: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        table.paths.insert(ROOT_INO, PathBuf::from("/"));
        table.inos.insert(PathBuf::from("/"), ROOT_INO);
        table
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).map(|p| p.clone())
    }

    fn assign(&self, path: &Path) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::SeqCst);
        self.inos.insert(path.to_path_buf(), ino);
        self.paths.insert(ino, path.to_path_buf());
        ino
    }

    fn forget_path(&self, path: &Path) {
        if let Some((_, ino)) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn rename(&self, from: &Path, to: &Path) {
        self.forget_path(to);
        if let Some((_, ino)) = self.inos.remove(from) {
            self.inos.insert(to.to_path_buf(), ino);
            self.paths.insert(ino, to.to_path_buf());
        }
    }
}

fn kind_to_fuser(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

/// Translate POSIX open flags into the backend's mode vocabulary
fn open_modes(flags: i32) -> (OpenMode, AccessMode) {
    let access = match flags & libc::O_ACCMODE {
        libc::O_WRONLY | libc::O_RDWR => AccessMode::ReadWrite,
        _ => AccessMode::Read,
    };
    let mode = if flags & libc::O_TRUNC != 0 {
        OpenMode::Truncate
    } else if flags & libc::O_APPEND != 0 {
        OpenMode::Append
    } else {
        OpenMode::Open
    };
    (mode, access)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// FUSE filesystem over any [`MirrorBackend`]
pub struct MirrorFs<B: MirrorBackend> {
    backend: B,
    inodes: InodeTable,
}

impl<B: MirrorBackend> MirrorFs<B> {
    pub fn new(backend: B) -> Self {
        MirrorFs {
            backend,
            inodes: InodeTable::new(),
        }
    }

    fn attr(&self, ino: u64, info: &FileInfo) -> FileAttr {
        FileAttr {
            ino,
            size: info.len,
            blocks: info.len.div_ceil(512),
            atime: info.accessed,
            mtime: info.modified,
            ctime: info.modified,
            crtime: info.created,
            kind: kind_to_fuser(info.kind),
            perm: info.perm,
            nlink: info.nlink,
            uid: info.uid,
            gid: info.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl<B: MirrorBackend> Filesystem for MirrorFs<B> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);

        match self.backend.get_info(&path) {
            Ok(info) => {
                let ino = self.inodes.assign(&path);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.backend.get_info(&path) {
            Ok(info) => reply.attr(&TTL, &self.attr(ino, &info)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("setattr: {:?} size={:?} mode={:?}", path, size, mode);

        if let Some(size) = size {
            let result = match fh {
                Some(fh) => self.backend.set_len(fh, size),
                // No open handle supplied; run the truncation through a
                // short-lived one.
                None => self
                    .backend
                    .open_file(&path, OpenMode::Open, AccessMode::ReadWrite)
                    .and_then(|opened| {
                        let result = self.backend.set_len(opened.handle, size);
                        let closed = self.backend.close(opened.handle);
                        result.and(closed)
                    }),
            };
            if let Err(e) = result {
                error!("setattr size error on {:?}: {}", path, e);
                reply.error(e.to_errno());
                return;
            }
        }

        if let Some(mode) = mode {
            if let Err(e) = self.backend.set_permissions(&path, mode & 0o7777) {
                reply.error(e.to_errno());
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let result = self.backend.set_times(
                fh,
                &path,
                atime.map(time_or_now),
                mtime.map(time_or_now),
            );
            if let Err(e) = result {
                reply.error(e.to_errno());
                return;
            }
        }

        match self.backend.get_info(&path) {
            Ok(info) => reply.attr(&TTL, &self.attr(ino, &info)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("readdir: {:?} offset={}", path, offset);

        let children = match self.backend.list_dir(&path) {
            Ok(children) => children,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .map(|p| self.inodes.assign(p))
            .unwrap_or(ROOT_INO);

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = self.inodes.assign(&path.join(&child.name));
            entries.push((child_ino, kind_to_fuser(child.info.kind), child.name));
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let (mode, access) = open_modes(flags);
        debug!("open: {:?} mode={:?} access={:?}", path, mode, access);

        match self.backend.open_file(&path, mode, access) {
            Ok(opened) => reply.opened(opened.handle, 0),
            Err(e) => {
                error!("open error on {:?}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);

        let open_mode = if flags & libc::O_EXCL != 0 {
            OpenMode::CreateNew
        } else {
            OpenMode::Create
        };
        debug!("create: {:?} mode={:o}", path, mode);

        let opened = match self.backend.open_file(&path, open_mode, AccessMode::ReadWrite) {
            Ok(opened) => opened,
            Err(e) => {
                error!("create error on {:?}: {}", path, e);
                reply.error(e.to_errno());
                return;
            }
        };

        if let Err(e) = self.backend.set_permissions(&path, mode & 0o7777) {
            debug!("create: chmod on {:?} failed: {}", path, e);
        }

        match self.backend.get_info(&path) {
            Ok(info) => {
                let ino = self.inodes.assign(&path);
                reply.created(&TTL, &self.attr(ino, &info), 0, opened.handle, 0);
            }
            Err(e) => {
                let _ = self.backend.close(opened.handle);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);
        debug!("mkdir: {:?} mode={:o}", path, mode);

        if let Err(e) = self.backend.create_dir(&path) {
            error!("mkdir error on {:?}: {}", path, e);
            reply.error(e.to_errno());
            return;
        }
        if let Err(e) = self.backend.set_permissions(&path, mode & 0o7777) {
            debug!("mkdir: chmod on {:?} failed: {}", path, e);
        }

        match self.backend.get_info(&path) {
            Ok(info) => {
                let ino = self.inodes.assign(&path);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);
        debug!("unlink: {:?}", path);

        match self.backend.delete_file(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => {
                error!("unlink error on {:?}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);
        debug!("rmdir: {:?}", path);

        match self.backend.delete_dir(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => {
                error!("rmdir error on {:?}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_parent), Some(new_parent)) =
            (self.inodes.path_of(parent), self.inodes.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = old_parent.join(name);
        let to = new_parent.join(newname);
        debug!("rename: {:?} -> {:?}", from, to);

        match self.backend.rename(&from, &to, true) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => {
                error!("rename error {:?} -> {:?}: {}", from, to, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let mut buf = vec![0u8; size as usize];
        match self.backend.read(fh, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                error!("read error on fh {}: {}", fh, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        // An offset of -1 means append, per the driver contract
        let pos = if offset < 0 {
            WritePos::Append
        } else {
            WritePos::Offset(offset as u64)
        };

        match self.backend.write(fh, pos, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                error!("write error on fh {}: {}", fh, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.backend.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush error on fh {}: {}", fh, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.backend.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: fh {}", fh);
        match self.backend.close(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("release error on fh {}: {}", fh, e);
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        let len = end.saturating_sub(start);
        let result = if typ == libc::F_UNLCK as i32 {
            self.backend.unlock_range(fh, start, len)
        } else {
            self.backend.lock_range(fh, start, len)
        };

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.backend.free_space() {
            Ok(space) => reply.statfs(
                space.blocks,
                space.bfree,
                space.bavail,
                space.files,
                space.ffree,
                space.block_size,
                space.name_max,
                space.fragment_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_table_assign_stable() {
        let table = InodeTable::new();

        let a = table.assign(Path::new("/a"));
        let b = table.assign(Path::new("/b"));
        assert_ne!(a, b);
        assert_eq!(table.assign(Path::new("/a")), a);
        assert_eq!(table.path_of(a), Some(PathBuf::from("/a")));
    }

    #[test]
    fn test_inode_table_root() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.assign(Path::new("/")), ROOT_INO);
    }

    #[test]
    fn test_inode_table_rename_keeps_ino() {
        let table = InodeTable::new();

        let ino = table.assign(Path::new("/old"));
        table.rename(Path::new("/old"), Path::new("/new"));

        assert_eq!(table.path_of(ino), Some(PathBuf::from("/new")));
        assert_eq!(table.assign(Path::new("/new")), ino);
    }

    #[test]
    fn test_inode_table_forget() {
        let table = InodeTable::new();

        let ino = table.assign(Path::new("/gone"));
        table.forget_path(Path::new("/gone"));

        assert_eq!(table.path_of(ino), None);
        assert_ne!(table.assign(Path::new("/gone")), ino);
    }

    #[test]
    fn test_open_flag_translation() {
        assert_eq!(open_modes(libc::O_RDONLY), (OpenMode::Open, AccessMode::Read));
        assert_eq!(
            open_modes(libc::O_RDWR),
            (OpenMode::Open, AccessMode::ReadWrite)
        );
        assert_eq!(
            open_modes(libc::O_WRONLY | libc::O_TRUNC),
            (OpenMode::Truncate, AccessMode::ReadWrite)
        );
        assert_eq!(
            open_modes(libc::O_WRONLY | libc::O_APPEND),
            (OpenMode::Append, AccessMode::ReadWrite)
        );
    }
}
