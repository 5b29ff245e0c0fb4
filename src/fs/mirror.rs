//! Encrypting mirror over a backing directory
//!
//! [`EncryptedMirror`] is the concrete [`MirrorBackend`]: it resolves
//! virtual paths under the backing root, applies the open/create policy,
//! owns the handle registry and the decrypted-content cache, and
//! translates storage failures into the driver status vocabulary.

use crate::cache::PlaintextCache;
use crate::crypto::Passphrase;
use crate::error::{Error, Result};
use crate::fs::backend::{
    AccessMode, DirEntry, FileInfo, FreeSpace, HandleId, MirrorBackend, OpenMode, OpenedFile,
    WritePos,
};
use crate::fs::file::EncryptedFile;
use crate::fs::handle::HandleManager;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fs;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

pub struct EncryptedMirror {
    root: PathBuf,
    password: Passphrase,
    cache: Arc<PlaintextCache>,
    handles: HandleManager,
}

impl EncryptedMirror {
    /// Create a mirror rooted at `root`. The cache is injected so its
    /// sweeper lifecycle is owned by whoever composes the filesystem.
    pub fn new<P: Into<PathBuf>>(
        root: P,
        password: Passphrase,
        cache: Arc<PlaintextCache>,
    ) -> Result<EncryptedMirror> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotADirectory(root.display().to_string()));
        }

        Ok(EncryptedMirror {
            root,
            password,
            cache,
            handles: HandleManager::new(),
        })
    }

    pub fn cache(&self) -> &Arc<PlaintextCache> {
        &self.cache
    }

    /// Number of currently open handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Map a virtual path under the backing root. Leading separators are
    /// stripped; parent components are refused rather than resolved.
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::AccessDenied(path.display().to_string()))
                }
                Component::Normal(part) => resolved.push(part),
            }
        }
        Ok(resolved)
    }

    fn handle(&self, id: HandleId) -> Result<Arc<Mutex<EncryptedFile>>> {
        self.handles.get(id).ok_or(Error::InvalidHandle(id))
    }

    /// A missing parent directory is a distinct failure from a missing
    /// file
    fn check_parent(&self, path: &Path, backing: &Path) -> Result<()> {
        if let Some(parent) = backing.parent() {
            if !parent.is_dir() {
                return Err(Error::PathNotFound(path.display().to_string()));
            }
        }
        Ok(())
    }
}

/// Flush failures on a full volume get their own status
fn flush_status(e: Error) -> Error {
    match e {
        Error::Io(io) if io.raw_os_error() == Some(libc::ENOSPC) => Error::DiskFull,
        other => other,
    }
}

impl MirrorBackend for EncryptedMirror {
    fn open_file(&self, path: &Path, mode: OpenMode, access: AccessMode) -> Result<OpenedFile> {
        let backing = self.resolve(path)?;
        debug!("open_file: {:?} mode={:?} access={:?}", path, mode, access);

        let meta = fs::metadata(&backing).ok();
        let exists = meta.is_some();
        if let Some(meta) = &meta {
            if meta.is_dir() {
                return Err(Error::NotAFile(path.display().to_string()));
            }
        }

        match mode {
            OpenMode::Open | OpenMode::Truncate if !exists => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            OpenMode::CreateNew if exists => {
                return Err(Error::AlreadyExists(path.display().to_string()));
            }
            _ => {}
        }
        if !exists {
            self.check_parent(path, &backing)?;
        }

        let file = EncryptedFile::open(
            &backing,
            exists,
            mode,
            access,
            self.password.clone(),
            &self.cache,
        )?;
        let handle = self.handles.insert(file);

        Ok(OpenedFile {
            handle,
            already_existed: exists && matches!(mode, OpenMode::Create | OpenMode::OpenOrCreate),
        })
    }

    fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle(handle)?;
        let mut file = handle.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn write(&self, handle: HandleId, pos: WritePos, data: &[u8]) -> Result<usize> {
        let handle = self.handle(handle)?;
        let mut file = handle.lock();
        match pos {
            WritePos::Offset(offset) => file.seek(SeekFrom::Start(offset))?,
            WritePos::Append => file.seek(SeekFrom::End(0))?,
        };
        file.write(data)
    }

    fn flush(&self, handle: HandleId) -> Result<()> {
        let handle = self.handle(handle)?;
        let mut file = handle.lock();
        file.flush().map_err(flush_status)
    }

    fn set_len(&self, handle: HandleId, len: u64) -> Result<()> {
        let handle = self.handle(handle)?;
        let mut file = handle.lock();
        file.set_len(len)
    }

    fn close(&self, handle: HandleId) -> Result<()> {
        // Releasing an unknown or already-released handle is a no-op
        let Some(slot) = self.handles.remove(handle) else {
            return Ok(());
        };
        let mut file = slot.lock();
        file.close().map_err(flush_status)
    }

    fn lock_range(&self, handle: HandleId, offset: u64, len: u64) -> Result<()> {
        let handle = self.handle(handle)?;
        let file = handle.lock();
        file.lock_range(offset, len)
    }

    fn unlock_range(&self, handle: HandleId, offset: u64, len: u64) -> Result<()> {
        let handle = self.handle(handle)?;
        let file = handle.lock();
        file.unlock_range(offset, len)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        let backing = self.resolve(path)?;
        debug!("create_dir: {:?}", path);

        self.check_parent(path, &backing)?;
        fs::create_dir(&backing).map_err(|e| Error::from_io(path, e))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        let backing = self.resolve(path)?;
        debug!("delete_file: {:?}", path);

        let meta =
            fs::symlink_metadata(&backing).map_err(|_| Error::NotFound(path.display().to_string()))?;
        if meta.is_dir() {
            return Err(Error::AccessDenied(path.display().to_string()));
        }

        fs::remove_file(&backing).map_err(|e| Error::from_io(path, e))?;
        self.cache.invalidate(&backing);
        Ok(())
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        let backing = self.resolve(path)?;
        debug!("delete_dir: {:?}", path);

        let meta =
            fs::symlink_metadata(&backing).map_err(|_| Error::NotFound(path.display().to_string()))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }
        let occupied = fs::read_dir(&backing)
            .map_err(|e| Error::from_io(path, e))?
            .next()
            .is_some();
        if occupied {
            return Err(Error::DirectoryNotEmpty(path.display().to_string()));
        }

        fs::remove_dir(&backing).map_err(|e| Error::from_io(path, e))
    }

    fn rename(&self, from: &Path, to: &Path, replace: bool) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        debug!("rename: {:?} -> {:?} replace={}", from, to, replace);

        if fs::symlink_metadata(&src).is_err() {
            return Err(Error::NotFound(from.display().to_string()));
        }
        if let Ok(meta) = fs::symlink_metadata(&dst) {
            if !replace {
                return Err(Error::AlreadyExists(to.display().to_string()));
            }
            if meta.is_dir() {
                return Err(Error::AccessDenied(to.display().to_string()));
            }
        }

        fs::rename(&src, &dst).map_err(|e| Error::from_io(from, e))?;
        self.cache.invalidate(&src);
        self.cache.invalidate(&dst);
        Ok(())
    }

    fn get_info(&self, path: &Path) -> Result<FileInfo> {
        let backing = self.resolve(path)?;
        let meta = fs::symlink_metadata(&backing).map_err(|e| Error::from_io(path, e))?;
        Ok(FileInfo::from_metadata(&meta))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let backing = self.resolve(path)?;
        let meta = fs::symlink_metadata(&backing).map_err(|e| Error::from_io(path, e))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&backing).map_err(|e| Error::from_io(path, e))? {
            let entry = entry.map_err(|e| Error::from_io(path, e))?;
            if let Ok(meta) = entry.metadata() {
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    info: FileInfo::from_metadata(&meta),
                });
            }
        }
        Ok(entries)
    }

    fn set_times(
        &self,
        handle: Option<HandleId>,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        // Prefer the open handle's backing descriptor when there is one
        if let Some(slot) = handle.and_then(|id| self.handles.get(id)) {
            let file = slot.lock();
            return file.set_times(accessed, modified);
        }

        let backing = self.resolve(path)?;

        let mut times = fs::FileTimes::new();
        if let Some(t) = accessed {
            times = times.set_accessed(t);
        }
        if let Some(t) = modified {
            times = times.set_modified(t);
        }
        let file = fs::File::open(&backing).map_err(|e| Error::from_io(path, e))?;
        file.set_times(times).map_err(|e| Error::from_io(path, e))
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let backing = self.resolve(path)?;
        fs::set_permissions(&backing, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::from_io(path, e))
    }

    fn free_space(&self) -> Result<FreeSpace> {
        use std::os::unix::ffi::OsStrExt;

        let cpath = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| Error::Internal("backing root contains a NUL byte".to_string()))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(FreeSpace {
            blocks: stat.f_blocks as u64,
            bfree: stat.f_bfree as u64,
            bavail: stat.f_bavail as u64,
            files: stat.f_files as u64,
            ffree: stat.f_ffree as u64,
            block_size: stat.f_bsize as u32,
            fragment_size: stat.f_frsize as u32,
            name_max: stat.f_namemax as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mirror(dir: &TempDir) -> EncryptedMirror {
        EncryptedMirror::new(
            dir.path(),
            Passphrase::new("test-password"),
            Arc::new(PlaintextCache::with_default_ttl()),
        )
        .expect("mirror should build")
    }

    fn write_all(m: &EncryptedMirror, path: &str, data: &[u8]) {
        let opened = m
            .open_file(Path::new(path), OpenMode::Create, AccessMode::ReadWrite)
            .expect("create should succeed");
        m.write(opened.handle, WritePos::Offset(0), data)
            .expect("write should succeed");
        m.close(opened.handle).expect("close should succeed");
    }

    fn read_all(m: &EncryptedMirror, path: &str) -> Vec<u8> {
        let opened = m
            .open_file(Path::new(path), OpenMode::Open, AccessMode::Read)
            .expect("open should succeed");
        let mut out = vec![0u8; 1 << 16];
        let n = m
            .read(opened.handle, 0, &mut out)
            .expect("read should succeed");
        m.close(opened.handle).expect("close should succeed");
        out.truncate(n);
        out
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/hello.txt", b"plaintext body");
        assert_eq!(read_all(&m, "/hello.txt"), b"plaintext body");

        // Backing bytes are ciphertext, not the plaintext
        let raw = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert!(!raw
            .windows(b"plaintext body".len())
            .any(|w| w == b"plaintext body"));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let result = m.open_file(Path::new("/missing"), OpenMode::Open, AccessMode::Read);
        assert!(matches!(result, Err(Error::NotFound(_))));

        let result = m.open_file(
            Path::new("/missing"),
            OpenMode::Truncate,
            AccessMode::ReadWrite,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_create_new_existing_fails() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"data");
        let result = m.open_file(Path::new("/f"), OpenMode::CreateNew, AccessMode::ReadWrite);
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_open_or_create_reports_existing() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let opened = m
            .open_file(Path::new("/f"), OpenMode::OpenOrCreate, AccessMode::ReadWrite)
            .unwrap();
        assert!(!opened.already_existed);
        m.close(opened.handle).unwrap();

        let opened = m
            .open_file(Path::new("/f"), OpenMode::OpenOrCreate, AccessMode::ReadWrite)
            .unwrap();
        assert!(opened.already_existed);
        m.close(opened.handle).unwrap();
    }

    #[test]
    fn test_missing_parent_is_path_not_found() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let result = m.open_file(
            Path::new("/no/such/dir/f"),
            OpenMode::Create,
            AccessMode::ReadWrite,
        );
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_parent_traversal_refused() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let result = m.open_file(Path::new("/../escape"), OpenMode::Open, AccessMode::Read);
        assert!(matches!(result, Err(Error::AccessDenied(_))));
    }

    #[test]
    fn test_open_directory_as_file_fails() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        m.create_dir(Path::new("/sub")).unwrap();
        let result = m.open_file(Path::new("/sub"), OpenMode::Open, AccessMode::Read);
        assert!(matches!(result, Err(Error::NotAFile(_))));
    }

    #[test]
    fn test_append_via_mapper() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/b", b"hello");

        let opened = m
            .open_file(Path::new("/b"), OpenMode::Append, AccessMode::ReadWrite)
            .unwrap();
        m.write(opened.handle, WritePos::Append, b"world").unwrap();
        m.close(opened.handle).unwrap();

        assert_eq!(read_all(&m, "/b"), b"helloworld");
    }

    #[test]
    fn test_cache_invalidation_across_opens() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/a", b"version one");
        // Read-only open installs the snapshot
        assert_eq!(read_all(&m, "/a"), b"version one");

        // Write-capable open must scrub it so this update is visible
        let opened = m
            .open_file(Path::new("/a"), OpenMode::Open, AccessMode::ReadWrite)
            .unwrap();
        m.write(opened.handle, WritePos::Offset(0), b"version two").unwrap();
        m.close(opened.handle).unwrap();

        assert_eq!(read_all(&m, "/a"), b"version two");
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"base");

        let first = m
            .open_file(Path::new("/f"), OpenMode::Open, AccessMode::ReadWrite)
            .unwrap();
        let second = m
            .open_file(Path::new("/f"), OpenMode::Open, AccessMode::ReadWrite)
            .unwrap();

        m.write(first.handle, WritePos::Offset(0), b"from first").unwrap();
        m.write(second.handle, WritePos::Offset(0), b"from second!").unwrap();

        m.close(first.handle).unwrap();
        m.close(second.handle).unwrap();

        assert_eq!(read_all(&m, "/f"), b"from second!");
    }

    #[test]
    fn test_set_len_via_mapper() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"0123456789");

        let opened = m
            .open_file(Path::new("/f"), OpenMode::Open, AccessMode::ReadWrite)
            .unwrap();
        m.set_len(opened.handle, 4).unwrap();
        m.close(opened.handle).unwrap();

        assert_eq!(read_all(&m, "/f"), b"0123");
    }

    #[test]
    fn test_close_is_idempotent_and_releases() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let opened = m
            .open_file(Path::new("/f"), OpenMode::Create, AccessMode::ReadWrite)
            .unwrap();
        assert_eq!(m.open_handles(), 1);

        m.close(opened.handle).unwrap();
        assert_eq!(m.open_handles(), 0);
        m.close(opened.handle).unwrap();

        let result = m.read(opened.handle, 0, &mut [0u8; 4]);
        assert!(matches!(result, Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_delete_file() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"data");
        m.delete_file(Path::new("/f")).unwrap();

        assert!(matches!(
            m.delete_file(Path::new("/f")),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            m.open_file(Path::new("/f"), OpenMode::Open, AccessMode::Read),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_directory_rules() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        m.create_dir(Path::new("/sub")).unwrap();
        write_all(&m, "/sub/f", b"data");

        assert!(matches!(
            m.delete_file(Path::new("/sub")),
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            m.delete_dir(Path::new("/sub")),
            Err(Error::DirectoryNotEmpty(_))
        ));

        m.delete_file(Path::new("/sub/f")).unwrap();
        m.delete_dir(Path::new("/sub")).unwrap();
    }

    #[test]
    fn test_rename_rules() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/a", b"content a");
        write_all(&m, "/b", b"content b");

        assert!(matches!(
            m.rename(Path::new("/a"), Path::new("/b"), false),
            Err(Error::AlreadyExists(_))
        ));

        m.rename(Path::new("/a"), Path::new("/b"), true).unwrap();
        assert_eq!(read_all(&m, "/b"), b"content a");
        assert!(matches!(
            m.open_file(Path::new("/a"), OpenMode::Open, AccessMode::Read),
            Err(Error::NotFound(_))
        ));

        assert!(matches!(
            m.rename(Path::new("/missing"), Path::new("/c"), false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_does_not_serve_stale_cache() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/a", b"content a");
        write_all(&m, "/b", b"content b");
        // Prime the cache for /b, then replace /b by renaming /a over it
        assert_eq!(read_all(&m, "/b"), b"content b");

        m.rename(Path::new("/a"), Path::new("/b"), true).unwrap();
        assert_eq!(read_all(&m, "/b"), b"content a");
    }

    #[test]
    fn test_list_dir_and_info() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        m.create_dir(Path::new("/sub")).unwrap();
        write_all(&m, "/f", b"data");

        let mut names: Vec<String> = m
            .list_dir(Path::new("/"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["f".to_string(), "sub".to_string()]);

        let info = m.get_info(Path::new("/sub")).unwrap();
        assert!(info.is_dir());

        let info = m.get_info(Path::new("/f")).unwrap();
        assert!(!info.is_dir());
        // Backing length: salt plus at least one cipher block
        assert!(info.len >= 48);

        assert!(matches!(
            m.get_info(Path::new("/missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_set_times_passthrough() {
        use std::time::{Duration, UNIX_EPOCH};

        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"data");

        let by_path = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        m.set_times(None, Path::new("/f"), None, Some(by_path)).unwrap();
        assert_eq!(m.get_info(Path::new("/f")).unwrap().modified, by_path);

        let opened = m
            .open_file(Path::new("/f"), OpenMode::Open, AccessMode::Read)
            .unwrap();
        let by_handle = by_path + Duration::from_secs(3600);
        m.set_times(Some(opened.handle), Path::new("/f"), None, Some(by_handle))
            .unwrap();
        m.close(opened.handle).unwrap();
        assert_eq!(m.get_info(Path::new("/f")).unwrap().modified, by_handle);
    }

    #[test]
    fn test_set_permissions() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        write_all(&m, "/f", b"data");
        m.set_permissions(Path::new("/f"), 0o600).unwrap();
        assert_eq!(m.get_info(Path::new("/f")).unwrap().perm, 0o600);
    }

    #[test]
    fn test_free_space() {
        let dir = TempDir::new().unwrap();
        let m = mirror(&dir);

        let space = m.free_space().unwrap();
        assert!(space.blocks > 0);
        assert!(space.block_size > 0);
    }
}
