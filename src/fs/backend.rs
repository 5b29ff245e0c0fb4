//! Backend abstraction
//!
//! The driver dispatch layer talks to storage exclusively through
//! [`MirrorBackend`], so a test double can stand in for the encrypting
//! mirror without touching real files.

use crate::error::Result;
use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;

/// Opaque per-open context. The driver stores it when a file is opened
/// and hands it back unchanged on every subsequent call for that open.
pub type HandleId = u64;

/// How a file is opened or created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file; fail if missing
    Open,
    /// Create the file, or replace its content if it exists
    Create,
    /// Create the file; fail if it already exists
    CreateNew,
    /// Open if present, create otherwise
    OpenOrCreate,
    /// Drop the content of an existing file; fail if missing
    Truncate,
    /// Open or create, with the cursor positioned at the end
    Append,
}

impl OpenMode {
    /// Modes that start from empty content instead of the file's current
    /// plaintext
    pub(crate) fn truncates(self) -> bool {
        matches!(
            self,
            OpenMode::Create | OpenMode::CreateNew | OpenMode::Truncate
        )
    }

    /// Modes allowed to create the file when it is missing
    pub(crate) fn creates(self) -> bool {
        matches!(
            self,
            OpenMode::Create | OpenMode::CreateNew | OpenMode::OpenOrCreate | OpenMode::Append
        )
    }
}

/// Requested data access for an open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl AccessMode {
    pub fn is_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// Where a write lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePos {
    Offset(u64),
    Append,
}

/// Result of a successful open
#[derive(Debug, Clone, Copy)]
pub struct OpenedFile {
    /// Context to pass on every later call for this open
    pub handle: HandleId,
    /// The path already existed; informational, not a failure
    pub already_existed: bool,
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Passthrough metadata for one path.
///
/// `len` is the backing file's size, i.e. the encrypted length for
/// regular files; plaintext length is only known after decryption.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub kind: FileKind,
    pub len: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub created: SystemTime,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub(crate) fn from_metadata(meta: &Metadata) -> FileInfo {
        use std::os::unix::fs::MetadataExt;

        let kind = if meta.file_type().is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        FileInfo {
            kind,
            len: meta.len(),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            accessed: meta.accessed().unwrap_or(modified),
            modified,
            created: meta.created().unwrap_or(modified),
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub info: FileInfo,
}

/// Free-space figures for the volume holding the backing directory
#[derive(Debug, Clone, Copy)]
pub struct FreeSpace {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub block_size: u32,
    pub fragment_size: u32,
    pub name_max: u32,
}

/// Storage capability set the driver dispatch layer is written against
pub trait MirrorBackend: Send + Sync + 'static {
    /// Open or create a file per `mode`/`access`; returns the per-open
    /// context and whether the path already existed
    fn open_file(&self, path: &Path, mode: OpenMode, access: AccessMode) -> Result<OpenedFile>;

    /// Copy plaintext at `offset` into `buf`; returns bytes read
    fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write plaintext at the given position; returns bytes written
    fn write(&self, handle: HandleId, pos: WritePos, data: &[u8]) -> Result<usize>;

    /// Re-encrypt buffered content back to storage if it changed
    fn flush(&self, handle: HandleId) -> Result<()>;

    /// Truncate or zero-extend the plaintext to `len` bytes
    fn set_len(&self, handle: HandleId, len: u64) -> Result<()>;

    /// Flush and release; releasing an unknown handle is a no-op
    fn close(&self, handle: HandleId) -> Result<()>;

    /// Byte-range lock on the backing file; not cipher-aware
    fn lock_range(&self, handle: HandleId, offset: u64, len: u64) -> Result<()>;

    fn unlock_range(&self, handle: HandleId, offset: u64, len: u64) -> Result<()>;

    fn create_dir(&self, path: &Path) -> Result<()>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    fn delete_dir(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path, replace: bool) -> Result<()>;

    fn get_info(&self, path: &Path) -> Result<FileInfo>;

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Timestamp passthrough. When the caller has an open handle, the
    /// backing file's descriptor is used; otherwise the path is.
    fn set_times(
        &self,
        handle: Option<HandleId>,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()>;

    /// Permission-bit passthrough on the backing file
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    fn free_space(&self) -> Result<FreeSpace>;
}
