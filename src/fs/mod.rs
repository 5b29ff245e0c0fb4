//! Filesystem core
//!
//! Maps driver-level open/read/write/flush requests onto encrypting file
//! handles over a backing directory, and carries the thin FUSE dispatch
//! layer that feeds it.

mod backend;
mod driver;
mod file;
mod handle;
mod mirror;

pub use backend::{
    AccessMode, DirEntry, FileInfo, FileKind, FreeSpace, HandleId, MirrorBackend, OpenMode,
    OpenedFile, WritePos,
};
pub use driver::MirrorFs;
pub use file::EncryptedFile;
pub use handle::HandleManager;
pub use mirror::EncryptedMirror;
