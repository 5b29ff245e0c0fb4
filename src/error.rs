//! Error types for cryptmirror

use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cryptmirror
#[derive(Error, Debug)]
pub enum Error {
    // Filesystem errors
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Sharing violation: {0}")]
    SharingViolation(String),

    #[error("Disk full")]
    DiskFull,

    // Crypto errors
    #[error("Encrypted file too short to contain a salt header")]
    CryptoFormat,

    #[error("Decryption produced invalid padding (wrong password or corrupted file)")]
    CryptoAuth,

    // Handle errors
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("File handle is closed")]
    HandleClosed,

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translate a raw storage error at the mapper boundary into the
    /// driver status vocabulary.
    pub fn from_io(path: &Path, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(path.display().to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.display().to_string()),
            _ => match e.raw_os_error() {
                Some(libc::ENOSPC) => Error::DiskFull,
                Some(libc::EBUSY) | Some(libc::ETXTBSY) => {
                    Error::SharingViolation(path.display().to_string())
                }
                Some(libc::ENOTDIR) => Error::NotADirectory(path.display().to_string()),
                Some(libc::EISDIR) => Error::NotAFile(path.display().to_string()),
                Some(libc::ENOTEMPTY) => Error::DirectoryNotEmpty(path.display().to_string()),
                _ => Error::Io(e),
            },
        }
    }

    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) | Error::PathNotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::NotAFile(_) => libc::EISDIR,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::AccessDenied(_) => libc::EACCES,
            Error::SharingViolation(_) => libc::EBUSY,
            Error::DiskFull => libc::ENOSPC,
            Error::InvalidHandle(_) | Error::HandleClosed => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}
