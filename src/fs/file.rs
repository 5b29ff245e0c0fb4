//! Encrypting file handle
//!
//! Each open of a mirrored file gets its own [`EncryptedFile`]: a handle
//! to the backing file plus an in-memory plaintext buffer, decrypted
//! lazily on open and re-encrypted as a whole on flush. Reads, writes and
//! seeks only ever touch the buffer; the cipher runs at open and flush.
//!
//! Two handles on the same path do not share a buffer. Each gets its own
//! decrypted copy and the last one to flush wins at file granularity.

use crate::cache::PlaintextCache;
use crate::crypto::{self, Passphrase};
use crate::error::{Error, Result};
use crate::fs::backend::{AccessMode, OpenMode};
use std::fs::{File, FileTimes, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Whether the buffer has diverged from the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Clean,
    Dirty,
    Closed,
}

pub struct EncryptedFile {
    /// Resolved backing path; doubles as the cache key
    path: PathBuf,
    backing: File,
    buffer: Vec<u8>,
    cursor: usize,
    state: HandleState,
    writable: bool,
    password: Passphrase,
}

impl EncryptedFile {
    /// Open a handle on `path` per the requested mode and access.
    ///
    /// `exists` is the mapper's existence check; mode/existence policy
    /// (not-found, already-exists) is enforced by the caller before this
    /// runs. Crypto failures during initialization propagate untouched —
    /// a backing file that does not decrypt cannot be trusted.
    pub(crate) fn open(
        path: &Path,
        exists: bool,
        mode: OpenMode,
        access: AccessMode,
        password: Passphrase,
        cache: &PlaintextCache,
    ) -> Result<EncryptedFile> {
        let writable = access.is_write();
        let fresh = mode.truncates() || !exists;
        let needs_write = writable || fresh;

        let mut options = OpenOptions::new();
        options.read(true);
        if needs_write {
            options.write(true);
            if mode == OpenMode::CreateNew {
                options.create_new(true);
            } else if mode.creates() {
                options.create(true);
            }
        }

        let backing = options
            .open(path)
            .map_err(|e| Error::from_io(path, e))?;

        let mut file = EncryptedFile {
            path: path.to_path_buf(),
            backing,
            buffer: Vec::new(),
            cursor: 0,
            state: HandleState::Clean,
            writable: needs_write,
            password,
        };

        if fresh {
            // Empty content that the backing file does not yet reflect;
            // the first flush materializes a valid encrypted image.
            file.state = HandleState::Dirty;
            cache.invalidate(&file.path);
        } else if writable {
            cache.invalidate(&file.path);
            file.decrypt_backing()?;
        } else if let Some(bytes) = cache.try_get(&file.path) {
            debug!("Adopting cached plaintext for {:?}", file.path);
            file.buffer = bytes;
        } else {
            file.decrypt_backing()?;
            cache.put(file.path.clone(), file.buffer.clone());
        }

        if mode == OpenMode::Append {
            file.cursor = file.buffer.len();
        }

        Ok(file)
    }

    fn decrypt_backing(&mut self) -> Result<()> {
        let mut reader = &self.backing;
        let mut buffer = Vec::new();
        crypto::decrypt(&mut reader, &mut buffer, &self.password)?;
        self.buffer = buffer;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Err(Error::HandleClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::AccessDenied(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Copy plaintext from the buffer at the cursor; never touches the
    /// backing file or the cipher
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;

        if self.cursor >= self.buffer.len() {
            return Ok(0);
        }
        let n = (self.buffer.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    /// Write plaintext into the buffer at the cursor, extending it as
    /// needed; re-encryption is deferred to flush
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.ensure_writable()?;

        let end = self.cursor + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.cursor..end].copy_from_slice(data);
        self.cursor = end;
        self.state = HandleState::Dirty;
        Ok(data.len())
    }

    /// Reposition the cursor; no I/O
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;

        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.buffer.len() as i64 + delta,
            SeekFrom::Current(delta) => self.cursor as i64 + delta,
        };
        if target < 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )));
        }
        self.cursor = target as usize;
        Ok(target as u64)
    }

    /// Truncate or zero-extend the buffer to `len` bytes
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;

        self.buffer.resize(len as usize, 0);
        self.state = HandleState::Dirty;
        Ok(())
    }

    /// Re-encrypt the whole buffer back to the backing file.
    ///
    /// No-op when clean. Every flush rewrites the complete file under a
    /// fresh salt — O(file size), the cost of a format with no length
    /// field. The write is not transactional: a mid-stream failure can
    /// leave a partially written backing file, and the handle stays
    /// dirty so the flush can be retried.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            HandleState::Closed => Err(Error::HandleClosed),
            HandleState::Clean => Ok(()),
            HandleState::Dirty => {
                debug!(
                    "Re-encrypting {} plaintext bytes to {:?}",
                    self.buffer.len(),
                    self.path
                );
                self.backing.seek(SeekFrom::Start(0))?;
                crypto::encrypt(
                    &mut io::Cursor::new(&self.buffer),
                    &mut self.backing,
                    &self.password,
                )?;
                let end = self.backing.stream_position()?;
                self.backing.set_len(end)?;
                self.state = HandleState::Clean;
                Ok(())
            }
        }
    }

    /// Flush and mark the handle closed. Idempotent: closing an
    /// already-closed handle is a no-op. A flush failure propagates but
    /// the handle is released regardless.
    pub fn close(&mut self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        let result = self.flush();
        self.state = HandleState::Closed;
        result
    }

    /// Byte-range lock on the backing file; operates on ciphertext
    /// offsets and is not cipher-aware
    pub fn lock_range(&self, offset: u64, len: u64) -> Result<()> {
        self.fcntl_lock(libc::F_WRLCK as libc::c_int, offset, len)
    }

    pub fn unlock_range(&self, offset: u64, len: u64) -> Result<()> {
        self.fcntl_lock(libc::F_UNLCK as libc::c_int, offset, len)
    }

    fn fcntl_lock(&self, kind: libc::c_int, offset: u64, len: u64) -> Result<()> {
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = offset as libc::off_t;
        lock.l_len = len as libc::off_t;

        let rc = unsafe { libc::fcntl(self.backing.as_raw_fd(), libc::F_SETLK, &lock) };
        if rc == -1 {
            return Err(Error::AccessDenied(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Timestamp passthrough on the backing file descriptor
    pub fn set_times(
        &self,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        let mut times = FileTimes::new();
        if let Some(t) = accessed {
            times = times.set_accessed(t);
        }
        if let Some(t) = modified {
            times = times.set_modified(t);
        }
        self.backing
            .set_times(times)
            .map_err(|e| Error::from_io(&self.path, e))
    }

    /// Current plaintext length
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.cursor as u64
    }

    pub fn is_dirty(&self) -> bool {
        self.state == HandleState::Dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EncryptedFile {
    fn drop(&mut self) {
        if self.state == HandleState::Dirty {
            if let Err(e) = self.flush() {
                warn!("Dropping dirty handle for {:?}: flush failed: {}", self.path, e);
            }
        }
    }
}
