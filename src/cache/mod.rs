//! Decrypted-content cache
//!
//! A process-scoped map from virtual path to the plaintext of recently
//! decrypted files, so repeated read-only opens of the same path skip the
//! key derivation and decryption work. Entries expire after a short TTL
//! and are evicted by a background sweeper thread.
//!
//! Entries are installed only by successful read-only decryption; every
//! write-capable open scrubs its path, so stale plaintext can never be
//! served after the file may have been mutated. The cache is never a
//! write-back target — writes go through a handle's private buffer.

use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time-to-live for cached plaintext
pub const DEFAULT_TTL: Duration = Duration::from_secs(2);

/// Default period of the background sweeper thread
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct CacheEntry {
    bytes: Vec<u8>,
    last_used: Instant,
}

/// Time-evicted map of decrypted file contents.
///
/// The map itself is concurrent; each entry carries its own lock so a
/// reader copying an entry's bytes excludes the sweeper from evicting
/// that entry, while unrelated paths proceed independently.
pub struct PlaintextCache {
    entries: DashMap<PathBuf, Arc<Mutex<CacheEntry>>>,
    ttl: Duration,
}

impl PlaintextCache {
    /// Create a cache with the given entry TTL
    pub fn new(ttl: Duration) -> Self {
        PlaintextCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Create a cache with the default 2-second TTL
    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Look up a cached snapshot.
    ///
    /// On a hit the entry's timestamp is refreshed and the caller gets a
    /// private copy of the bytes to own independently.
    pub fn try_get(&self, path: &Path) -> Option<Vec<u8>> {
        let slot = self.entries.get(path)?;
        let mut entry = slot.lock();
        entry.last_used = Instant::now();
        Some(entry.bytes.clone())
    }

    /// Install or overwrite the snapshot for a path
    pub fn put(&self, path: PathBuf, bytes: Vec<u8>) {
        debug!("Caching {} plaintext bytes for {:?}", bytes.len(), path);
        self.entries.insert(
            path,
            Arc::new(Mutex::new(CacheEntry {
                bytes,
                last_used: Instant::now(),
            })),
        );
    }

    /// Remove a path's snapshot, if any
    pub fn invalidate(&self, path: &Path) {
        if self.entries.remove(path).is_some() {
            debug!("Invalidated cached plaintext for {:?}", path);
        }
    }

    /// Evict entries unused for longer than the TTL. Returns how many
    /// were removed.
    ///
    /// Best-effort: an entry whose lock is currently held (its bytes are
    /// being copied out) is skipped and picked up on a later pass.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, slot| match slot.try_lock() {
            Some(entry) => now.duration_since(entry.last_used) <= ttl,
            None => true,
        });
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Spawn the background sweeper thread.
    ///
    /// The thread runs [`sweep`](Self::sweep) every `interval` until the
    /// returned handle is stopped or dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle> {
        let cache = Arc::clone(self);
        let (stop_tx, stop_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("cryptmirror-sweeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let evicted = cache.sweep(Instant::now());
                        if evicted > 0 {
                            debug!("Swept {} expired cache entries", evicted);
                        }
                    }
                    _ => break,
                }
            })?;

        Ok(SweeperHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Owns the sweeper thread; stopping (or dropping) the handle ends it
pub struct SweeperHandle {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
