//! Open-handle registry

use crate::fs::file::EncryptedFile;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registry of open encrypted files, keyed by the opaque id the driver
/// carries as its per-open context. The per-handle mutex serializes
/// overlapped operations on one open; different handles never contend.
pub struct HandleManager {
    next_id: AtomicU64,
    handles: DashMap<u64, Arc<Mutex<EncryptedFile>>>,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    /// Register an open file and return its id
    pub fn insert(&self, file: EncryptedFile) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(id, Arc::new(Mutex::new(file)));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<Mutex<EncryptedFile>>> {
        self.handles.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Unregister a handle; later lookups for the id fail
    pub fn remove(&self, id: u64) -> Option<Arc<Mutex<EncryptedFile>>> {
        self.handles.remove(&id).map(|(_, file)| file)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
