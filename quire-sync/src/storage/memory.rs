//! In-process snapshot store. Used when the server runs without a data
//! directory, and by tests that need to inject write failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Snapshot, SnapshotStore, StoreError};
use crate::directory::FileKey;

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<FileKey, Snapshot>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &FileKey) -> Option<Snapshot> {
        self.snapshots.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: FileKey, snapshot: Snapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.insert(key, snapshot);
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, key: &FileKey, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(format!("{key}")));
        }
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        snapshots.insert(key.clone(), snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_snapshot(&self, key: &FileKey) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(snapshots.get(key).cloned())
    }
}
