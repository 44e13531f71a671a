//! Moves session snapshots to the store without blocking the executor.
//!
//! At most one snapshot per session is in flight; the session's
//! `persisting` flag is the slot. A failed write puts the drained ops back
//! into the session's op log, so the next flush covers them again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::SnapshotStore;
use crate::error::SyncError;
use crate::session::SessionHandle;

#[derive(Debug, Clone, Default)]
pub struct PersisterStats {
    pub snapshots_written: u64,
    pub snapshots_failed: u64,
    pub ops_persisted: u64,
}

#[derive(Default)]
struct AtomicPersisterStats {
    snapshots_written: AtomicU64,
    snapshots_failed: AtomicU64,
    ops_persisted: AtomicU64,
}

#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn SnapshotStore>,
    stats: Arc<AtomicPersisterStats>,
}

impl Persister {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            stats: Arc::new(AtomicPersisterStats::default()),
        }
    }

    /// Write a snapshot of `handle` if it has unpersisted ops.
    ///
    /// Returns `Ok(false)` when there was nothing to do or another flush
    /// already holds the slot.
    pub async fn flush(&self, handle: &Arc<SessionHandle>) -> Result<bool, SyncError> {
        if !handle.begin_persist() {
            return Ok(false);
        }
        let result = self.write_snapshot(handle).await;
        handle.end_persist();
        result
    }

    async fn write_snapshot(&self, handle: &Arc<SessionHandle>) -> Result<bool, SyncError> {
        let Some(batch) = handle.take_flush().await else {
            return Ok(false);
        };

        let store = self.store.clone();
        let key = handle.key().clone();
        let snapshot = batch.snapshot;
        let version = snapshot.version;
        let outcome = tokio::task::spawn_blocking(move || store.save_snapshot(&key, &snapshot))
            .await
            .map_err(|e| SyncError::PersistenceFailure(format!("snapshot task failed: {e}")))
            .and_then(|r| r.map_err(SyncError::from));

        match outcome {
            Ok(()) => {
                let count = batch.ops.len();
                handle.mark_persisted(count).await;
                self.stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
                self.stats.ops_persisted.fetch_add(count as u64, Ordering::Relaxed);
                log::debug!("Persisted {} at v{version} ({count} ops)", handle.key());
                Ok(true)
            }
            Err(e) => {
                self.stats.snapshots_failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Snapshot of {} at v{version} failed: {e}", handle.key());
                handle.requeue(batch.ops).await;
                Err(e)
            }
        }
    }

    /// Flush in the background. Failures are logged; the ops stay queued.
    pub fn schedule(&self, handle: Arc<SessionHandle>) {
        let persister = self.clone();
        tokio::spawn(async move {
            let _ = persister.flush(&handle).await;
        });
    }

    pub fn stats(&self) -> PersisterStats {
        PersisterStats {
            snapshots_written: self.stats.snapshots_written.load(Ordering::Relaxed),
            snapshots_failed: self.stats.snapshots_failed.load(Ordering::Relaxed),
            ops_persisted: self.stats.ops_persisted.load(Ordering::Relaxed),
        }
    }
}
