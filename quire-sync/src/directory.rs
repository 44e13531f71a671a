//! Registry of open document sessions, keyed by file identity.
//!
//! ```text
//!   open(key) ──► read lock: hit? ──yes──► attach
//!                      │ no
//!                      ▼
//!              load snapshot (blocking pool, no lock held)
//!                      │
//!                      ▼
//!              write lock: re-check, insert, attach
//! ```
//!
//! At most one session exists per key. A session is evicted only once its
//! last subscriber has gone and every accepted op is in a snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::Subscriber;
use crate::error::SyncError;
use crate::protocol::FileContent;
use crate::session::{SessionConfig, SessionHandle};
use crate::storage::{Persister, SnapshotStore};

/// Identity of a shared file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub owner: String,
    pub project: String,
    pub path: String,
}

impl FileKey {
    pub fn new(owner: impl Into<String>, project: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            project: project.into(),
            path: path.into(),
        }
    }

    /// Row key in the document store. NUL cannot appear in any part.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.owner.len() + self.project.len() + self.path.len() + 2);
        key.extend_from_slice(self.owner.as_bytes());
        key.push(0);
        key.extend_from_slice(self.project.as_bytes());
        key.push(0);
        key.extend_from_slice(self.path.as_bytes());
        key
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.project, self.path)
    }
}

pub struct SessionDirectory {
    sessions: RwLock<HashMap<FileKey, Arc<SessionHandle>>>,
    store: Arc<dyn SnapshotStore>,
    persister: Persister,
    config: SessionConfig,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn SnapshotStore>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persister: Persister::new(store.clone()),
            store,
            config,
        }
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    /// Attach `subscriber` to the session for `key`, creating it from the
    /// last snapshot if needed. The content has already been queued to
    /// the subscriber when this returns.
    pub async fn open(&self, key: &FileKey, subscriber: Subscriber) -> Result<(Arc<SessionHandle>, FileContent), SyncError> {
        // Attach under the directory lock; eviction takes it for writing.
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(key) {
                let content = handle.attach(subscriber).await?;
                return Ok((handle.clone(), content));
            }
        }

        let store = self.store.clone();
        let load_key = key.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.load_snapshot(&load_key))
            .await
            .map_err(|e| SyncError::PersistenceFailure(format!("snapshot load task failed: {e}")))??;

        let mut sessions = self.sessions.write().await;
        let handle = match sessions.get(key) {
            Some(existing) => existing.clone(),
            None => {
                log::info!(
                    "Opening session {} at v{}",
                    key,
                    snapshot.as_ref().map_or(0, |s| s.version)
                );
                let handle = Arc::new(SessionHandle::new(key.clone(), snapshot, self.config.clone()));
                sessions.insert(key.clone(), handle.clone());
                handle
            }
        };

        let content = handle.attach(subscriber).await?;
        drop(sessions);
        Ok((handle, content))
    }

    pub async fn get(&self, key: &FileKey) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Detach `conn_id`. When the session empties, flush it and evict it
    /// if nothing is left to persist. Returns whether it was evicted.
    pub async fn close(&self, key: &FileKey, conn_id: &Uuid) -> Result<bool, SyncError> {
        let Some(handle) = self.get(key).await else {
            return Ok(false);
        };
        handle.detach(conn_id).await;
        if handle.subscriber_count().await > 0 {
            return Ok(false);
        }

        self.persister.flush(&handle).await?;
        Ok(self.evict_if_idle(key).await)
    }

    /// Remove `key` if no one is attached and no work is pending.
    async fn evict_if_idle(&self, key: &FileKey) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get(key) else {
            return false;
        };
        if handle.subscriber_count().await > 0 || handle.pending_work().await > 0 {
            return false;
        }
        sessions.remove(key);
        log::info!("Evicted idle session {key}");
        true
    }

    /// Flush every session with pending ops and evict the idle ones.
    ///
    /// Returns the number of sessions evicted. Flush failures are logged
    /// and retried on the next sweep.
    pub async fn sweep(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        let mut evicted = 0;
        for handle in handles {
            if let Err(e) = self.persister.flush(&handle).await {
                log::warn!("Sweep could not persist {}: {e}", handle.key());
                continue;
            }
            if handle.subscriber_count().await == 0 && self.evict_if_idle(handle.key()).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Flush everything, for shutdown.
    pub async fn flush_all(&self) -> Result<(), SyncError> {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            self.persister.flush(&handle).await?;
        }
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Snapshot};
    use quire_core::Operation;
    use tokio::sync::mpsc;

    fn key() -> FileKey {
        FileKey::new("owner", "proj", "src/lib.rs")
    }

    fn subscriber(user: &str) -> (Subscriber, crate::broadcast::OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber::new(Uuid::new_v4(), user, tx), rx)
    }

    #[test]
    fn test_storage_key_separates_parts() {
        let a = FileKey::new("ab", "c", "d").storage_key();
        let b = FileKey::new("a", "bc", "d").storage_key();
        assert_ne!(a, b);
        assert_eq!(FileKey::new("o", "p", "f.rs").to_string(), "o/p/f.rs");
    }

    #[tokio::test]
    async fn test_open_loads_snapshot_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert(key(), Snapshot { content: "fn main() {}".into(), version: 7 });
        let dir = SessionDirectory::new(store, SessionConfig::for_testing());

        let (alice, _rx_a) = subscriber("alice");
        let (bob, _rx_b) = subscriber("bob");
        let (first, content) = dir.open(&key(), alice).await.unwrap();
        let (second, _) = dir.open(&key(), bob).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(content.version, 7);
        assert_eq!(content.content, "fn main() {}");
        assert!(content.verify());
        assert_eq!(dir.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_session() {
        let dir = Arc::new(SessionDirectory::new(Arc::new(MemoryStore::new()), SessionConfig::for_testing()));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                let (sub, rx) = subscriber(&format!("user{i}"));
                let (handle, _) = dir.open(&key(), sub).await.unwrap();
                (handle, rx)
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(dir.session_count().await, 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0].0, &w[1].0)));
        assert_eq!(handles[0].0.subscriber_count().await, 8);
    }

    #[tokio::test]
    async fn test_close_flushes_and_evicts() {
        let store = Arc::new(MemoryStore::new());
        let dir = SessionDirectory::new(store.clone(), SessionConfig::for_testing());
        let (alice, _rx) = subscriber("alice");
        let conn = alice.conn_id;

        let (handle, _) = dir.open(&key(), alice).await.unwrap();
        handle.apply(&Operation::insert(0, "hi", 0, "alice-1"), "alice").await.unwrap();

        assert!(dir.close(&key(), &conn).await.unwrap());
        assert_eq!(dir.session_count().await, 0);
        assert_eq!(store.get(&key()), Some(Snapshot { content: "hi".into(), version: 1 }));
    }

    #[tokio::test]
    async fn test_close_keeps_session_when_flush_fails() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let dir = SessionDirectory::new(store.clone(), SessionConfig::for_testing());
        let (alice, _rx) = subscriber("alice");
        let conn = alice.conn_id;

        let (handle, _) = dir.open(&key(), alice).await.unwrap();
        handle.apply(&Operation::insert(0, "hi", 0, "alice-1"), "alice").await.unwrap();

        assert!(matches!(dir.close(&key(), &conn).await, Err(SyncError::PersistenceFailure(_))));
        assert_eq!(dir.session_count().await, 1);
        assert_eq!(handle.pending_work().await, 1);

        store.set_fail_writes(false);
        assert_eq!(dir.sweep().await, 1);
        assert_eq!(dir.session_count().await, 0);
        assert_eq!(store.get(&key()).map(|s| s.version), Some(1));
    }

    #[tokio::test]
    async fn test_close_with_remaining_subscriber_keeps_session() {
        let dir = SessionDirectory::new(Arc::new(MemoryStore::new()), SessionConfig::for_testing());
        let (alice, _rx_a) = subscriber("alice");
        let (bob, _rx_b) = subscriber("bob");
        let conn = alice.conn_id;
        dir.open(&key(), alice).await.unwrap();
        dir.open(&key(), bob).await.unwrap();

        assert!(!dir.close(&key(), &conn).await.unwrap());
        assert_eq!(dir.session_count().await, 1);
    }
}
