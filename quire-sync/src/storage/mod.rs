//! Durable storage for document snapshots.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  take_flush() under   ┌──────────────┐
//! │ DocumentSession│  the writer lock      │  Persister   │
//! │  OpLog (N ops) │ ────────────────────► │ spawn_blocking│
//! └───────▲────────┘                       └──────┬───────┘
//!         │ requeue() on failure                  │ save_snapshot()
//!         └───────────────────────────────────────┤
//!                                                 ▼
//!                          ┌──────────────────────────────────────┐
//!                          │ SnapshotStore                        │
//!                          │  DocumentStore (RocksDB, LZ4)        │
//!                          │  MemoryStore   (tests, no --data-dir)│
//!                          └──────────────────────────────────────┘
//! ```
//!
//! Content is copied while the session is locked and written after the
//! lock is released, so a slow disk never stalls editing.

pub mod memory;
pub mod oplog;
pub mod persister;
pub mod rocks;

pub use memory::MemoryStore;
pub use oplog::{OpLog, OpLogConfig};
pub use persister::{Persister, PersisterStats};
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use serde::{Deserialize, Serialize};

use crate::directory::FileKey;

/// Durable image of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Write refused (injected failure or read-only store)
    WriteRejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::WriteRejected(e) => write!(f, "Write rejected: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Where snapshots live. Implementations are called from blocking
/// worker threads, never from the async executor directly.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, key: &FileKey, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// `Ok(None)` when the document has never been saved.
    fn load_snapshot(&self, key: &FileKey) -> Result<Option<Snapshot>, StoreError>;
}
