//! # quire-sync: real-time collaborative text sync
//!
//! A central server sequences every edit to a file; clients apply their
//! own edits optimistically and rebase them over whatever the server
//! confirms first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌─────────────────┐
//! │  SyncClient  │ ◄────────────────► │   SyncServer    │
//! │  (per user)  │   framed messages  │   (central)     │
//! └──────┬───────┘                    └────────┬────────┘
//!        │ one actor per file                  │ SessionDirectory
//!        ▼                                     ▼
//! ┌──────────────┐                    ┌─────────────────┐
//! │  SyncEngine  │                    │ DocumentSession │
//! │ Idle | Sent  │                    │ version, locks  │
//! │ | Rebasing   │                    │ history ring    │
//! └──────────────┘                    └────────┬────────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ Persister     │
//!                                      │ SnapshotStore │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: command codes and JSON message payloads
//! - [`frame`]: binary framing with fragmentation for large payloads
//! - [`locks`]: per-file line lock table
//! - [`session`]: the authoritative per-file sequencer
//! - [`directory`]: open sessions keyed by owner/project/path
//! - [`broadcast`]: fan-out to connection queues
//! - [`engine`]: client-side optimistic replication state machine
//! - [`presence`]: remote carets and lock holders
//! - [`server`] / [`client`]: the WebSocket ends
//! - [`storage`]: snapshots, op log and persistence
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Session apply (1K ops) | <2ms |
//! | Rebase of 50 pending ops | <100µs |
//! | Frame encode + reassemble 64KB | <200µs |

pub mod access;
pub mod broadcast;
pub mod client;
pub mod directory;
pub mod engine;
pub mod error;
pub mod frame;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessControl, AllowAll, StaticAccess};
pub use broadcast::{BroadcastGroup, BroadcastStats, EncodedMessage, Subscriber};
pub use client::{ClientConfig, ConnectionState, DocumentView, FileEvent, FileSyncHandle, SyncClient, SyncEvent};
pub use directory::{FileKey, SessionDirectory};
pub use engine::{EngineConfig, EngineOutput, EngineState, SyncEngine};
pub use error::SyncError;
pub use frame::{Fragmenter, Frame, FrameError, Reassembler};
pub use locks::LineLockTable;
pub use presence::{CursorThrottle, RemoteCursor, RemoteCursors};
pub use protocol::{ClientMessage, Command, ConflictCode, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{DocumentSession, HistoryEntry, SessionConfig, SessionHandle};
pub use storage::{
    DocumentStore, MemoryStore, OpLog, OpLogConfig, Persister, PersisterStats, Snapshot, SnapshotStore,
    StoreConfig, StoreError,
};
