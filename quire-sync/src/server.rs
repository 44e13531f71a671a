//! WebSocket sync server with per-file session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── DocumentSession (per file)
//!             ├── connection task ──► │       │
//! Client B ──┘   (one per socket)     │       ├── LineLockTable
//!                                     │       ├── history ring
//!                                     │       └── BroadcastGroup ──► A, B
//!                                     │
//!                                     └── SessionDirectory ── Persister
//!                                                                 │
//!                                                          SnapshotStore
//!                                                      (RocksDB or memory)
//! ```
//!
//! Each connection task owns one outbound queue. Direct replies and
//! session broadcasts share it, so a client sees replies and broadcasts
//! in the order the sessions produced them.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::{AccessControl, AllowAll};
use crate::broadcast::{EncodedMessage, OutboundTx, Subscriber};
use crate::directory::{FileKey, SessionDirectory};
use crate::error::SyncError;
use crate::frame::{Fragmenter, Frame, Reassembler};
use crate::protocol::{
    ClientMessage, Conflict, CursorUpdate, EditBroadcast, EditRequest, HistoryReplay, HistoryRequest,
    LineRequest, OpenFileRequest, ServerMessage,
};
use crate::session::{SessionConfig, SessionHandle};
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub session: SessionConfig,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Seconds between background flush/evict sweeps
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            storage_path: None,
            sweep_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub persisted_snapshots: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// State shared by every connection task.
struct Shared {
    directory: SessionDirectory,
    access: Arc<dyn AccessControl>,
    stats: AtomicServerStats,
    next_conn: AtomicUsize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB store if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with an explicit snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let shared = Arc::new(Shared {
            directory: SessionDirectory::new(store, config.session.clone()),
            access: Arc::new(AllowAll),
            stats: AtomicServerStats::default(),
            next_conn: AtomicUsize::new(0),
        });
        Self { config, shared }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Replace the access policy. Must be called before [`SyncServer::run`].
    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.access = access;
        } else {
            log::warn!("Access policy not replaced: server already running");
        }
        self
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SyncError::Protocol(format!("bind {}: {e}", self.config.bind_addr)))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let local = listener
            .local_addr()
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        log::info!("Sync server listening on {local}");

        let sweeper = self.spawn_sweeper();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(SyncError::Protocol(format!("accept: {e}"))),
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        sweeper.abort();
        result
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = shared.directory.sweep().await;
                if evicted > 0 {
                    log::debug!("Sweep evicted {evicted} idle sessions");
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), SyncError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let serial = shared.next_conn.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection #{serial} established from {addr}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = Connection {
            id: Uuid::new_v4(),
            user: None,
            open: HashMap::new(),
            out: out_tx,
            shared: shared.clone(),
        };
        let mut fragmenter = Fragmenter::default();
        let mut reassembler = Reassembler::default();

        let result: Result<(), SyncError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                shared.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                                let frame = match Frame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Bad frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                match reassembler.push(frame) {
                                    Ok(Some((command, payload))) => {
                                        shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                        match ClientMessage::decode(command, &payload) {
                                            Ok(message) => conn.dispatch(message).await?,
                                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => log::warn!("Reassembly failed for {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    Some(encoded) = out_rx.recv() => {
                        for bytes in fragmenter.encode(encoded.command as u8, &encoded.payload)? {
                            ws_sender.send(Message::Binary(bytes.into())).await?;
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        conn.disconnect().await;
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let stats = &self.shared.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.shared.directory.session_count().await,
            persisted_snapshots: self.shared.directory.persister().stats().snapshots_written,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.shared.directory
    }
}

/// Per-connection state.
struct Connection {
    id: Uuid,
    /// Set by the first successful `OpenFile`
    user: Option<String>,
    /// path → session, for files this connection has open
    open: HashMap<String, Arc<SessionHandle>>,
    out: OutboundTx,
    shared: Arc<Shared>,
}

impl Connection {
    fn reply(&self, msg: &ServerMessage) -> Result<(), SyncError> {
        let encoded = EncodedMessage::encode(msg)?;
        self.out.send(encoded).map_err(|_| SyncError::ConnectionClosed)
    }

    fn conflict(&self, path: &str, error: &SyncError, op: Option<&quire_core::Operation>) -> Result<(), SyncError> {
        self.reply(&ServerMessage::ConflictError(Conflict::from_error(path, error, op)))
    }

    /// Session and user for `path`, or an UNAUTHORIZED reply.
    fn session_for(&self, path: &str) -> Result<Option<(Arc<SessionHandle>, String)>, SyncError> {
        match (self.open.get(path), &self.user) {
            (Some(handle), Some(user)) => Ok(Some((handle.clone(), user.clone()))),
            _ => {
                let error = SyncError::AuthorizationFailure {
                    user: self.user.clone().unwrap_or_default(),
                    resource: path.to_string(),
                };
                self.conflict(path, &error, None)?;
                Ok(None)
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<(), SyncError> {
        match message {
            ClientMessage::OpenFile(req) => self.open_file(req).await,
            ClientMessage::AcquireLineLock(req) => self.acquire_line(req).await,
            ClientMessage::ReleaseLineLock(req) => self.release_line(req).await,
            ClientMessage::EditOperation(req) => self.edit(req).await,
            ClientMessage::RequestHistory(req) => self.history(req).await,
            ClientMessage::CursorMove(update) => self.cursor(update).await,
            ClientMessage::CloseFile(req) => self.close_file(&req.path).await,
            ClientMessage::Ping => self.reply(&ServerMessage::Pong),
        }
    }

    async fn open_file(&mut self, req: OpenFileRequest) -> Result<(), SyncError> {
        if let Some(user) = &self.user {
            if user != &req.requester {
                let error = SyncError::AuthorizationFailure {
                    user: req.requester.clone(),
                    resource: req.path.clone(),
                };
                return self.conflict(&req.path, &error, None);
            }
        }
        if !self.shared.access.authorize(&req.requester, &req.owner, &req.project) {
            log::warn!("{} denied access to {}/{}", req.requester, req.owner, req.project);
            let error = SyncError::AuthorizationFailure {
                user: req.requester.clone(),
                resource: format!("{}/{}", req.owner, req.project),
            };
            return self.conflict(&req.path, &error, None);
        }
        if self.open.contains_key(&req.path) {
            self.close_file(&req.path).await?;
        }

        let key = FileKey::new(&req.owner, &req.project, &req.path);
        let subscriber = Subscriber::new(self.id, &req.requester, self.out.clone());
        match self.shared.directory.open(&key, subscriber).await {
            Ok((handle, content)) => {
                log::debug!("{} opened {key} at v{}", req.requester, content.version);
                self.user = Some(req.requester);
                self.open.insert(req.path, handle);
                Ok(())
            }
            Err(SyncError::ConnectionClosed) => Err(SyncError::ConnectionClosed),
            Err(e) => {
                log::error!("Failed to open {key}: {e}");
                self.conflict(&req.path, &e, None)
            }
        }
    }

    async fn acquire_line(&mut self, req: LineRequest) -> Result<(), SyncError> {
        let Some((handle, user)) = self.session_for(&req.path)? else {
            return Ok(());
        };
        handle.acquire_line(req.line_number, &user, self.id).await?;
        Ok(())
    }

    async fn release_line(&mut self, req: LineRequest) -> Result<(), SyncError> {
        let Some((handle, user)) = self.session_for(&req.path)? else {
            return Ok(());
        };
        handle.release_line(req.line_number, &user).await?;
        Ok(())
    }

    async fn edit(&mut self, req: EditRequest) -> Result<(), SyncError> {
        let Some((handle, user)) = self.session_for(&req.path)? else {
            return Ok(());
        };
        match handle.apply(&req.op, &user).await {
            Ok(applied) => {
                if applied.snapshot_due {
                    self.shared.directory.persister().schedule(handle);
                }
                Ok(())
            }
            Err(e) => {
                log::debug!("Rejected {} from {user}: {e}", req.op.op_id);
                self.conflict(&req.path, &e, Some(&req.op))
            }
        }
    }

    async fn history(&mut self, req: HistoryRequest) -> Result<(), SyncError> {
        let Some((handle, _)) = self.session_for(&req.path)? else {
            return Ok(());
        };
        match handle.history(req.from_version).await {
            Ok(entries) => self.reply(&ServerMessage::HistoryReplay(HistoryReplay {
                entries: entries
                    .into_iter()
                    .map(|entry| EditBroadcast {
                        path: req.path.clone(),
                        user: entry.user,
                        op: entry.op,
                    })
                    .collect(),
                path: req.path,
            })),
            Err(e) => self.conflict(&req.path, &e, None),
        }
    }

    async fn cursor(&mut self, mut update: CursorUpdate) -> Result<(), SyncError> {
        let Some((handle, user)) = self.session_for(&update.path)? else {
            return Ok(());
        };
        update.user = user;
        handle.move_cursor(update, self.id).await?;
        Ok(())
    }

    async fn close_file(&mut self, path: &str) -> Result<(), SyncError> {
        let Some(handle) = self.open.remove(path) else {
            return Ok(());
        };
        leave_file(&self.shared, self.id, self.user.as_deref(), handle).await;
        Ok(())
    }

    /// Release locks and detach from every open file.
    async fn disconnect(&mut self) {
        for handle in std::mem::take(&mut self.open).into_values() {
            leave_file(&self.shared, self.id, self.user.as_deref(), handle).await;
        }
    }
}

/// Files still open here mean the task ended without reaching
/// [`Connection::disconnect`], e.g. a panic while handling a message.
impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        if self.open.is_empty() {
            return;
        }

        let open = std::mem::take(&mut self.open);
        let (shared, conn_id, user) = (self.shared.clone(), self.id, self.user.take());
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("Connection {conn_id} dropped outside the runtime with {} files open", open.len());
            return;
        };
        log::warn!("Connection {conn_id} ended abruptly, releasing {} files", open.len());
        runtime.spawn(async move {
            for handle in open.into_values() {
                leave_file(&shared, conn_id, user.as_deref(), handle).await;
            }
        });
    }
}

/// Drop `user`'s locks on the file and detach the connection from it.
async fn leave_file(shared: &Shared, conn_id: Uuid, user: Option<&str>, handle: Arc<SessionHandle>) {
    if let Some(user) = user {
        if let Err(e) = handle.release_all(user).await {
            log::warn!("Releasing {user}'s locks on {} failed: {e}", handle.key());
        }
    }
    if let Err(e) = shared.directory.close(handle.key(), &conn_id).await {
        log::warn!("Close of {} left work pending: {e}", handle.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.session.history_capacity, 1000);
        assert_eq!(config.sweep_interval_secs, 30);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.directory().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.persisted_snapshots, 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_releases_locks_and_detaches() {
        let server = SyncServer::with_defaults();
        let shared = server.shared.clone();
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut conn = Connection {
            id: Uuid::new_v4(),
            user: None,
            open: HashMap::new(),
            out: out_tx,
            shared,
        };

        conn.open_file(OpenFileRequest {
            requester: "alice".into(),
            project: "proj".into(),
            owner: "alice".into(),
            path: "a.txt".into(),
        })
        .await
        .unwrap();
        conn.acquire_line(LineRequest {
            path: "a.txt".into(),
            line_number: 1,
        })
        .await
        .unwrap();
        let session = server.directory().get(&FileKey::new("alice", "proj", "a.txt")).await.unwrap();
        assert_eq!(session.lock_owner(1).await.as_deref(), Some("alice"));

        // no disconnect(): the task died mid-message
        drop(conn);
        timeout(Duration::from_secs(3), async {
            while session.lock_owner(1).await.is_some() || session.subscriber_count().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("locks never released");
        assert_eq!(server.stats().await.active_connections, 0);
    }
}
