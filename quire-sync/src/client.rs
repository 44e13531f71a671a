//! WebSocket sync client and per-file replication actors.
//!
//! ```text
//!             ┌──────────── SyncClient ────────────┐
//!  UI ──────► │ FileSyncHandle ──FileCommand──► FileSyncActor (SyncEngine,
//!  (per file) │      ▲                          │    RemoteCursors)
//!             │      └──── watch<DocumentView> ─┤
//!             │            FileEvent            │ ClientMessage
//!             │                                 ▼
//!             │  reader task ◄── frames ── WebSocket ── frames ◄── writer task
//!             │      │ ServerMessage, routed by path
//!             └──────┴──────────────────────────────────────────────┘
//! ```
//!
//! Each open file is owned by exactly one actor task, so rebase and
//! catch-up always finish before the next local edit is looked at.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::engine::{EngineConfig, EngineOutput, EngineState, SyncEngine};
use crate::error::SyncError;
use crate::frame::{Fragmenter, Frame, Reassembler};
use crate::presence::{CursorThrottle, RemoteCursors};
use crate::protocol::{
    ClientMessage, CloseRequest, Conflict, CursorUpdate, EditRequest, FileContent, HistoryRequest, LineRequest,
    OpenFileRequest, ServerMessage,
};
use quire_core::Operation;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub user: String,
    /// Prefix of every op id this client issues.
    pub client_id: String,
    pub engine: EngineConfig,
    /// How long `open_document` waits for the file content.
    pub open_timeout: Duration,
    /// How often actors check the in-flight timeout.
    pub tick_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            url: url.into(),
            client_id: format!("{user}-{}", &suffix[..8]),
            user,
            engine: EngineConfig::default(),
            open_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Connection-level events not owned by any open file.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<FileCommand>>>>;

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    routes: Routes,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            routes: Arc::new(Mutex::new(HashMap::new())),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn user(&self) -> &str {
        &self.config.user
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect to the server. Spawns the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        self.outgoing_tx = Some(out_tx);

        // Writer task: frame outgoing messages onto the socket
        tokio::spawn(async move {
            let mut fragmenter = Fragmenter::default();
            while let Some(msg) = out_rx.recv().await {
                let frames = msg
                    .encode_payload()
                    .map_err(SyncError::from)
                    .and_then(|payload| Ok(fragmenter.encode(msg.command() as u8, &payload)?));
                let frames = match frames {
                    Ok(frames) => frames,
                    Err(e) => {
                        log::error!("Dropping unencodable {:?}: {e}", msg.command());
                        continue;
                    }
                };
                for bytes in frames {
                    if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                        return;
                    }
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: reassemble, decode, route by path
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            let mut reassembler = Reassembler::default();
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let decoded = Frame::decode(&data)
                            .and_then(|frame| reassembler.push(frame))
                            .map_err(SyncError::from)
                            .and_then(|done| match done {
                                Some((command, payload)) => Ok(Some(ServerMessage::decode(command, &payload)?)),
                                None => Ok(None),
                            });
                        match decoded {
                            Ok(Some(message)) => route(&routes, &event_tx, message).await,
                            Ok(None) => {}
                            Err(e) => log::warn!("Bad message from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            for (_, actor) in routes.lock().await.drain() {
                let _ = actor.send(FileCommand::Disconnected);
            }
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected);
        Ok(())
    }

    fn outgoing(&self) -> Result<mpsc::UnboundedSender<ClientMessage>, SyncError> {
        self.outgoing_tx.clone().ok_or(SyncError::ConnectionClosed)
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SyncError> {
        self.outgoing()?.send(msg).map_err(|_| SyncError::ConnectionClosed)
    }

    /// Open a file and start its replication actor.
    ///
    /// Resolves once the server's `FileContent` has arrived.
    pub async fn open_document(
        &self,
        owner: impl Into<String>,
        project: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<FileSyncHandle, SyncError> {
        let request = OpenFileRequest {
            requester: self.config.user.clone(),
            project: project.into(),
            owner: owner.into(),
            path: path.into(),
        };
        let path = request.path.clone();
        let outgoing = self.outgoing()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock().await;
            if routes.contains_key(&path) {
                return Err(SyncError::InvalidOperation(format!("{path} is already open")));
            }
            routes.insert(path.clone(), cmd_tx.clone());
        }
        outgoing
            .send(ClientMessage::OpenFile(request.clone()))
            .map_err(|_| SyncError::ConnectionClosed)?;

        let mut actor = FileSyncActor::new(self.config.clone(), request, outgoing, cmd_rx, self.routes.clone());
        let content = match tokio::time::timeout(self.config.open_timeout, actor.await_content()).await {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                self.routes.lock().await.remove(&path);
                return Err(e);
            }
            Err(_) => {
                self.routes.lock().await.remove(&path);
                return Err(SyncError::Timeout(format!("content of {path}")));
            }
        };

        let (view_tx, view_rx) = watch::channel(DocumentView {
            text: content.content.clone(),
            version: content.version,
            state: EngineState::Idle,
            pending: 0,
            cursors: Vec::new(),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(actor.run(content, view_tx, event_tx, closed_tx));

        Ok(FileSyncHandle {
            path,
            cmd_tx,
            view: view_rx,
            events: event_rx,
            closed: Some(closed_rx),
        })
    }

    pub fn ping(&self) -> Result<(), SyncError> {
        self.send(ClientMessage::Ping)
    }

    /// Stop the writer task; the socket closes once it drains.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        for (_, actor) in self.routes.lock().await.drain() {
            let _ = actor.send(FileCommand::Disconnected);
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

async fn route(routes: &Routes, events: &mpsc::UnboundedSender<SyncEvent>, message: ServerMessage) {
    if let Some(path) = message.path() {
        if let Some(actor) = routes.lock().await.get(path) {
            if actor.send(FileCommand::Server(message.clone())).is_ok() {
                return;
            }
        }
    }
    let _ = events.send(SyncEvent::Message(message));
}

// ─── Per-file actor ───────────────────────────────────────────────────

#[derive(Debug)]
pub enum FileCommand {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    MoveCursor(usize),
    AcquireLine(usize),
    ReleaseLine(usize),
    Server(ServerMessage),
    Close,
    Disconnected,
}

/// Snapshot of a file as the UI should show it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    pub text: String,
    /// Last server version this replica has confirmed.
    pub version: u64,
    pub state: EngineState,
    pub pending: usize,
    /// Other users' carets, sorted by position.
    pub cursors: Vec<(String, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// Remote ops applied to the visible text.
    TextChanged(Vec<Operation>),
    Confirmed { op_id: String, version: u64 },
    /// A local op was refused and undone.
    Rejected { op: Operation, error: SyncError },
    /// The file was reloaded; these local ops were lost.
    Reloaded { dropped: Vec<Operation> },
    LockResult { line: usize, granted: bool, owner: Option<String> },
    LinesUnlocked { lines: Vec<usize>, user: String },
    CursorsChanged(Vec<(String, usize)>),
    StateChanged(EngineState),
    /// A request failed without touching the text.
    Error(SyncError),
}

struct FileSyncActor {
    config: ClientConfig,
    request: OpenFileRequest,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    commands: mpsc::UnboundedReceiver<FileCommand>,
    routes: Routes,
}

impl FileSyncActor {
    fn new(
        config: ClientConfig,
        request: OpenFileRequest,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
        commands: mpsc::UnboundedReceiver<FileCommand>,
        routes: Routes,
    ) -> Self {
        Self {
            config,
            request,
            outgoing,
            commands,
            routes,
        }
    }

    /// Wait for the `FileContent` answering our `OpenFile`.
    async fn await_content(&mut self) -> Result<FileContent, SyncError> {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                FileCommand::Server(ServerMessage::FileContent(content)) => {
                    if !content.verify() {
                        log::warn!("{}: content hash mismatch", content.path);
                    }
                    return Ok(content);
                }
                FileCommand::Server(ServerMessage::ConflictError(conflict)) => return Err(conflict.to_error()),
                FileCommand::Disconnected => return Err(SyncError::ConnectionClosed),
                _ => {}
            }
        }
        Err(SyncError::ConnectionClosed)
    }

    async fn run(
        mut self,
        content: FileContent,
        view: watch::Sender<DocumentView>,
        events: mpsc::UnboundedSender<FileEvent>,
        closed: oneshot::Sender<()>,
    ) {
        let path = self.request.path.clone();
        let mut engine = SyncEngine::new(
            self.config.client_id.clone(),
            content.content,
            content.version,
            self.config.engine.clone(),
        );
        let mut cursors = RemoteCursors::new(self.config.user.clone());
        let mut throttle = CursorThrottle::default();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        let mut last_state = engine.state();

        loop {
            let outputs = tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        FileCommand::Insert { position, text } => {
                            let result = engine.local_insert(position, &text);
                            let edit = Operation::insert(position, text, 0, self.config.client_id.as_str());
                            self.local(result, &edit, &mut cursors, &events)
                        }
                        FileCommand::Delete { position, length } => {
                            let result = engine.local_delete(position, length);
                            let edit = Operation::delete(position, length, 0, self.config.client_id.as_str());
                            self.local(result, &edit, &mut cursors, &events)
                        }
                        FileCommand::MoveCursor(position) => {
                            if let Some(position) = throttle.offer(position, Instant::now()) {
                                self.send_cursor(position);
                            }
                            Vec::new()
                        }
                        FileCommand::AcquireLine(line) => {
                            self.send(ClientMessage::AcquireLineLock(LineRequest { path: path.clone(), line_number: line }));
                            Vec::new()
                        }
                        FileCommand::ReleaseLine(line) => {
                            self.send(ClientMessage::ReleaseLineLock(LineRequest { path: path.clone(), line_number: line }));
                            Vec::new()
                        }
                        FileCommand::Server(message) => {
                            self.on_server(message, &mut engine, &mut cursors, &events)
                        }
                        FileCommand::Close => {
                            self.send(ClientMessage::CloseFile(CloseRequest { path: path.clone() }));
                            break;
                        }
                        FileCommand::Disconnected => {
                            let _ = events.send(FileEvent::Error(SyncError::ConnectionClosed));
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Some(position) = throttle.flush(Instant::now()) {
                        self.send_cursor(position);
                    }
                    if !cursors.prune_idle().is_empty() {
                        let _ = events.send(FileEvent::CursorsChanged(cursors.list()));
                    }
                    engine.poll_timeout(Instant::now())
                }
            };

            self.perform(outputs, &engine, &mut cursors, &events);
            if engine.state() != last_state {
                last_state = engine.state();
                let _ = events.send(FileEvent::StateChanged(last_state));
            }
            view.send_replace(DocumentView {
                text: engine.text().to_string(),
                version: engine.local_version(),
                state: engine.state(),
                pending: engine.pending_len(),
                cursors: cursors.list(),
            });
        }

        self.routes.lock().await.remove(&path);
        let _ = closed.send(());
        log::debug!("{}: actor for {path} stopped", self.config.client_id);
    }

    /// Outcome of a local edit. Remote carets move with it once it is applied.
    fn local(
        &self,
        result: Result<Vec<EngineOutput>, SyncError>,
        edit: &Operation,
        cursors: &mut RemoteCursors,
        events: &mpsc::UnboundedSender<FileEvent>,
    ) -> Vec<EngineOutput> {
        match result {
            Ok(outputs) => {
                cursors.shift(edit);
                outputs
            }
            Err(e) => {
                let _ = events.send(FileEvent::Error(e));
                Vec::new()
            }
        }
    }

    fn on_server(
        &self,
        message: ServerMessage,
        engine: &mut SyncEngine,
        cursors: &mut RemoteCursors,
        events: &mpsc::UnboundedSender<FileEvent>,
    ) -> Vec<EngineOutput> {
        match message {
            ServerMessage::EditBroadcast(broadcast) => engine.handle_broadcast(&broadcast.op, &broadcast.user),
            ServerMessage::HistoryReplay(replay) => {
                let ops: Vec<Operation> = replay.entries.into_iter().map(|e| e.op).collect();
                engine.catch_up(&ops)
            }
            ServerMessage::ConflictError(conflict) => self.on_conflict(conflict, engine, events),
            ServerMessage::FileContent(content) => {
                if !content.verify() {
                    log::warn!("{}: content hash mismatch on reload", content.path);
                }
                engine.resync(content.content, content.version)
            }
            ServerMessage::CursorBroadcast(update) => {
                if cursors.update(&update.user, update.cursor_position) {
                    let _ = events.send(FileEvent::CursorsChanged(cursors.list()));
                }
                Vec::new()
            }
            ServerMessage::LineLockResult(result) => {
                match (&result.lock_owner, result.success) {
                    (Some(owner), true) => cursors.line_locked(result.line_number, owner),
                    (None, true) => cursors.line_locked(result.line_number, &self.config.user),
                    _ => {}
                }
                let _ = events.send(FileEvent::LockResult {
                    line: result.line_number,
                    granted: result.success,
                    owner: result.lock_owner,
                });
                Vec::new()
            }
            ServerMessage::LineUnlocked(unlocked) => {
                cursors.lines_unlocked(&unlocked.line_numbers);
                let _ = events.send(FileEvent::LinesUnlocked {
                    lines: unlocked.line_numbers,
                    user: unlocked.user,
                });
                Vec::new()
            }
            ServerMessage::UserLeft(left) => {
                if cursors.remove(&left.user).is_some() {
                    let _ = events.send(FileEvent::CursorsChanged(cursors.list()));
                }
                Vec::new()
            }
            ServerMessage::Pong => Vec::new(),
        }
    }

    fn on_conflict(
        &self,
        conflict: Conflict,
        engine: &mut SyncEngine,
        events: &mpsc::UnboundedSender<FileEvent>,
    ) -> Vec<EngineOutput> {
        let touches_engine = conflict.op_id.is_some()
            || conflict.error_code == crate::protocol::ConflictCode::HistoryExhausted;
        if touches_engine {
            engine.handle_conflict(&conflict)
        } else {
            let _ = events.send(FileEvent::Error(conflict.to_error()));
            Vec::new()
        }
    }

    fn perform(
        &self,
        outputs: Vec<EngineOutput>,
        engine: &SyncEngine,
        cursors: &mut RemoteCursors,
        events: &mpsc::UnboundedSender<FileEvent>,
    ) {
        let path = &self.request.path;
        for output in outputs {
            match output {
                EngineOutput::Send(op) => self.send(ClientMessage::EditOperation(EditRequest { path: path.clone(), op })),
                EngineOutput::RequestHistory { from_version } => {
                    self.send(ClientMessage::RequestHistory(HistoryRequest {
                        path: path.clone(),
                        from_version,
                    }))
                }
                EngineOutput::RequestResync => {
                    log::info!("{}: reloading {path}", self.config.client_id);
                    self.send(ClientMessage::OpenFile(self.request.clone()));
                }
                EngineOutput::TextChanged(ops) => {
                    for op in &ops {
                        cursors.shift(op);
                    }
                    let _ = events.send(FileEvent::TextChanged(ops));
                }
                EngineOutput::Confirmed { op_id, version } => {
                    let _ = events.send(FileEvent::Confirmed { op_id, version });
                }
                EngineOutput::Rejected { op, error } => {
                    log::debug!("{}: {} rejected: {error}", self.config.client_id, op.op_id);
                    let _ = events.send(FileEvent::Rejected { op, error });
                }
                EngineOutput::Reloaded { dropped } => {
                    log::debug!("{}: {path} reloaded at v{}", self.config.client_id, engine.local_version());
                    let _ = events.send(FileEvent::Reloaded { dropped });
                }
            }
        }
    }

    fn send_cursor(&self, position: usize) {
        self.send(ClientMessage::CursorMove(CursorUpdate {
            path: self.request.path.clone(),
            cursor_position: position,
            user: self.config.user.clone(),
        }));
    }

    fn send(&self, msg: ClientMessage) {
        if self.outgoing.send(msg).is_err() {
            log::debug!("{}: connection gone, dropping message", self.config.client_id);
        }
    }
}

/// UI-side handle to one open file.
pub struct FileSyncHandle {
    path: String,
    cmd_tx: mpsc::UnboundedSender<FileCommand>,
    view: watch::Receiver<DocumentView>,
    events: mpsc::UnboundedReceiver<FileEvent>,
    closed: Option<oneshot::Receiver<()>>,
}

impl FileSyncHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn command(&self, cmd: FileCommand) -> Result<(), SyncError> {
        self.cmd_tx.send(cmd).map_err(|_| SyncError::ConnectionClosed)
    }

    pub fn insert(&self, position: usize, text: impl Into<String>) -> Result<(), SyncError> {
        self.command(FileCommand::Insert {
            position,
            text: text.into(),
        })
    }

    pub fn delete(&self, position: usize, length: usize) -> Result<(), SyncError> {
        self.command(FileCommand::Delete { position, length })
    }

    pub fn move_cursor(&self, position: usize) -> Result<(), SyncError> {
        self.command(FileCommand::MoveCursor(position))
    }

    pub fn acquire_line(&self, line: usize) -> Result<(), SyncError> {
        self.command(FileCommand::AcquireLine(line))
    }

    pub fn release_line(&self, line: usize) -> Result<(), SyncError> {
        self.command(FileCommand::ReleaseLine(line))
    }

    /// Current view of the document.
    pub fn view(&self) -> DocumentView {
        self.view.borrow().clone()
    }

    pub fn text(&self) -> String {
        self.view.borrow().text.clone()
    }

    /// Wait until the view satisfies `pred`.
    pub async fn wait_for(&mut self, pred: impl FnMut(&DocumentView) -> bool) -> Result<DocumentView, SyncError> {
        self.view
            .wait_for(pred)
            .await
            .map(|view| (*view).clone())
            .map_err(|_| SyncError::ConnectionClosed)
    }

    pub async fn next_event(&mut self) -> Option<FileEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<FileEvent> {
        self.events.try_recv().ok()
    }

    /// Close the file and wait for the actor to stop.
    pub async fn close(mut self) -> Result<(), SyncError> {
        self.command(FileCommand::Close)?;
        if let Some(closed) = self.closed.take() {
            let _ = closed.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_ids_are_distinct() {
        let a = ClientConfig::new("ws://localhost:1", "alice");
        let b = ClientConfig::new("ws://localhost:1", "alice");
        assert!(a.client_id.starts_with("alice-"));
        assert_ne!(a.client_id, b.client_id);
    }

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let mut client = SyncClient::new(ClientConfig::new("ws://127.0.0.1:1", "alice"));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        assert!(matches!(client.ping(), Err(SyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let mut client = SyncClient::new(ClientConfig::new("ws://127.0.0.1:1", "alice"));
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_requires_connection() {
        let client = SyncClient::new(ClientConfig::new("ws://127.0.0.1:1", "alice"));
        let result = client.open_document("alice", "proj", "a.txt").await;
        assert!(matches!(result, Err(SyncError::ConnectionClosed)));
    }
}
