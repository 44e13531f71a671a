//! Server-side document session: the authoritative sequencer for one file.
//!
//! Architecture:
//! ```text
//!  conn A ─┐  apply(op, user)   ┌────────────────────────────┐
//!  conn B ─┼──────────────────► │ RwLock<DocumentSession>     │
//!  conn C ─┘                    │  content, version           │
//!                               │  LineIndex, LineLockTable   │
//!                               │  history ring (≈1000 ops)   │
//!                               │  authorized users, OpLog    │
//!                               └─────────────┬──────────────┘
//!                                             │ EditBroadcast (still under
//!                                             ▼ the writer lock)
//!                               ┌────────────────────────────┐
//!                               │ BroadcastGroup              │──► A, B, C
//!                               └────────────────────────────┘
//! ```
//!
//! No transform runs here. An operation is accepted only if it was
//! computed against the current version; otherwise the client replays
//! history and resubmits. The originator receives its own broadcast as
//! the confirmation.

use quire_core::{LineIndex, OpKind, Operation};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, EncodedMessage, Subscriber};
use crate::directory::FileKey;
use crate::error::SyncError;
use crate::locks::LineLockTable;
use crate::protocol::{
    CursorUpdate, EditBroadcast, FileContent, LinesUnlocked, LockResult, ServerMessage, UserLeft,
};
use crate::storage::{OpLog, OpLogConfig, Snapshot};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Applied operations kept for replay. Default: 1000.
    pub history_capacity: usize,
    pub oplog: OpLogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            oplog: OpLogConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            history_capacity: 16,
            oplog: OpLogConfig::for_testing(),
        }
    }
}

/// An accepted operation, stamped with the version it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub user: String,
    pub op: Operation,
}

/// Outcome of a successful [`DocumentSession::apply_operation`].
#[derive(Debug, Clone)]
pub struct AppliedOp {
    pub entry: HistoryEntry,
    /// Text removed by a delete
    pub deleted: Option<String>,
    /// The op log reached its snapshot threshold
    pub snapshot_due: bool,
}

/// Content copied out for a snapshot, with the ops it covers.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub snapshot: Snapshot,
    pub ops: Vec<Operation>,
}

/// Authoritative state of one open file. Single writer at a time.
pub struct DocumentSession {
    key: FileKey,
    content: String,
    version: u64,
    lines: LineIndex,
    history: VecDeque<HistoryEntry>,
    locks: LineLockTable,
    authorized: HashSet<String>,
    oplog: OpLog,
    config: SessionConfig,
}

impl DocumentSession {
    pub fn new(key: FileKey, snapshot: Option<Snapshot>, config: SessionConfig) -> Self {
        let Snapshot { content, version } = snapshot.unwrap_or(Snapshot {
            content: String::new(),
            version: 0,
        });
        Self {
            key,
            lines: LineIndex::new(&content),
            content,
            version,
            history: VecDeque::with_capacity(config.history_capacity.min(1024)),
            locks: LineLockTable::new(),
            authorized: HashSet::new(),
            oplog: OpLog::new(config.oplog.clone()),
            config,
        }
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn locks(&self) -> &LineLockTable {
        &self.locks
    }

    pub fn line_count(&self) -> usize {
        self.lines.line_count()
    }

    /// 1-based line holding the char at `offset`.
    pub fn line_of(&mut self, offset: usize) -> usize {
        self.lines.refresh(&self.content);
        self.lines.line_of(offset)
    }

    /// Cache that `user` passed the access check for this session.
    pub fn authorize(&mut self, user: &str) {
        self.authorized.insert(user.to_string());
    }

    pub fn is_authorized(&self, user: &str) -> bool {
        self.authorized.contains(user)
    }

    /// Validate and apply one operation.
    ///
    /// Checks run in order: authorization, version, bounds, line locks.
    /// On success the content, line index, lock table, history and op log
    /// have all advanced together and the version has grown by exactly 1.
    pub fn apply_operation(&mut self, op: &Operation, user: &str) -> Result<AppliedOp, SyncError> {
        if !self.is_authorized(user) {
            return Err(SyncError::AuthorizationFailure {
                user: user.to_string(),
                resource: self.key.to_string(),
            });
        }
        if op.version != self.version {
            return Err(SyncError::StaleVersion {
                current: self.version,
                received: op.version,
            });
        }

        let len = self.content.chars().count();
        let end = op.end().ok_or_else(|| {
            SyncError::InvalidOperation(format!("{}: range at {} overflows", op.op_id, op.position))
        })?;
        if end > len || op.position > len {
            return Err(SyncError::InvalidOperation(format!(
                "{} touches [{}, {end}) but the document has {len} chars",
                op.op_id, op.position
            )));
        }

        self.lines.refresh(&self.content);
        let span = match &op.kind {
            OpKind::Insert { .. } => self.lines.lines_spanned(op.position, 0),
            OpKind::Delete { length } => self.lines.lines_spanned(op.position, *length),
        };
        self.locks.check_range(span.clone(), user)?;

        let first_line = *span.start();
        let deleted = op.apply(&mut self.content)?;
        match (&op.kind, &deleted) {
            (OpKind::Insert { text }, _) => {
                self.lines.apply_insert(op.position, text);
                self.locks.lines_inserted(first_line, count_newlines(text));
            }
            (OpKind::Delete { .. }, Some(removed)) => {
                self.lines.apply_delete(op.position, removed);
                let dropped = self.locks.lines_removed(first_line, count_newlines(removed));
                if !dropped.is_empty() {
                    log::debug!("{}: edit removed locked lines {dropped:?}", self.key);
                }
            }
            (OpKind::Delete { .. }, None) => self.lines.invalidate(),
        }

        self.version += 1;
        let mut stamped = op.clone();
        stamped.version = self.version;
        let entry = HistoryEntry {
            user: user.to_string(),
            op: stamped,
        };

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(entry.clone());
        let snapshot_due = self.oplog.append(entry.op.clone());

        log::trace!("{} v{}: {} by {user}", self.key, self.version, entry.op.op_id);
        Ok(AppliedOp {
            entry,
            deleted,
            snapshot_due,
        })
    }

    /// Ops that took the document from `from_version` to the current
    /// version, in order.
    pub fn history(&self, from_version: u64) -> Result<Vec<HistoryEntry>, SyncError> {
        if from_version > self.version {
            return Err(SyncError::StaleVersion {
                current: self.version,
                received: from_version,
            });
        }
        if from_version == self.version {
            return Ok(Vec::new());
        }

        let oldest = self.oldest_retained();
        match oldest {
            Some(oldest) if oldest <= from_version + 1 => {
                let skip = (from_version + 1 - oldest) as usize;
                Ok(self.history.iter().skip(skip).cloned().collect())
            }
            _ => Err(SyncError::HistoryExhausted {
                from_version,
                oldest_retained: oldest.unwrap_or(self.version + 1),
            }),
        }
    }

    /// Version produced by the oldest op still in the ring.
    pub fn oldest_retained(&self) -> Option<u64> {
        self.history.front().map(|entry| entry.op.version)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Move `user`'s lock to `line`, releasing any other line they held.
    ///
    /// Returns the released lines and whether the lock was granted.
    pub fn acquire_line(&mut self, line: usize, user: &str) -> (Vec<usize>, Result<(), SyncError>) {
        let released = self.release_other_lines(line, user);
        (released, self.locks.lock(line, user))
    }

    pub fn release_line(&mut self, line: usize, user: &str) -> bool {
        self.locks.unlock(line, user)
    }

    /// Release every lock `user` holds except the one on `keep`.
    pub fn release_other_lines(&mut self, keep: usize, user: &str) -> Vec<usize> {
        let others: Vec<usize> = self
            .locks
            .locks_held_by(user)
            .into_iter()
            .filter(|line| *line != keep)
            .collect();
        for line in &others {
            self.locks.unlock(*line, user);
        }
        others
    }

    pub fn release_all(&mut self, user: &str) -> Vec<usize> {
        self.locks.release_all(user)
    }

    /// Copy content and drain the op log. `None` if nothing is pending.
    pub fn take_flush(&mut self) -> Option<FlushBatch> {
        if self.oplog.is_empty() {
            return None;
        }
        Some(FlushBatch {
            snapshot: Snapshot {
                content: self.content.clone(),
                version: self.version,
            },
            ops: self.oplog.drain(),
        })
    }

    /// Put back the ops of a failed snapshot.
    pub fn requeue(&mut self, ops: Vec<Operation>) {
        self.oplog.requeue(ops);
    }

    pub fn mark_persisted(&mut self, count: usize) {
        self.oplog.mark_persisted(count);
    }

    pub fn pending_ops(&self) -> usize {
        self.oplog.len()
    }
}

fn count_newlines(text: &str) -> usize {
    text.chars().filter(|c| *c == '\n').count()
}

/// A session shared by every connection that has the file open.
pub struct SessionHandle {
    key: FileKey,
    state: RwLock<DocumentSession>,
    subscribers: BroadcastGroup,
    persisting: AtomicBool,
}

impl SessionHandle {
    pub fn new(key: FileKey, snapshot: Option<Snapshot>, config: SessionConfig) -> Self {
        Self {
            state: RwLock::new(DocumentSession::new(key.clone(), snapshot, config)),
            key,
            subscribers: BroadcastGroup::new(),
            persisting: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn subscribers(&self) -> &BroadcastGroup {
        &self.subscribers
    }

    /// Attach a connection and queue the current content to it.
    ///
    /// Runs under the writer lock, so the `FileContent` is queued before
    /// any broadcast of a later version.
    pub async fn attach(&self, subscriber: Subscriber) -> Result<FileContent, SyncError> {
        let mut state = self.state.write().await;
        state.authorize(&subscriber.user);
        let content = FileContent::new(self.key.path.clone(), state.content(), state.version());

        let encoded = EncodedMessage::encode(&ServerMessage::FileContent(content.clone()))?;
        subscriber
            .tx
            .send(encoded)
            .map_err(|_| SyncError::ConnectionClosed)?;
        log::info!(
            "{} joined {} at v{}",
            subscriber.user,
            self.key,
            state.version()
        );
        self.subscribers.add(subscriber).await;
        Ok(content)
    }

    /// Detach a connection. When it was the user's last one on this file,
    /// the others are told the user left.
    pub async fn detach(&self, conn_id: &Uuid) -> Option<Subscriber> {
        let _state = self.state.write().await;
        let removed = self.subscribers.remove(conn_id).await?;
        if !self.subscribers.users().await.contains(&removed.user) {
            let left = ServerMessage::UserLeft(UserLeft {
                path: self.key.path.clone(),
                user: removed.user.clone(),
            });
            if let Err(e) = self.subscribers.broadcast(&left).await {
                log::warn!("{}: departure of {} not announced: {e}", self.key, removed.user);
            }
            log::info!("{} left {}", removed.user, self.key);
        }
        Some(removed)
    }

    /// Apply and broadcast to every subscriber, originator included.
    pub async fn apply(&self, op: &Operation, user: &str) -> Result<AppliedOp, SyncError> {
        let mut state = self.state.write().await;
        let applied = state.apply_operation(op, user)?;
        let broadcast = ServerMessage::EditBroadcast(EditBroadcast {
            path: self.key.path.clone(),
            user: applied.entry.user.clone(),
            op: applied.entry.op.clone(),
        });
        self.subscribers.broadcast(&broadcast).await?;
        drop(state);
        Ok(applied)
    }

    pub async fn history(&self, from_version: u64) -> Result<Vec<HistoryEntry>, SyncError> {
        self.state.read().await.history(from_version)
    }

    pub async fn content(&self) -> (String, u64) {
        let state = self.state.read().await;
        (state.content().to_string(), state.version())
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version()
    }

    pub async fn lock_owner(&self, line: usize) -> Option<String> {
        self.state.read().await.locks().owner(line).map(str::to_string)
    }

    /// Lock `line` for `user`, answer `conn_id` and tell everyone else.
    pub async fn acquire_line(&self, line: usize, user: &str, conn_id: Uuid) -> Result<LockResult, SyncError> {
        let mut state = self.state.write().await;
        let (released, outcome) = state.acquire_line(line, user);
        self.announce_unlocked(released, user).await?;

        let result = LockResult {
            path: self.key.path.clone(),
            success: outcome.is_ok(),
            line_number: line,
            lock_owner: state.locks().owner(line).map(str::to_string),
        };
        let msg = ServerMessage::LineLockResult(result.clone());
        self.subscribers.send_to(&conn_id, &msg).await?;
        if result.success {
            self.subscribers.broadcast_except(&msg, conn_id).await?;
        }
        Ok(result)
    }

    pub async fn release_line(&self, line: usize, user: &str) -> Result<bool, SyncError> {
        let mut state = self.state.write().await;
        let released = state.release_line(line, user);
        if released {
            self.announce_unlocked(vec![line], user).await?;
        }
        Ok(released)
    }

    /// Release every lock `user` holds and broadcast the unlock notice.
    pub async fn release_all(&self, user: &str) -> Result<Vec<usize>, SyncError> {
        let mut state = self.state.write().await;
        let released = state.release_all(user);
        self.announce_unlocked(released.clone(), user).await?;
        Ok(released)
    }

    /// Relay a caret move to the other subscribers. Locks the user holds
    /// on lines other than the caret's line are released.
    pub async fn move_cursor(&self, update: CursorUpdate, conn_id: Uuid) -> Result<Vec<usize>, SyncError> {
        let mut state = self.state.write().await;
        let line = state.line_of(update.cursor_position);
        let released = state.release_other_lines(line, &update.user);
        self.announce_unlocked(released.clone(), &update.user).await?;
        self.subscribers
            .broadcast_except(&ServerMessage::CursorBroadcast(update), conn_id)
            .await?;
        Ok(released)
    }

    async fn announce_unlocked(&self, lines: Vec<usize>, user: &str) -> Result<(), SyncError> {
        if lines.is_empty() {
            return Ok(());
        }
        let msg = ServerMessage::LineUnlocked(LinesUnlocked {
            path: self.key.path.clone(),
            line_numbers: lines,
            user: user.to_string(),
        });
        self.subscribers.broadcast(&msg).await?;
        Ok(())
    }

    // ─── Persistence hooks ────────────────────────────────────────────

    /// Claim the single snapshot slot. False if a write is in flight.
    pub fn begin_persist(&self) -> bool {
        !self.persisting.swap(true, Ordering::SeqCst)
    }

    pub fn end_persist(&self) {
        self.persisting.store(false, Ordering::SeqCst);
    }

    pub fn is_persisting(&self) -> bool {
        self.persisting.load(Ordering::SeqCst)
    }

    pub async fn take_flush(&self) -> Option<FlushBatch> {
        self.state.write().await.take_flush()
    }

    pub async fn requeue(&self, ops: Vec<Operation>) {
        self.state.write().await.requeue(ops);
    }

    pub async fn mark_persisted(&self, count: usize) {
        self.state.write().await.mark_persisted(count);
    }

    /// Subscribers attached right now.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.len().await
    }

    /// Unpersisted ops plus an in-flight snapshot, if any.
    pub async fn pending_work(&self) -> usize {
        self.state.read().await.pending_ops() + usize::from(self.is_persisting())
    }
}
