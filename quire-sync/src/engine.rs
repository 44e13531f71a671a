//! Client-side optimistic replication for one open file.
//!
//! ```text
//!              local edit                 confirmation, queue empty
//!   ┌──────┐ ───────────► ┌──────┐ ─────────────────────────────► ┌──────┐
//!   │ Idle │              │ Sent │ ◄── confirmation, more queued  │ Idle │
//!   └──────┘ ◄─────────── └──────┘ ──┐                             └──────┘
//!       ▲                     ▲      │ gap, stale head, timeout
//!       │                     │      ▼
//!       │   history applied  ┌──────────┐
//!       └────────────────────┤ Rebasing │  local edits are buffered
//!                            └──────────┘
//! ```
//!
//! Text model, kept true after every call:
//!
//! ```text
//!   visible = confirmed ∘ pending ∘ buffered
//! ```
//!
//! `confirmed` is the server's text at `local_version`. `pending` holds
//! local ops the server has not confirmed yet; only the head may be in
//! flight. `buffered` holds edits typed while Rebasing, queued once the
//! rebase completes.
//!
//! The engine performs no I/O. Every entry point returns the
//! [`EngineOutput`]s the caller must act on.

use quire_core::{transform_sequences, OpIdGenerator, Operation};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::error::SyncError;
use crate::protocol::{Conflict, ConflictCode};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the head may stay unconfirmed before catch-up.
    pub op_timeout: Duration,
    /// Catch-up attempts for one head before a forced resync.
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            op_timeout: Duration::from_millis(200),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing pending
    Idle,
    /// Head of the queue is awaiting confirmation
    Sent,
    /// Waiting for history or a fresh copy; local edits are buffered
    Rebasing,
}

/// A local operation not yet confirmed by the server.
#[derive(Debug, Clone)]
pub struct PendingOp {
    /// `op.version` is the version the op expects the server to be at.
    pub op: Operation,
    /// Text removed when a delete was applied on top of its predecessors.
    pub deleted: Option<String>,
    pub sent: bool,
    sent_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// Submit to the server as an `EditOperation`.
    Send(Operation),
    /// Ask for every op after `from_version`.
    RequestHistory { from_version: u64 },
    /// History cannot bridge the gap; reopen the file.
    RequestResync,
    /// Remote changes applied to the visible text, in order.
    TextChanged(Vec<Operation>),
    /// The server accepted one of our ops.
    Confirmed { op_id: String, version: u64 },
    /// The server refused one of our ops; its effect has been undone.
    Rejected { op: Operation, error: SyncError },
    /// Visible text replaced wholesale; these local ops were lost.
    Reloaded { dropped: Vec<Operation> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    History,
    Resync,
}

pub struct SyncEngine {
    ids: OpIdGenerator,
    confirmed: String,
    visible: String,
    local_version: u64,
    pending: VecDeque<PendingOp>,
    buffered: Vec<Operation>,
    state: EngineState,
    recovery: Option<Recovery>,
    retries: u32,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(client_id: impl Into<String>, content: impl Into<String>, version: u64, config: EngineConfig) -> Self {
        let content = content.into();
        Self {
            ids: OpIdGenerator::new(client_id),
            visible: content.clone(),
            confirmed: content,
            local_version: version,
            pending: VecDeque::new(),
            buffered: Vec::new(),
            state: EngineState::Idle,
            recovery: None,
            retries: 0,
            config,
        }
    }

    /// Text the user sees.
    pub fn text(&self) -> &str {
        &self.visible
    }

    /// Server text at [`SyncEngine::local_version`].
    pub fn confirmed_text(&self) -> &str {
        &self.confirmed
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        self.ids.client_id()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOp> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// The op awaiting confirmation, if any.
    pub fn in_flight(&self) -> Option<&Operation> {
        self.pending.front().filter(|p| p.sent).map(|p| &p.op)
    }

    // ─── Local edits ──────────────────────────────────────────────────

    pub fn local_insert(&mut self, position: usize, text: &str) -> Result<Vec<EngineOutput>, SyncError> {
        let op = Operation::insert(position, text, self.next_expected_version(), self.ids.next_id());
        self.local_edit(op)
    }

    pub fn local_delete(&mut self, position: usize, length: usize) -> Result<Vec<EngineOutput>, SyncError> {
        let op = Operation::delete(position, length, self.next_expected_version(), self.ids.next_id());
        self.local_edit(op)
    }

    fn next_expected_version(&self) -> u64 {
        self.local_version + self.pending.len() as u64
    }

    fn local_edit(&mut self, op: Operation) -> Result<Vec<EngineOutput>, SyncError> {
        if op.is_noop() {
            return Ok(Vec::new());
        }
        let deleted = op.apply(&mut self.visible)?;

        if self.recovery.is_some() {
            self.buffered.push(op);
            return Ok(Vec::new());
        }
        self.pending.push_back(PendingOp {
            op,
            deleted,
            sent: false,
            sent_at: None,
        });
        let mut out = Vec::new();
        self.pump(&mut out);
        Ok(out)
    }

    // ─── Server input ─────────────────────────────────────────────────

    /// An `EditBroadcast`: either our head coming back or a foreign op.
    pub fn handle_broadcast(&mut self, op: &Operation, user: &str) -> Vec<EngineOutput> {
        if self.recovery.is_some() || op.version <= self.local_version {
            return Vec::new();
        }
        if op.version > self.local_version + 1 {
            log::debug!(
                "{}: gap at v{} (local v{}), catching up",
                self.client_id(),
                op.version,
                self.local_version
            );
            return self.begin_catch_up();
        }

        let head_matches = self
            .pending
            .front()
            .is_some_and(|head| head.sent && head.op.op_id == op.op_id);
        let result = if head_matches {
            self.confirm_head(op)
        } else {
            log::trace!("{}: foreign {} from {user}", self.client_id(), op.op_id);
            self.rebase_over_foreign(op)
        };
        self.recover_on_error(result)
    }

    fn confirm_head(&mut self, op: &Operation) -> Result<Vec<EngineOutput>, SyncError> {
        let mut out = Vec::new();
        let Some(head) = self.pending.pop_front() else {
            return Ok(out);
        };

        if same_effect(&head.op, op) {
            op.apply(&mut self.confirmed)?;
            self.local_version = op.version;
        } else {
            // The server applied something other than what we predicted:
            // undo our guess, then treat the server's op as foreign.
            let mismatch = SyncError::PredictionMismatch {
                op_id: op.op_id.clone(),
                expected: head.op.version + 1,
                actual: op.version,
            };
            log::warn!("{}: {mismatch}", self.client_id());
            let undo = head.op.inverse(head.deleted.as_deref())?;
            let rest: Vec<Operation> = self.pending.drain(..).map(|p| p.op).collect();
            let (rest, delta) = transform_sequences(&rest, &[undo, op.clone()]);
            op.apply(&mut self.confirmed)?;
            self.local_version = op.version;
            let shown = self.transform_buffered(delta);
            self.rebuild_queue(rest)?;
            if !shown.is_empty() {
                out.push(EngineOutput::TextChanged(shown));
            }
        }

        self.retries = 0;
        out.push(EngineOutput::Confirmed {
            op_id: op.op_id.clone(),
            version: op.version,
        });
        self.pump(&mut out);
        Ok(out)
    }

    fn rebase_over_foreign(&mut self, op: &Operation) -> Result<Vec<EngineOutput>, SyncError> {
        let queue: Vec<Operation> = self.pending.drain(..).map(|p| p.op).collect();
        let (queue, foreign) = transform_sequences(&queue, std::slice::from_ref(op));

        op.apply(&mut self.confirmed)?;
        self.local_version = op.version;
        let shown = self.transform_buffered(foreign);
        self.rebuild_queue(queue)?;

        let mut out = Vec::new();
        if !shown.is_empty() {
            out.push(EngineOutput::TextChanged(shown));
        }
        self.pump(&mut out);
        Ok(out)
    }

    /// A `ConflictError`. Only rejections of the current in-flight send
    /// matter; rejections of superseded sends are dropped.
    pub fn handle_conflict(&mut self, conflict: &Conflict) -> Vec<EngineOutput> {
        if conflict.error_code == ConflictCode::HistoryExhausted {
            return self.request_resync();
        }

        let is_head = self.pending.front().is_some_and(|head| {
            head.sent
                && conflict.op_id.as_deref() == Some(head.op.op_id.as_str())
                && conflict.version == Some(head.op.version)
        });
        if !is_head {
            log::trace!(
                "{}: ignoring {:?} for superseded {:?}",
                self.client_id(),
                conflict.error_code,
                conflict.op_id
            );
            return Vec::new();
        }

        match conflict.error_code {
            ConflictCode::StaleVersion => self.begin_catch_up(),
            ConflictCode::LineLocked | ConflictCode::Unauthorized => {
                let result = self.reject_head(conflict.to_error());
                self.recover_on_error(result)
            }
            ConflictCode::InvalidOperation | ConflictCode::HistoryExhausted => {
                log::warn!("{}: server refused head: {}", self.client_id(), conflict.message);
                self.request_resync()
            }
        }
    }

    /// Drop the head and take its effect back out of the visible text.
    fn reject_head(&mut self, error: SyncError) -> Result<Vec<EngineOutput>, SyncError> {
        let mut out = Vec::new();
        let Some(head) = self.pending.pop_front() else {
            return Ok(out);
        };
        let undo = head.op.inverse(head.deleted.as_deref())?;
        let rest: Vec<Operation> = self.pending.drain(..).map(|p| p.op).collect();
        let (rest, delta) = transform_sequences(&rest, &[undo]);

        let shown = self.transform_buffered(delta);
        self.rebuild_queue(rest)?;
        self.retries = 0;

        if !shown.is_empty() {
            out.push(EngineOutput::TextChanged(shown));
        }
        out.push(EngineOutput::Rejected { op: head.op, error });
        self.pump(&mut out);
        Ok(out)
    }

    // ─── Catch-up ─────────────────────────────────────────────────────

    /// Enter Rebasing and ask for the history after `local_version`.
    pub fn begin_catch_up(&mut self) -> Vec<EngineOutput> {
        if self.recovery.is_some() {
            return Vec::new();
        }
        self.recovery = Some(Recovery::History);
        self.settle();
        vec![EngineOutput::RequestHistory {
            from_version: self.local_version,
        }]
    }

    /// Apply server history and rebase the local queue through it.
    ///
    /// `history` is the server's ops after `local_version`, in order, each
    /// stamped with the version it produced. Entries at or below
    /// `local_version` are skipped.
    pub fn catch_up(&mut self, history: &[Operation]) -> Vec<EngineOutput> {
        let result = self.try_catch_up(history);
        self.recover_on_error(result)
    }

    fn try_catch_up(&mut self, history: &[Operation]) -> Result<Vec<EngineOutput>, SyncError> {
        let mut out = Vec::new();
        let mut shown = Vec::new();
        let mut text = self.confirmed.clone();
        let mut version = self.local_version;
        let mut queue: Vec<Operation> = self.pending.drain(..).map(|p| p.op).collect();

        // Each step moves the queue past one history op. Buffered edits sit
        // after the queue and only ever see what the server added.
        for op in history.iter().filter(|op| op.version > self.local_version) {
            if op.version != version + 1 {
                return Err(SyncError::InvalidOperation(format!(
                    "history jumps from v{version} to v{}",
                    op.version
                )));
            }

            let delta = if queue.first().is_some_and(|head| head.op_id == op.op_id) {
                let head = queue.remove(0);
                out.push(EngineOutput::Confirmed {
                    op_id: op.op_id.clone(),
                    version: op.version,
                });
                if same_effect(&head, op) {
                    Vec::new()
                } else {
                    let mut scratch = text.clone();
                    let deleted = head.apply(&mut scratch)?;
                    let head_undo = head.inverse(deleted.as_deref())?;
                    let (rest, delta) = transform_sequences(&queue, &[head_undo, op.clone()]);
                    queue = rest;
                    delta
                }
            } else {
                let (rest, delta) = transform_sequences(&queue, std::slice::from_ref(op));
                queue = rest;
                delta
            };
            shown.extend(self.transform_buffered(delta));

            op.apply(&mut text)?;
            version = op.version;
        }

        self.confirmed = text;
        self.local_version = version;
        queue.append(&mut self.buffered);
        self.rebuild_queue(queue)?;

        self.recovery = None;
        if out.iter().any(|o| matches!(o, EngineOutput::Confirmed { .. })) {
            self.retries = 0;
        }
        if !shown.is_empty() {
            out.insert(0, EngineOutput::TextChanged(shown));
        }
        self.pump(&mut out);
        Ok(out)
    }

    /// Replace everything with a fresh copy from the server.
    pub fn resync(&mut self, content: impl Into<String>, version: u64) -> Vec<EngineOutput> {
        let content = content.into();
        let mut dropped: Vec<Operation> = self.pending.drain(..).map(|p| p.op).collect();
        dropped.append(&mut self.buffered);
        if !dropped.is_empty() {
            log::warn!(
                "{}: reload at v{version} dropped {} unconfirmed ops",
                self.client_id(),
                dropped.len()
            );
        }

        self.visible = content.clone();
        self.confirmed = content;
        self.local_version = version;
        self.recovery = None;
        self.retries = 0;
        self.settle();
        vec![EngineOutput::Reloaded { dropped }]
    }

    fn request_resync(&mut self) -> Vec<EngineOutput> {
        if self.recovery == Some(Recovery::Resync) {
            return Vec::new();
        }
        self.recovery = Some(Recovery::Resync);
        self.settle();
        vec![EngineOutput::RequestResync]
    }

    /// Check the in-flight head against the timeout.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<EngineOutput> {
        if self.recovery.is_some() {
            return Vec::new();
        }
        let expired = self
            .pending
            .front()
            .and_then(|head| head.sent_at)
            .is_some_and(|at| now.saturating_duration_since(at) >= self.config.op_timeout);
        if !expired {
            return Vec::new();
        }

        self.retries += 1;
        if self.retries > self.config.max_retries {
            log::warn!("{}: no confirmation after {} attempts", self.client_id(), self.config.max_retries);
            return self.request_resync();
        }
        log::debug!("{}: head timed out, attempt {}", self.client_id(), self.retries);
        self.begin_catch_up()
    }

    // ─── Internals ────────────────────────────────────────────────────

    /// Move `buffered` past `delta` (ops on `confirmed ∘ pending`).
    /// Returns `delta` as it applies to the visible text.
    fn transform_buffered(&mut self, delta: Vec<Operation>) -> Vec<Operation> {
        if self.buffered.is_empty() {
            return delta;
        }
        let (buffered, shown) = transform_sequences(&self.buffered, &delta);
        self.buffered = buffered;
        shown
    }

    /// Install `ops` (based on `confirmed`) as the pending queue.
    ///
    /// Versions are renumbered from `local_version`, deleted texts are
    /// recaptured, ids made unique again after splits, and every send
    /// flag is cleared. `visible` is recomputed from scratch.
    fn rebuild_queue(&mut self, ops: Vec<Operation>) -> Result<(), SyncError> {
        let mut text = self.confirmed.clone();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::with_capacity(ops.len());

        for (i, mut op) in ops.into_iter().filter(|op| !op.is_noop()).enumerate() {
            if !seen.insert(op.op_id.clone()) {
                op.op_id = self.ids.next_id();
                seen.insert(op.op_id.clone());
            }
            op.version = self.local_version + i as u64;
            let deleted = op.apply(&mut text)?;
            pending.push_back(PendingOp {
                op,
                deleted,
                sent: false,
                sent_at: None,
            });
        }
        for op in &self.buffered {
            op.apply(&mut text)?;
        }

        self.pending = pending;
        self.visible = text;
        Ok(())
    }

    /// Send the head if nothing is in flight.
    fn pump(&mut self, out: &mut Vec<EngineOutput>) {
        if self.recovery.is_none() {
            if let Some(head) = self.pending.front_mut() {
                if !head.sent {
                    head.sent = true;
                    head.sent_at = Some(Instant::now());
                    out.push(EngineOutput::Send(head.op.clone()));
                }
            }
        }
        self.settle();
    }

    fn settle(&mut self) {
        self.state = if self.recovery.is_some() {
            EngineState::Rebasing
        } else if self.pending.front().is_some_and(|p| p.sent) {
            EngineState::Sent
        } else {
            EngineState::Idle
        };
    }

    fn recover_on_error(&mut self, result: Result<Vec<EngineOutput>, SyncError>) -> Vec<EngineOutput> {
        match result {
            Ok(out) => out,
            Err(e) => {
                log::error!("{}: local state diverged: {e}", self.client_id());
                self.recovery = None;
                self.request_resync()
            }
        }
    }
}

fn same_effect(a: &Operation, b: &Operation) -> bool {
    a.kind == b.kind && a.position == b.position
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(content: &str, version: u64) -> SyncEngine {
        SyncEngine::new("me", content, version, EngineConfig::for_testing())
    }

    fn sent(out: &[EngineOutput]) -> Vec<Operation> {
        out.iter()
            .filter_map(|o| match o {
                EngineOutput::Send(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn echo(op: &Operation) -> Operation {
        let mut confirmed = op.clone();
        confirmed.version = op.version + 1;
        confirmed
    }

    fn conflict(code: ConflictCode, op: &Operation) -> Conflict {
        Conflict {
            path: "f.txt".into(),
            error_code: code,
            line_number: Some(1),
            lock_owner: Some("bob".into()),
            requested_position: Some(op.position),
            op_id: Some(op.op_id.clone()),
            version: Some(op.version),
            message: "refused".into(),
        }
    }

    #[test]
    fn test_pipeline_depth_one() {
        let mut e = engine("hello", 3);
        let out = e.local_insert(5, "!").unwrap();
        let first = sent(&out);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].version, 3);
        assert_eq!(e.state(), EngineState::Sent);

        let out = e.local_insert(6, "?").unwrap();
        assert!(sent(&out).is_empty());
        assert_eq!(e.pending_len(), 2);
        assert_eq!(e.text(), "hello!?");

        let out = e.handle_broadcast(&echo(&first[0]), "me");
        assert!(out.contains(&EngineOutput::Confirmed { op_id: "me-1".into(), version: 4 }));
        let second = sent(&out);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].op_id, "me-2");
        assert_eq!(second[0].version, 4);
        assert_eq!(e.confirmed_text(), "hello!");

        e.handle_broadcast(&echo(&second[0]), "me");
        assert_eq!(e.state(), EngineState::Idle);
        assert_eq!(e.local_version(), 5);
        assert_eq!(e.confirmed_text(), "hello!?");
    }

    #[test]
    fn test_foreign_op_rebases_queue() {
        // B has an insert at 30 in flight at v5; A's "hi" at 20 lands first.
        let base = "0123456789".repeat(4);
        let mut e = engine(&base, 5);
        let ours = sent(&e.local_insert(30, "B").unwrap()).remove(0);

        let theirs = Operation::insert(20, "hi", 6, "alice-1");
        let out = e.handle_broadcast(&theirs, "alice");

        assert!(out.contains(&EngineOutput::TextChanged(vec![theirs.clone()])));
        let resent = sent(&out);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].op_id, ours.op_id);
        assert_eq!(resent[0].position, 32);
        assert_eq!(resent[0].version, 6);

        let mut expected = base.clone();
        theirs.apply(&mut expected).unwrap();
        resent[0].apply(&mut expected).unwrap();
        assert_eq!(e.text(), expected);
        assert_eq!(e.state(), EngineState::Sent);

        // the superseded v5 send gets rejected as stale: ignored
        assert!(e.handle_conflict(&conflict(ConflictCode::StaleVersion, &ours)).is_empty());
        assert_eq!(e.state(), EngineState::Sent);
    }

    #[test]
    fn test_catch_up_scenario() {
        let mut e = engine("abcdefghijklmnop", 10);
        e.local_insert(5, "X").unwrap();
        e.local_insert(8, "Y").unwrap();
        assert_eq!(e.text(), "abcdeXfgYhijklmnop");

        let out = e.begin_catch_up();
        assert_eq!(out, vec![EngineOutput::RequestHistory { from_version: 10 }]);
        assert_eq!(e.state(), EngineState::Rebasing);

        let history = vec![
            Operation::insert(0, "12", 11, "bob-1"),
            Operation::delete(12, 2, 12, "carol-1"),
        ];
        let out = e.catch_up(&history);

        assert_eq!(e.local_version(), 12);
        assert_eq!(e.confirmed_text(), "12abcdefghijmnop");
        assert_eq!(e.text(), "12abcdeXfgYhijmnop");

        let resent = sent(&out);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].position, 7);
        assert_eq!(resent[0].version, 12);
        let queued: Vec<(usize, u64)> = e.pending().map(|p| (p.op.position, p.op.version)).collect();
        assert_eq!(queued, vec![(7, 12), (10, 13)]);
    }

    #[test]
    fn test_catch_up_recognizes_own_ops() {
        let mut e = engine("abc", 0);
        let head = sent(&e.local_insert(3, "d").unwrap()).remove(0);
        e.local_insert(4, "e").unwrap();
        e.begin_catch_up();

        let out = e.catch_up(&[Operation::insert(0, "Z", 1, "zed-1"), {
            let mut own = head.clone();
            own.position = 4;
            own.version = 2;
            own
        }]);
        // server shifted our "d" past Z; nothing to redo for it
        assert!(out.contains(&EngineOutput::Confirmed { op_id: head.op_id.clone(), version: 2 }));
        assert_eq!(e.confirmed_text(), "Zabcd");
        assert_eq!(e.text(), "Zabcde");
        assert_eq!(e.pending_len(), 1);
        assert_eq!(e.pending().next().unwrap().op.position, 5);
    }

    #[test]
    fn test_line_locked_rejection_undoes_head() {
        let mut e = engine("line1\nline2\n", 0);
        let head = sent(&e.local_insert(6, "X").unwrap()).remove(0);
        e.local_insert(0, "A").unwrap();
        assert_eq!(e.text(), "Aline1\nXline2\n");

        let out = e.handle_conflict(&conflict(ConflictCode::LineLocked, &head));
        assert!(out.iter().any(|o| matches!(
            o,
            EngineOutput::Rejected { error: SyncError::LineLocked { line: 1, .. }, .. }
        )));
        assert_eq!(e.text(), "Aline1\nline2\n");

        let resent = sent(&out);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].position, 0);
        assert_eq!(resent[0].version, 0);
        assert_eq!(e.pending_len(), 1);
    }

    #[test]
    fn test_stale_head_triggers_catch_up() {
        let mut e = engine("abc", 4);
        let head = sent(&e.local_insert(0, "x").unwrap()).remove(0);
        let out = e.handle_conflict(&conflict(ConflictCode::StaleVersion, &head));
        assert_eq!(out, vec![EngineOutput::RequestHistory { from_version: 4 }]);
    }

    #[test]
    fn test_gap_triggers_catch_up_and_drops_broadcasts() {
        let mut e = engine("abc", 1);
        let out = e.handle_broadcast(&Operation::insert(0, "z", 3, "bob-2"), "bob");
        assert_eq!(out, vec![EngineOutput::RequestHistory { from_version: 1 }]);
        assert!(e.handle_broadcast(&Operation::insert(0, "y", 2, "bob-1"), "bob").is_empty());
        assert_eq!(e.text(), "abc");
    }

    #[test]
    fn test_edits_buffered_while_rebasing() {
        let mut e = engine("hello", 0);
        e.begin_catch_up();
        assert!(e.local_insert(5, " world").unwrap().is_empty());
        assert_eq!(e.buffered_len(), 1);
        assert_eq!(e.text(), "hello world");

        let out = e.catch_up(&[Operation::insert(0, ">> ", 1, "bob-1")]);
        assert_eq!(e.text(), ">> hello world");
        assert_eq!(e.buffered_len(), 0);
        let resent = sent(&out);
        assert_eq!(resent[0].position, 8);
        assert_eq!(resent[0].version, 1);
    }

    #[test]
    fn test_buffered_insert_inside_pending_text_keeps_its_place() {
        let mut e = engine("", 0);
        e.local_insert(0, "ab").unwrap();
        e.begin_catch_up();
        e.local_insert(1, "X").unwrap();
        assert_eq!(e.text(), "aXb");

        let out = e.catch_up(&[]);
        assert_eq!(e.text(), "aXb");
        assert!(!out.iter().any(|o| matches!(o, EngineOutput::TextChanged(_))));
        let queued: Vec<(usize, String)> = e
            .pending()
            .map(|p| (p.op.position, p.op.text().unwrap_or_default().to_string()))
            .collect();
        assert_eq!(queued, vec![(0, "ab".to_string()), (1, "X".to_string())]);
    }

    #[test]
    fn test_buffered_delete_of_pending_text_survives_catch_up() {
        let mut e = engine("", 0);
        e.local_insert(0, "ab").unwrap();
        e.begin_catch_up();
        e.local_delete(0, 2).unwrap();
        assert_eq!(e.text(), "");

        e.catch_up(&[]);
        assert_eq!(e.text(), "");
        assert_eq!(e.confirmed_text(), "");
        assert_eq!(e.pending_len(), 2);
    }

    #[test]
    fn test_buffered_edit_rebased_over_foreign_and_own_history() {
        let mut e = engine("12", 0);
        let head = sent(&e.local_insert(2, "ab").unwrap()).remove(0);
        e.begin_catch_up();
        e.local_insert(3, "X").unwrap();
        assert_eq!(e.text(), "12aXb");

        let mut own = head.clone();
        own.position = 3;
        own.version = 2;
        let foreign = Operation::insert(0, "Z", 1, "bob-1");
        let out = e.catch_up(&[foreign.clone(), own]);

        assert_eq!(out[0], EngineOutput::TextChanged(vec![foreign]));
        assert!(out.contains(&EngineOutput::Confirmed { op_id: head.op_id, version: 2 }));
        assert_eq!(e.confirmed_text(), "Z12ab");
        assert_eq!(e.text(), "Z12aXb");
        assert_eq!(e.local_version(), 2);

        let resent = sent(&out);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].position, 4);
        assert_eq!(resent[0].version, 2);
    }

    #[test]
    fn test_timeout_retries_then_resyncs() {
        let mut e = engine("abc", 0);
        let head = sent(&e.local_insert(0, "x").unwrap()).remove(0);
        let later = Instant::now() + Duration::from_secs(1);

        assert_eq!(e.poll_timeout(later), vec![EngineOutput::RequestHistory { from_version: 0 }]);
        // server never saw it: empty history, head resent
        let out = e.catch_up(&[]);
        assert_eq!(sent(&out), vec![head.clone()]);

        assert!(!e.poll_timeout(later + Duration::from_secs(1)).is_empty());
        e.catch_up(&[]);
        assert_eq!(e.poll_timeout(later + Duration::from_secs(2)), vec![EngineOutput::RequestResync]);

        let out = e.resync("server copy", 9);
        assert_eq!(out, vec![EngineOutput::Reloaded { dropped: vec![head] }]);
        assert_eq!(e.text(), "server copy");
        assert_eq!(e.state(), EngineState::Idle);
    }

    #[test]
    fn test_history_exhausted_requests_resync() {
        let mut e = engine("abc", 0);
        let head = sent(&e.local_insert(0, "x").unwrap()).remove(0);
        let out = e.handle_conflict(&conflict(ConflictCode::HistoryExhausted, &head));
        assert_eq!(out, vec![EngineOutput::RequestResync]);
        assert_eq!(e.state(), EngineState::Rebasing);
    }

    #[test]
    fn test_out_of_range_local_edit_rejected() {
        let mut e = engine("abc", 0);
        assert!(e.local_delete(2, 5).is_err());
        assert_eq!(e.text(), "abc");
        assert_eq!(e.pending_len(), 0);
    }
}
