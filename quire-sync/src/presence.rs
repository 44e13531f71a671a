//! Client-side awareness of other users: carets and held line locks.
//!
//! ```text
//! CursorBroadcast ──► RemoteCursors::update()
//! EditBroadcast   ──► RemoteCursors::shift()      (carets follow the text)
//! LineLockResult  ──► RemoteCursors::line_locked()
//! LineUnlocked    ──► RemoteCursors::lines_unlocked()
//!
//! local caret move ──► CursorThrottle::offer()  (≤ 30 per second)
//! ```

use quire_core::{transform_position, Operation};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Minimum spacing between outgoing caret updates.
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub user: String,
    /// Char offset in the locally visible text.
    pub position: usize,
    last_update: Instant,
}

impl RemoteCursor {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Carets and lock holders of everyone else in one file.
#[derive(Debug)]
pub struct RemoteCursors {
    local_user: String,
    cursors: HashMap<String, RemoteCursor>,
    /// line → owner, as last announced by the server
    locked_lines: BTreeMap<usize, String>,
    idle_timeout: Duration,
}

impl RemoteCursors {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            cursors: HashMap::new(),
            locked_lines: BTreeMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Record a caret update. Our own echoes are ignored.
    pub fn update(&mut self, user: &str, position: usize) -> bool {
        if user == self.local_user {
            return false;
        }
        self.cursors.insert(
            user.to_string(),
            RemoteCursor {
                user: user.to_string(),
                position,
                last_update: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, user: &str) -> Option<RemoteCursor> {
        self.locked_lines.retain(|_, owner| owner != user);
        self.cursors.remove(user)
    }

    /// Move every caret past a change to the visible text.
    pub fn shift(&mut self, op: &Operation) {
        for cursor in self.cursors.values_mut() {
            // A caret sitting exactly at an insert stays in front of it
            // unless the insert is the caret owner's own.
            let own = op
                .op_id
                .strip_prefix(cursor.user.as_str())
                .is_some_and(|rest| rest.starts_with('-'));
            let tie = if own { "\u{10FFFF}" } else { "" };
            cursor.position = transform_position(cursor.position, tie, op);
        }
    }

    pub fn get(&self, user: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user)
    }

    /// Carets sorted by position, then user.
    pub fn list(&self) -> Vec<(String, usize)> {
        let mut list: Vec<(String, usize)> = self
            .cursors
            .values()
            .map(|c| (c.user.clone(), c.position))
            .collect();
        list.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        list
    }

    pub fn line_locked(&mut self, line: usize, owner: &str) {
        self.locked_lines.insert(line, owner.to_string());
    }

    pub fn lines_unlocked(&mut self, lines: &[usize]) {
        for line in lines {
            self.locked_lines.remove(line);
        }
    }

    pub fn lock_owner(&self, line: usize) -> Option<&str> {
        self.locked_lines.get(&line).map(String::as_str)
    }

    /// Drop carets that have not moved within the idle timeout.
    pub fn prune_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let idle: Vec<String> = self
            .cursors
            .values()
            .filter(|c| c.is_idle(timeout))
            .map(|c| c.user.clone())
            .collect();
        for user in &idle {
            self.cursors.remove(user);
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Rate limiter for outgoing caret updates.
#[derive(Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<usize>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_BROADCAST_INTERVAL)
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer a caret position at `now`. Returns the position to send, or
    /// `None` if it was held back for [`CursorThrottle::flush`].
    pub fn offer(&mut self, position: usize, now: Instant) -> Option<usize> {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = Some(position);
                None
            }
            _ => {
                self.last_sent = Some(now);
                self.pending = None;
                Some(position)
            }
        }
    }

    /// Release a held-back position once the interval has passed.
    pub fn flush(&mut self, now: Instant) -> Option<usize> {
        let position = self.pending?;
        self.offer(position, now)
    }
}
