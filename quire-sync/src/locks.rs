//! Per-file line locks.
//!
//! ```text
//!   Unlocked ──lock(u)──► LockedBy(u) ──unlock(u) / release_all(u)──► Unlocked
//!                           │   ▲
//!                           └───┘ lock(u) again: no-op
//! ```
//!
//! Locks are keyed by 1-based line number. When an accepted edit adds or
//! removes newlines, locks below the edit move with their text.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crate::error::SyncError;

#[derive(Debug, Default, Clone)]
pub struct LineLockTable {
    locks: BTreeMap<usize, String>,
}

impl LineLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `line` for `user`. Idempotent for the current owner.
    pub fn lock(&mut self, line: usize, user: &str) -> Result<(), SyncError> {
        match self.locks.get(&line) {
            Some(owner) if owner != user => Err(SyncError::LineLocked {
                line,
                owner: owner.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.locks.insert(line, user.to_string());
                Ok(())
            }
        }
    }

    /// Release `line` if `user` owns it. Returns whether a lock was released.
    pub fn unlock(&mut self, line: usize, user: &str) -> bool {
        if self.locks.get(&line).is_some_and(|owner| owner == user) {
            self.locks.remove(&line);
            return true;
        }
        false
    }

    /// Release every line held by `user`, in ascending order.
    pub fn release_all(&mut self, user: &str) -> Vec<usize> {
        let released = self.locks_held_by(user);
        for line in &released {
            self.locks.remove(line);
        }
        released
    }

    pub fn owner(&self, line: usize) -> Option<&str> {
        self.locks.get(&line).map(String::as_str)
    }

    pub fn locks_held_by(&self, user: &str) -> Vec<usize> {
        self.locks
            .iter()
            .filter(|(_, owner)| owner.as_str() == user)
            .map(|(line, _)| *line)
            .collect()
    }

    /// Fail with the first line in `lines` owned by someone other than `user`.
    pub fn check_range(&self, lines: RangeInclusive<usize>, user: &str) -> Result<(), SyncError> {
        match self.locks.range(lines).find(|(_, owner)| owner.as_str() != user) {
            Some((line, owner)) => Err(SyncError::LineLocked {
                line: *line,
                owner: owner.clone(),
            }),
            None => Ok(()),
        }
    }

    /// `count` new lines were opened right after `line`.
    pub fn lines_inserted(&mut self, line: usize, count: usize) {
        if count == 0 {
            return;
        }
        let moved = self.locks.split_off(&(line + 1));
        self.locks
            .extend(moved.into_iter().map(|(l, owner)| (l + count, owner)));
    }

    /// `count` lines following `line` were merged into it.
    ///
    /// Locks on the merged lines are dropped and returned.
    pub fn lines_removed(&mut self, line: usize, count: usize) -> Vec<(usize, String)> {
        if count == 0 {
            return Vec::new();
        }
        let mut tail = self.locks.split_off(&(line + 1));
        let below = tail.split_off(&(line + count + 1));
        self.locks
            .extend(below.into_iter().map(|(l, owner)| (l - count, owner)));
        tail.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
