//! In-memory log of applied operations not yet covered by a snapshot.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    OpLog                     │
//! │                                              │
//! │  Buffer: [ op v41 | op v42 | ... | op v48 ]  │
//! │                                              │
//! │  Snapshot when:                              │
//! │    1. snapshot_every ops are buffered        │
//! │    2. the last subscriber detaches           │
//! │    3. the directory sweep finds pending ops  │
//! │                                              │
//! │  Failed snapshot: drained ops go back to the │
//! │  front, ahead of anything appended since.    │
//! └──────────────────────────────────────────────┘
//! ```

use quire_core::Operation;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct OpLogConfig {
    /// Buffered ops that trigger a snapshot. Default: 64.
    pub snapshot_every: usize,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self { snapshot_every: 64 }
    }
}

impl OpLogConfig {
    pub fn for_testing() -> Self {
        Self { snapshot_every: 4 }
    }
}

#[derive(Debug)]
pub struct OpLog {
    config: OpLogConfig,
    buffer: VecDeque<Operation>,
    total_appended: u64,
    total_persisted: u64,
    requeued: u64,
}

impl OpLog {
    pub fn new(config: OpLogConfig) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            total_appended: 0,
            total_persisted: 0,
            requeued: 0,
        }
    }

    /// Record an applied operation. Returns whether a snapshot is due.
    pub fn append(&mut self, op: Operation) -> bool {
        self.buffer.push_back(op);
        self.total_appended += 1;
        self.needs_flush()
    }

    pub fn needs_flush(&self) -> bool {
        self.buffer.len() >= self.config.snapshot_every
    }

    /// Take everything buffered. The caller owns it until the snapshot
    /// lands, and must [`OpLog::requeue`] it if the write fails.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.buffer.drain(..).collect()
    }

    /// Put back ops from a failed snapshot, ahead of newer entries.
    pub fn requeue(&mut self, ops: Vec<Operation>) {
        self.requeued += ops.len() as u64;
        for op in ops.into_iter().rev() {
            self.buffer.push_front(op);
        }
    }

    /// Count ops confirmed durable by a successful snapshot.
    pub fn mark_persisted(&mut self, count: usize) {
        self.total_persisted += count as u64;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn total_persisted(&self) -> u64 {
        self.total_persisted
    }

    pub fn total_requeued(&self) -> u64 {
        self.requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(version: u64) -> Operation {
        Operation::insert(0, "x", version, format!("a-{version}"))
    }

    #[test]
    fn test_flush_threshold() {
        let mut log = OpLog::new(OpLogConfig::for_testing());
        assert!(!log.append(op(1)));
        assert!(!log.append(op(2)));
        assert!(!log.append(op(3)));
        assert!(log.append(op(4)));
        assert_eq!(log.drain().len(), 4);
        assert!(log.is_empty());
        assert!(!log.needs_flush());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let mut log = OpLog::new(OpLogConfig::default());
        log.append(op(1));
        log.append(op(2));
        let drained = log.drain();
        log.append(op(3));
        log.requeue(drained);

        let versions: Vec<u64> = log.drain().iter().map(|o| o.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(log.total_requeued(), 2);
        assert_eq!(log.total_appended(), 3);
    }

    #[test]
    fn test_mark_persisted() {
        let mut log = OpLog::new(OpLogConfig::default());
        log.append(op(1));
        let drained = log.drain();
        log.mark_persisted(drained.len());
        assert_eq!(log.total_persisted(), 1);
    }
}
