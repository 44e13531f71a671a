//! Operational transform for concurrent text edits.
//!
//! `transform(my, other)` answers: given that `other` has already been
//! applied to the state `my` was computed against, what must `my` become
//! so that it still does what its author meant?
//!
//! ```text
//!            base
//!           /    \
//!        my        other
//!         \        /
//!  T(other,my)  T(my,other)
//!           \  /
//!         converged
//! ```
//!
//! Concurrent inserts at the same position are ordered by lexicographic
//! `op_id`: the smaller id lands first on every replica.
//!
//! A delete whose range strictly contains a concurrent insert cannot be
//! expressed as one contiguous delete afterwards, so it is split into two
//! sequential deletes that step around the inserted text.

use crate::op::{OpKind, Operation};

/// Result of transforming one operation past another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// The effect was already achieved by the other operation.
    Vanished,
    One(Operation),
    /// Two operations to apply in order.
    Split(Operation, Operation),
}

impl Transformed {
    pub fn into_vec(self) -> Vec<Operation> {
        match self {
            Transformed::Vanished => Vec::new(),
            Transformed::One(op) => vec![op],
            Transformed::Split(first, second) => vec![first, second],
        }
    }

    pub fn is_vanished(&self) -> bool {
        matches!(self, Transformed::Vanished)
    }
}

/// Transform `my` so it applies after `other`. Both must share a base.
pub fn transform(my: &Operation, other: &Operation) -> Transformed {
    let cursor_after = my
        .cursor_after
        .map(|cursor| transform_position(cursor, &my.op_id, other));

    match (&my.kind, &other.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { text: theirs }) => {
            let mut op = my.clone();
            let goes_first = my.position < other.position
                || (my.position == other.position && my.op_id < other.op_id);
            if !goes_first {
                op.position += theirs.chars().count();
            }
            op.cursor_after = cursor_after;
            Transformed::One(op)
        }

        (OpKind::Insert { .. }, OpKind::Delete { length }) => {
            let mut op = my.clone();
            if my.position > other.position {
                op.position -= (my.position - other.position).min(*length);
            }
            op.cursor_after = cursor_after;
            Transformed::One(op)
        }

        (OpKind::Delete { length }, OpKind::Insert { text: theirs }) => {
            let inserted = theirs.chars().count();
            if my.position >= other.position {
                let mut op = my.clone();
                op.position += inserted;
                op.cursor_after = cursor_after;
                return Transformed::One(op);
            }
            if other.position < my.position.saturating_add(*length) {
                // Delete the part before the insert, then the part after it.
                let head = other.position - my.position;
                let mut first = my.clone();
                first.kind = OpKind::Delete { length: head };
                first.cursor_after = None;

                let mut second = my.clone();
                second.kind = OpKind::Delete { length: length - head };
                second.position = my.position + inserted;
                second.cursor_after = cursor_after;
                return Transformed::Split(first, second);
            }
            let mut op = my.clone();
            op.cursor_after = cursor_after;
            Transformed::One(op)
        }

        (OpKind::Delete { length }, OpKind::Delete { length: their_length }) => {
            let my_end = my.position.saturating_add(*length);
            let their_end = other.position.saturating_add(*their_length);
            let overlap = my_end
                .min(their_end)
                .saturating_sub(my.position.max(other.position));

            let remaining = length - overlap;
            if remaining == 0 {
                return Transformed::Vanished;
            }

            let mut op = my.clone();
            op.kind = OpKind::Delete { length: remaining };
            if other.position < my.position {
                op.position -= (my.position - other.position).min(*their_length);
            }
            op.cursor_after = cursor_after;
            Transformed::One(op)
        }
    }
}

/// Shift a caret at `position`, owned by the author of `op_id`, past
/// `other`.
///
/// A caret sitting exactly where a concurrent insert lands follows the
/// same tie-break as an insert at that position.
pub fn transform_position(position: usize, op_id: &str, other: &Operation) -> usize {
    match &other.kind {
        OpKind::Insert { text } => {
            if position < other.position || (position == other.position && op_id < other.op_id.as_str()) {
                position
            } else {
                position + text.chars().count()
            }
        }
        OpKind::Delete { length } => {
            if position > other.position {
                position - (position - other.position).min(*length)
            } else {
                position
            }
        }
    }
}

/// Transform two operation sequences computed from the same base.
///
/// Returns `(mine', theirs')` where `mine'` applies after all of `theirs`
/// and `theirs'` applies after all of `mine`. Both sequences are walked
/// strictly in order.
pub fn transform_sequences(mine: &[Operation], theirs: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    match (mine.len(), theirs.len()) {
        (0, _) => (Vec::new(), theirs.to_vec()),
        (_, 0) => (mine.to_vec(), Vec::new()),
        (1, 1) => (
            transform(&mine[0], &theirs[0]).into_vec(),
            transform(&theirs[0], &mine[0]).into_vec(),
        ),
        (1, _) => {
            let (mine_after_head, theirs_head) = transform_sequences(mine, &theirs[..1]);
            let (mine_after_all, theirs_tail) = transform_sequences(&mine_after_head, &theirs[1..]);
            let mut theirs_out = theirs_head;
            theirs_out.extend(theirs_tail);
            (mine_after_all, theirs_out)
        }
        _ => {
            let (mine_head, theirs_after_head) = transform_sequences(&mine[..1], theirs);
            let (mine_tail, theirs_after_all) = transform_sequences(&mine[1..], &theirs_after_head);
            let mut mine_out = mine_head;
            mine_out.extend(mine_tail);
            (mine_out, theirs_after_all)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(base: &str, ops: &[Operation]) -> String {
        let mut text = base.to_string();
        for op in ops {
            op.apply(&mut text).unwrap();
        }
        text
    }

    fn converge(base: &str, a: &Operation, b: &Operation) -> (String, String) {
        let left = apply_all(&apply_all(base, std::slice::from_ref(a)), &transform(b, a).into_vec());
        let right = apply_all(&apply_all(base, std::slice::from_ref(b)), &transform(a, b).into_vec());
        (left, right)
    }

    #[test]
    fn test_insert_insert_before() {
        let my = Operation::insert(2, "x", 0, "a-1");
        let other = Operation::insert(5, "yyy", 0, "b-1");
        assert_eq!(transform(&my, &other), Transformed::One(my.clone()));
    }

    #[test]
    fn test_insert_insert_tie_break() {
        let alice = Operation::insert(3, "A", 0, "alice-1");
        let bob = Operation::insert(3, "B", 0, "bob-1");

        match transform(&alice, &bob) {
            Transformed::One(op) => assert_eq!(op.position, 3),
            other => panic!("unexpected {other:?}"),
        }
        match transform(&bob, &alice) {
            Transformed::One(op) => assert_eq!(op.position, 4),
            other => panic!("unexpected {other:?}"),
        }

        let (left, right) = converge("abcdef", &alice, &bob);
        assert_eq!(left, "abcABdef");
        assert_eq!(left, right);
    }

    #[test]
    fn test_insert_after_delete_shifts_left() {
        let my = Operation::insert(10, "x", 0, "a-1");
        let other = Operation::delete(2, 3, 0, "b-1");
        match transform(&my, &other) {
            Transformed::One(op) => assert_eq!(op.position, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_insert_inside_deleted_range_collapses_to_start() {
        let my = Operation::insert(4, "x", 0, "a-1");
        let other = Operation::delete(2, 5, 0, "b-1");
        match transform(&my, &other) {
            Transformed::One(op) => assert_eq!(op.position, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delete_after_insert_shifts_right() {
        let my = Operation::delete(5, 2, 0, "a-1");
        let other = Operation::insert(5, "abc", 0, "b-1");
        match transform(&my, &other) {
            Transformed::One(op) => assert_eq!(op.position, 8),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delete_spanning_insert_splits() {
        let base = "abcdef";
        let del = Operation::delete(1, 4, 0, "a-1");
        let ins = Operation::insert(3, "X", 0, "b-1");

        assert!(matches!(transform(&del, &ins), Transformed::Split(_, _)));
        let (left, right) = converge(base, &del, &ins);
        assert_eq!(left, "aXf");
        assert_eq!(left, right);
    }

    #[test]
    fn test_identical_deletes_vanish() {
        let a = Operation::delete(4, 3, 0, "a-1");
        let b = Operation::delete(4, 3, 0, "b-1");
        assert!(transform(&a, &b).is_vanished());
        assert!(transform(&b, &a).is_vanished());
    }

    #[test]
    fn test_overlapping_deletes_shrink() {
        // my deletes [2,6), other deletes [4,9)
        let my = Operation::delete(2, 4, 0, "a-1");
        let other = Operation::delete(4, 5, 0, "b-1");
        match transform(&my, &other) {
            Transformed::One(op) => {
                assert_eq!(op.position, 2);
                assert_eq!(op.kind, OpKind::Delete { length: 2 });
            }
            other => panic!("unexpected {other:?}"),
        }
        match transform(&other, &my) {
            Transformed::One(op) => {
                assert_eq!(op.position, 2);
                assert_eq!(op.kind, OpKind::Delete { length: 3 });
            }
            other => panic!("unexpected {other:?}"),
        }
        let (left, right) = converge("0123456789", &my, &other);
        assert_eq!(left, "019");
        assert_eq!(left, right);
    }

    #[test]
    fn test_cursor_after_follows_position_rules() {
        let my = Operation::insert(10, "x", 0, "a-1");
        let other = Operation::insert(0, "hey", 0, "b-1");
        match transform(&my, &other) {
            Transformed::One(op) => assert_eq!(op.cursor_after, Some(14)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sequence_transform_converges() {
        let base = "hello world";
        let mine = vec![
            Operation::insert(5, ",", 0, "a-1"),
            Operation::delete(7, 5, 1, "a-2"),
        ];
        let theirs = vec![
            Operation::insert(0, ">> ", 0, "b-1"),
            Operation::insert(14, "!", 1, "b-2"),
        ];
        let (mine2, theirs2) = transform_sequences(&mine, &theirs);

        let left = apply_all(&apply_all(base, &theirs), &mine2);
        let right = apply_all(&apply_all(base, &mine), &theirs2);
        assert_eq!(left, right);
        assert_eq!(left, ">> hello, !");
    }

    #[test]
    fn test_sequence_transform_empty_sides() {
        let ops = vec![Operation::insert(0, "x", 0, "a-1")];
        assert_eq!(transform_sequences(&ops, &[]), (ops.clone(), Vec::new()));
        assert_eq!(transform_sequences(&[], &ops), (Vec::new(), ops.clone()));
    }
}
