//! Convergence checks for the transform functions.
//!
//! Every pair of operations that can be computed against a small base
//! text is transformed both ways, and both application orders must
//! produce the same text.

use quire_core::{transform, transform_sequences, Operation, Transformed};

const BASE: &str = "abcdefgh";

fn apply_all(base: &str, ops: &[Operation]) -> String {
    let mut text = base.to_string();
    for op in ops {
        op.apply(&mut text).unwrap();
    }
    text
}

/// All inserts and deletes that are valid against `BASE`.
fn candidate_ops(author: &str) -> Vec<Operation> {
    let len = BASE.chars().count();
    let mut ops = Vec::new();
    for position in 0..=len {
        ops.push(Operation::insert(position, format!("<{author}>"), 0, format!("{author}-1")));
        for length in 1..=(len - position) {
            ops.push(Operation::delete(position, length, 0, format!("{author}-1")));
        }
    }
    ops
}

#[test]
fn test_pairwise_convergence() {
    let alice_ops = candidate_ops("alice");
    let bob_ops = candidate_ops("bob");

    for a in &alice_ops {
        for b in &bob_ops {
            let after_a = apply_all(BASE, std::slice::from_ref(a));
            let after_b = apply_all(BASE, std::slice::from_ref(b));
            let left = apply_all(&after_a, &transform(b, a).into_vec());
            let right = apply_all(&after_b, &transform(a, b).into_vec());
            assert_eq!(left, right, "diverged for a={a:?} b={b:?}");
        }
    }
}

#[test]
fn test_same_position_inserts_order_by_op_id() {
    let alice = Operation::insert(4, "A", 0, "alice-1");
    let bob = Operation::insert(4, "B", 0, "bob-1");

    let alice_first = apply_all(&apply_all(BASE, &[alice.clone()]), &transform(&bob, &alice).into_vec());
    let bob_first = apply_all(&apply_all(BASE, &[bob.clone()]), &transform(&alice, &bob).into_vec());

    assert_eq!(alice_first, "abcdABefgh");
    assert_eq!(bob_first, "abcdABefgh");
}

#[test]
fn test_identical_delete_vanishes() {
    let first = Operation::delete(2, 3, 0, "alice-1");
    let second = Operation::delete(2, 3, 0, "bob-1");
    assert_eq!(transform(&second, &first), Transformed::Vanished);
}

#[test]
fn test_sequence_convergence() {
    let mine = vec![
        Operation::insert(1, "xy", 0, "alice-1"),
        Operation::delete(4, 3, 1, "alice-2"),
        Operation::insert(0, "!", 2, "alice-3"),
    ];
    let theirs = vec![
        Operation::delete(2, 4, 0, "bob-1"),
        Operation::insert(3, "Q", 1, "bob-2"),
    ];

    let (mine_after, theirs_after) = transform_sequences(&mine, &theirs);
    let left = apply_all(&apply_all(BASE, &theirs), &mine_after);
    let right = apply_all(&apply_all(BASE, &mine), &theirs_after);
    assert_eq!(left, right);
}
