//! Text operations: insert and delete at a character offset.
//!
//! Offsets and lengths count Unicode scalar values, never bytes, so a
//! position computed by one replica means the same thing on every other.
//!
//! Wire shape (JSON, camelCase):
//! ```text
//! {"type":"insert","text":"hi","position":20,"cursorAfter":22,"version":5,"opId":"alice-3"}
//! {"type":"delete","length":4,"position":7,"version":9,"opId":"bob-12"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an operation cannot be applied to a text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("position {position} is past the end of the text ({len} chars)")]
    OutOfBounds { position: usize, len: usize },
    #[error("delete of {length} chars at {position} runs past the end of the text ({len} chars)")]
    RangeOutOfBounds { position: usize, length: usize, len: usize },
    #[error("cannot invert delete {op_id}: the deleted text was not captured")]
    MissingDeletedText { op_id: String },
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpKind {
    Insert { text: String },
    Delete { length: usize },
}

/// A single edit, stamped with the version it was computed against.
///
/// Server-issued operations (broadcasts and history) carry the version
/// they produced instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OpKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<usize>,
    pub version: u64,
    pub op_id: String,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, version: u64, op_id: impl Into<String>) -> Self {
        let text = text.into();
        let cursor_after = Some(position + text.chars().count());
        Self {
            kind: OpKind::Insert { text },
            position,
            cursor_after,
            version,
            op_id: op_id.into(),
        }
    }

    pub fn delete(position: usize, length: usize, version: u64, op_id: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete { length },
            position,
            cursor_after: Some(position),
            version,
            op_id: op_id.into(),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Inserted text, `None` for deletes.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Insert { text } => Some(text),
            OpKind::Delete { .. } => None,
        }
    }

    /// Number of characters inserted or deleted.
    pub fn len_chars(&self) -> usize {
        match &self.kind {
            OpKind::Insert { text } => text.chars().count(),
            OpKind::Delete { length } => *length,
        }
    }

    /// True for empty inserts and zero-length deletes.
    pub fn is_noop(&self) -> bool {
        self.len_chars() == 0
    }

    /// Apply this operation to `text` in place.
    ///
    /// For a delete, returns the exact substring that was removed. On
    /// error the text is left untouched.
    pub fn apply(&self, text: &mut String) -> Result<Option<String>, OpError> {
        let len = text.chars().count();
        let start = byte_offset(text, self.position).ok_or(OpError::OutOfBounds {
            position: self.position,
            len,
        })?;

        match &self.kind {
            OpKind::Insert { text: inserted } => {
                text.insert_str(start, inserted);
                Ok(None)
            }
            OpKind::Delete { length } => {
                let end = byte_offset(&text[start..], *length)
                    .map(|rel| start + rel)
                    .ok_or(OpError::RangeOutOfBounds {
                        position: self.position,
                        length: *length,
                        len,
                    })?;
                Ok(Some(text.drain(start..end).collect()))
            }
        }
    }

    /// The operation that undoes this one.
    ///
    /// Inverting a delete needs the text it removed, as returned by
    /// [`Operation::apply`].
    pub fn inverse(&self, deleted: Option<&str>) -> Result<Operation, OpError> {
        let kind = match &self.kind {
            OpKind::Insert { text } => OpKind::Delete {
                length: text.chars().count(),
            },
            OpKind::Delete { .. } => {
                let text = deleted.ok_or_else(|| OpError::MissingDeletedText {
                    op_id: self.op_id.clone(),
                })?;
                OpKind::Insert { text: text.to_string() }
            }
        };
        Ok(Operation {
            kind,
            position: self.position,
            cursor_after: Some(self.position),
            version: self.version,
            op_id: self.op_id.clone(),
        })
    }

    /// End of the affected range in the pre-operation text, or `None`
    /// when `position + length` does not fit in a `usize`.
    pub fn end(&self) -> Option<usize> {
        match &self.kind {
            OpKind::Insert { .. } => Some(self.position),
            OpKind::Delete { length } => self.position.checked_add(*length),
        }
    }
}

/// Byte offset of the `chars`-th character, or `text.len()` when `chars`
/// is exactly the character count.
pub(crate) fn byte_offset(text: &str, chars: usize) -> Option<usize> {
    if chars == 0 {
        return Some(0);
    }
    let mut seen = 0;
    for (byte, _) in text.char_indices() {
        if seen == chars {
            return Some(byte);
        }
        seen += 1;
    }
    (seen == chars).then_some(text.len())
}

/// Issues `clientIdentity-counter` operation ids.
#[derive(Debug, Clone)]
pub struct OpIdGenerator {
    client_id: String,
    counter: u64,
}

impl OpIdGenerator {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.client_id, self.counter)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_apply() {
        let mut text = String::from("hello world");
        let op = Operation::insert(5, ",", 0, "a-1");
        assert_eq!(op.apply(&mut text).unwrap(), None);
        assert_eq!(text, "hello, world");
        assert_eq!(op.cursor_after, Some(6));
    }

    #[test]
    fn test_delete_returns_removed_text() {
        let mut text = String::from("hello world");
        let op = Operation::delete(5, 6, 0, "a-1");
        assert_eq!(op.apply(&mut text).unwrap().as_deref(), Some(" world"));
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_offsets_are_chars_not_bytes() {
        let mut text = String::from("héllo");
        Operation::insert(2, "X", 0, "a-1").apply(&mut text).unwrap();
        assert_eq!(text, "héXllo");
        let removed = Operation::delete(0, 2, 0, "a-2").apply(&mut text).unwrap();
        assert_eq!(removed.as_deref(), Some("hé"));
        assert_eq!(text, "Xllo");
    }

    #[test]
    fn test_insert_at_end() {
        let mut text = String::from("abc");
        Operation::insert(3, "d", 0, "a-1").apply(&mut text).unwrap();
        assert_eq!(text, "abcd");
    }

    #[test]
    fn test_out_of_bounds_leaves_text_untouched() {
        let mut text = String::from("abc");
        let err = Operation::insert(4, "x", 0, "a-1").apply(&mut text).unwrap_err();
        assert_eq!(err, OpError::OutOfBounds { position: 4, len: 3 });

        let err = Operation::delete(2, 5, 0, "a-2").apply(&mut text).unwrap_err();
        assert!(matches!(err, OpError::RangeOutOfBounds { .. }));
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_end_of_huge_delete_is_none() {
        assert_eq!(Operation::delete(3, 4, 0, "a-1").end(), Some(7));
        assert_eq!(Operation::insert(3, "xy", 0, "a-2").end(), Some(3));
        assert_eq!(Operation::delete(1, usize::MAX, 0, "a-3").end(), None);

        let mut text = String::from("abc");
        let err = Operation::delete(1, usize::MAX, 0, "a-3").apply(&mut text).unwrap_err();
        assert!(matches!(err, OpError::RangeOutOfBounds { .. }));
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_inverse_restores_text() {
        let original = String::from("the quick fox");
        let mut text = original.clone();

        let del = Operation::delete(4, 6, 3, "a-1");
        let removed = del.apply(&mut text).unwrap();
        del.inverse(removed.as_deref()).unwrap().apply(&mut text).unwrap();
        assert_eq!(text, original);

        let ins = Operation::insert(3, " very", 3, "a-2");
        ins.apply(&mut text).unwrap();
        ins.inverse(None).unwrap().apply(&mut text).unwrap();
        assert_eq!(text, original);
    }

    #[test]
    fn test_inverse_of_delete_requires_text() {
        let del = Operation::delete(0, 1, 0, "a-1");
        assert!(matches!(del.inverse(None), Err(OpError::MissingDeletedText { .. })));
    }

    #[test]
    fn test_json_wire_shape() {
        let op = Operation::insert(20, "hi", 5, "alice-3");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["position"], 20);
        assert_eq!(json["cursorAfter"], 22);
        assert_eq!(json["opId"], "alice-3");

        let parsed: Operation = serde_json::from_str(
            r#"{"type":"delete","length":4,"position":7,"version":9,"opId":"bob-12"}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, OpKind::Delete { length: 4 });
        assert_eq!(parsed.cursor_after, None);
    }

    #[test]
    fn test_op_id_generator_is_monotonic() {
        let mut ids = OpIdGenerator::new("alice");
        assert_eq!(ids.next_id(), "alice-1");
        assert_eq!(ids.next_id(), "alice-2");
        assert_eq!(ids.client_id(), "alice");
    }
}
