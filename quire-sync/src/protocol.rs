//! Typed synchronization messages.
//!
//! Each logical message travels as a small integer command code plus a
//! JSON payload (camelCase fields). The code and payload are carried by
//! [`crate::frame::Frame`]s; this module only maps between the wire pair
//! and the typed enums, so nothing past the transport boundary ever
//! switches on a raw integer.
//!
//! ```text
//!  client                                   server
//!    │ OpenFile{requester,project,owner,path} │
//!    │ ─────────────────────────────────────► │
//!    │ ◄───────────────────────────────────── │ FileContent{content,version,hash}
//!    │ EditOperation{path, op}                │
//!    │ ─────────────────────────────────────► │
//!    │ ◄───────────────────────────────────── │ EditBroadcast | ConflictError
//! ```

use quire_core::Operation;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::SyncError;

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    OpenFile = 1,
    FileContent = 2,
    AcquireLineLock = 3,
    LineLockResult = 4,
    ReleaseLineLock = 5,
    EditOperation = 6,
    EditBroadcast = 7,
    HistoryReplay = 8,
    CursorMove = 9,
    CursorBroadcast = 10,
    ConflictError = 11,
    LineUnlocked = 12,
    RequestHistory = 13,
    CloseFile = 14,
    Ping = 15,
    Pong = 16,
    UserLeft = 17,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Command::OpenFile,
            2 => Command::FileContent,
            3 => Command::AcquireLineLock,
            4 => Command::LineLockResult,
            5 => Command::ReleaseLineLock,
            6 => Command::EditOperation,
            7 => Command::EditBroadcast,
            8 => Command::HistoryReplay,
            9 => Command::CursorMove,
            10 => Command::CursorBroadcast,
            11 => Command::ConflictError,
            12 => Command::LineUnlocked,
            13 => Command::RequestHistory,
            14 => Command::CloseFile,
            15 => Command::Ping,
            16 => Command::Pong,
            17 => Command::UserLeft,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    #[error("command {0:?} is not valid in this direction")]
    UnexpectedCommand(Command),
    #[error("malformed payload: {0}")]
    Payload(String),
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

/// Why the server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictCode {
    LineLocked,
    StaleVersion,
    HistoryExhausted,
    Unauthorized,
    InvalidOperation,
}

// ─── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFileRequest {
    pub requester: String,
    pub project: String,
    pub owner: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRequest {
    pub path: String,
    /// 1-based
    pub line_number: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub path: String,
    #[serde(flatten)]
    pub op: Operation,
}

/// An accepted operation as seen by subscribers. `op.version` is the
/// version the operation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBroadcast {
    pub path: String,
    pub user: String,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub path: String,
    pub from_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub path: String,
    pub cursor_position: usize,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub version: u64,
    pub hash: String,
}

impl FileContent {
    pub fn new(path: impl Into<String>, content: impl Into<String>, version: u64) -> Self {
        let content = content.into();
        let hash = content_hash(&content);
        Self {
            path: path.into(),
            content,
            version,
            hash,
        }
    }

    /// Whether `hash` matches `content`.
    pub fn verify(&self) -> bool {
        content_hash(&self.content) == self.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResult {
    pub path: String,
    pub success: bool,
    pub line_number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReplay {
    pub path: String,
    pub entries: Vec<EditBroadcast>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub path: String,
    pub error_code: ConflictCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_position: Option<usize>,
    /// Id and version of the rejected operation, when one was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub message: String,
}

impl Conflict {
    /// Describe `error`, optionally tied to the operation it rejected.
    pub fn from_error(path: impl Into<String>, error: &SyncError, op: Option<&Operation>) -> Self {
        let (line_number, lock_owner) = match error {
            SyncError::LineLocked { line, owner } => (Some(*line), Some(owner.clone())),
            _ => (None, None),
        };
        Self {
            path: path.into(),
            error_code: error.conflict_code(),
            line_number,
            lock_owner,
            requested_position: op.map(|op| op.position),
            op_id: op.map(|op| op.op_id.clone()),
            version: op.map(|op| op.version),
            message: error.to_string(),
        }
    }

    /// Best-effort reconstruction of the server-side error.
    pub fn to_error(&self) -> SyncError {
        match self.error_code {
            ConflictCode::LineLocked => SyncError::LineLocked {
                line: self.line_number.unwrap_or_default(),
                owner: self.lock_owner.clone().unwrap_or_default(),
            },
            ConflictCode::Unauthorized => SyncError::AuthorizationFailure {
                user: String::new(),
                resource: self.path.clone(),
            },
            _ => SyncError::InvalidOperation(self.message.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinesUnlocked {
    pub path: String,
    pub line_numbers: Vec<usize>,
    pub user: String,
}

/// A user's last connection to `path` went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub path: String,
    pub user: String,
}

/// Hex SHA-256 of a document body, sent with every `FileContent`.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ─── Messages ──────────────────────────────────────────────────────────

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    OpenFile(OpenFileRequest),
    AcquireLineLock(LineRequest),
    ReleaseLineLock(LineRequest),
    EditOperation(EditRequest),
    RequestHistory(HistoryRequest),
    CursorMove(CursorUpdate),
    CloseFile(CloseRequest),
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    FileContent(FileContent),
    LineLockResult(LockResult),
    EditBroadcast(EditBroadcast),
    HistoryReplay(HistoryReplay),
    CursorBroadcast(CursorUpdate),
    ConflictError(Conflict),
    LineUnlocked(LinesUnlocked),
    UserLeft(UserLeft),
    Pong,
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Payload(e.to_string()))
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Payload(e.to_string()))
}

impl ClientMessage {
    pub fn command(&self) -> Command {
        match self {
            ClientMessage::OpenFile(_) => Command::OpenFile,
            ClientMessage::AcquireLineLock(_) => Command::AcquireLineLock,
            ClientMessage::ReleaseLineLock(_) => Command::ReleaseLineLock,
            ClientMessage::EditOperation(_) => Command::EditOperation,
            ClientMessage::RequestHistory(_) => Command::RequestHistory,
            ClientMessage::CursorMove(_) => Command::CursorMove,
            ClientMessage::CloseFile(_) => Command::CloseFile,
            ClientMessage::Ping => Command::Ping,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ClientMessage::OpenFile(p) => to_json(p),
            ClientMessage::AcquireLineLock(p) | ClientMessage::ReleaseLineLock(p) => to_json(p),
            ClientMessage::EditOperation(p) => to_json(p),
            ClientMessage::RequestHistory(p) => to_json(p),
            ClientMessage::CursorMove(p) => to_json(p),
            ClientMessage::CloseFile(p) => to_json(p),
            ClientMessage::Ping => Ok(Vec::new()),
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match Command::try_from(code)? {
            Command::OpenFile => ClientMessage::OpenFile(from_json(payload)?),
            Command::AcquireLineLock => ClientMessage::AcquireLineLock(from_json(payload)?),
            Command::ReleaseLineLock => ClientMessage::ReleaseLineLock(from_json(payload)?),
            Command::EditOperation => ClientMessage::EditOperation(from_json(payload)?),
            Command::RequestHistory => ClientMessage::RequestHistory(from_json(payload)?),
            Command::CursorMove => ClientMessage::CursorMove(from_json(payload)?),
            Command::CloseFile => ClientMessage::CloseFile(from_json(payload)?),
            Command::Ping => ClientMessage::Ping,
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        })
    }

    /// File the message refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            ClientMessage::OpenFile(p) => Some(&p.path),
            ClientMessage::AcquireLineLock(p) | ClientMessage::ReleaseLineLock(p) => Some(&p.path),
            ClientMessage::EditOperation(p) => Some(&p.path),
            ClientMessage::RequestHistory(p) => Some(&p.path),
            ClientMessage::CursorMove(p) => Some(&p.path),
            ClientMessage::CloseFile(p) => Some(&p.path),
            ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    pub fn command(&self) -> Command {
        match self {
            ServerMessage::FileContent(_) => Command::FileContent,
            ServerMessage::LineLockResult(_) => Command::LineLockResult,
            ServerMessage::EditBroadcast(_) => Command::EditBroadcast,
            ServerMessage::HistoryReplay(_) => Command::HistoryReplay,
            ServerMessage::CursorBroadcast(_) => Command::CursorBroadcast,
            ServerMessage::ConflictError(_) => Command::ConflictError,
            ServerMessage::LineUnlocked(_) => Command::LineUnlocked,
            ServerMessage::UserLeft(_) => Command::UserLeft,
            ServerMessage::Pong => Command::Pong,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ServerMessage::FileContent(p) => to_json(p),
            ServerMessage::LineLockResult(p) => to_json(p),
            ServerMessage::EditBroadcast(p) => to_json(p),
            ServerMessage::HistoryReplay(p) => to_json(p),
            ServerMessage::CursorBroadcast(p) => to_json(p),
            ServerMessage::ConflictError(p) => to_json(p),
            ServerMessage::LineUnlocked(p) => to_json(p),
            ServerMessage::UserLeft(p) => to_json(p),
            ServerMessage::Pong => Ok(Vec::new()),
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match Command::try_from(code)? {
            Command::FileContent => ServerMessage::FileContent(from_json(payload)?),
            Command::LineLockResult => ServerMessage::LineLockResult(from_json(payload)?),
            Command::EditBroadcast => ServerMessage::EditBroadcast(from_json(payload)?),
            Command::HistoryReplay => ServerMessage::HistoryReplay(from_json(payload)?),
            Command::CursorBroadcast => ServerMessage::CursorBroadcast(from_json(payload)?),
            Command::ConflictError => ServerMessage::ConflictError(from_json(payload)?),
            Command::LineUnlocked => ServerMessage::LineUnlocked(from_json(payload)?),
            Command::UserLeft => ServerMessage::UserLeft(from_json(payload)?),
            Command::Pong => ServerMessage::Pong,
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        })
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            ServerMessage::FileContent(p) => Some(&p.path),
            ServerMessage::LineLockResult(p) => Some(&p.path),
            ServerMessage::EditBroadcast(p) => Some(&p.path),
            ServerMessage::HistoryReplay(p) => Some(&p.path),
            ServerMessage::CursorBroadcast(p) => Some(&p.path),
            ServerMessage::ConflictError(p) => Some(&p.path),
            ServerMessage::LineUnlocked(p) => Some(&p.path),
            ServerMessage::UserLeft(p) => Some(&p.path),
            ServerMessage::Pong => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_stable() {
        assert_eq!(Command::OpenFile as u8, 1);
        assert_eq!(Command::ConflictError as u8, 11);
        assert_eq!(Command::try_from(7).unwrap(), Command::EditBroadcast);
        assert_eq!(Command::try_from(0), Err(ProtocolError::UnknownCommand(0)));
        assert_eq!(Command::try_from(200), Err(ProtocolError::UnknownCommand(200)));
    }

    #[test]
    fn test_edit_request_payload_is_flat() {
        let msg = ClientMessage::EditOperation(EditRequest {
            path: "src/main.rs".into(),
            op: Operation::insert(20, "hi", 5, "alice-1"),
        });
        let payload = msg.encode_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["path"], "src/main.rs");
        assert_eq!(json["type"], "insert");
        assert_eq!(json["position"], 20);
        assert_eq!(json["version"], 5);
        assert_eq!(json["opId"], "alice-1");

        let decoded = ClientMessage::decode(msg.command() as u8, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_direction_is_enforced() {
        let payload = br#"{"path":"a","content":"","version":0,"hash":""}"#;
        assert_eq!(
            ClientMessage::decode(Command::FileContent as u8, payload),
            Err(ProtocolError::UnexpectedCommand(Command::FileContent))
        );
        assert!(ServerMessage::decode(Command::FileContent as u8, payload).is_ok());
    }

    #[test]
    fn test_conflict_wire_code() {
        let err = SyncError::LineLocked { line: 3, owner: "alice".into() };
        let op = Operation::insert(20, "x", 5, "bob-1");
        let conflict = Conflict::from_error("f.txt", &err, Some(&op));
        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json["errorCode"], "LINE_LOCKED");
        assert_eq!(json["lineNumber"], 3);
        assert_eq!(json["lockOwner"], "alice");
        assert_eq!(json["requestedPosition"], 20);
        assert_eq!(json["opId"], "bob-1");
    }

    #[test]
    fn test_file_content_hash() {
        let content = FileContent::new("a.txt", "hello", 3);
        assert_eq!(
            content.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(content.verify());
    }

    #[test]
    fn test_user_left_wire_shape() {
        let msg = ServerMessage::UserLeft(UserLeft {
            path: "notes.md".into(),
            user: "alice".into(),
        });
        assert_eq!(msg.command() as u8, 17);
        let payload = msg.encode_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["path"], "notes.md");
        assert_eq!(json["user"], "alice");
        assert_eq!(ServerMessage::decode(17, &payload).unwrap(), msg);
        assert_eq!(msg.path(), Some("notes.md"));
        assert!(ClientMessage::decode(17, &payload).is_err());
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        let err = ServerMessage::decode(Command::EditBroadcast as u8, b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Payload(_)));
    }
}
