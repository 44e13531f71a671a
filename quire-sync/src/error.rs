//! Error taxonomy for synchronization.
//!
//! | Variant               | Recovery                                   |
//! |-----------------------|--------------------------------------------|
//! | `StaleVersion`        | automatic: history replay                  |
//! | `HistoryExhausted`    | forced reload of the file                  |
//! | `LineLocked`          | surfaced to the user, never retried        |
//! | `PredictionMismatch`  | automatic: absorbed by a rebase            |
//! | `AuthorizationFailure`| terminal for the request                   |
//! | `PersistenceFailure`  | operations re-queued for a later snapshot  |

use quire_core::OpError;
use thiserror::Error;

use crate::protocol::ConflictCode;
use crate::storage::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("stale version: session is at {current}, operation was computed against {received}")]
    StaleVersion { current: u64, received: u64 },

    #[error("history from version {from_version} is no longer retained (oldest is {oldest_retained})")]
    HistoryExhausted { from_version: u64, oldest_retained: u64 },

    #[error("line {line} is locked by {owner}")]
    LineLocked { line: usize, owner: String },

    #[error("server confirmed {op_id} at version {actual}, expected {expected}")]
    PredictionMismatch { op_id: String, expected: u64, actual: u64 },

    #[error("{user} is not authorized for {resource}")]
    AuthorizationFailure { user: String, resource: String },

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl SyncError {
    /// Wire code sent back to a client in a `ConflictError`.
    pub fn conflict_code(&self) -> ConflictCode {
        match self {
            SyncError::LineLocked { .. } => ConflictCode::LineLocked,
            SyncError::StaleVersion { .. } => ConflictCode::StaleVersion,
            SyncError::HistoryExhausted { .. } => ConflictCode::HistoryExhausted,
            SyncError::AuthorizationFailure { .. } => ConflictCode::Unauthorized,
            _ => ConflictCode::InvalidOperation,
        }
    }

    /// Whether the sync engine recovers from this without involving the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::StaleVersion { .. }
                | SyncError::PredictionMismatch { .. }
                | SyncError::PersistenceFailure(_)
        )
    }
}

impl From<OpError> for SyncError {
    fn from(e: OpError) -> Self {
        SyncError::InvalidOperation(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::PersistenceFailure(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => SyncError::ConnectionClosed,
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_codes() {
        let locked = SyncError::LineLocked { line: 3, owner: "alice".into() };
        assert_eq!(locked.conflict_code(), ConflictCode::LineLocked);
        assert_eq!(locked.to_string(), "line 3 is locked by alice");

        let stale = SyncError::StaleVersion { current: 7, received: 5 };
        assert_eq!(stale.conflict_code(), ConflictCode::StaleVersion);
        assert!(stale.is_recoverable());

        let denied = SyncError::AuthorizationFailure { user: "eve".into(), resource: "p".into() };
        assert_eq!(denied.conflict_code(), ConflictCode::Unauthorized);
        assert!(!denied.is_recoverable());
    }

    #[test]
    fn test_op_error_maps_to_invalid_operation() {
        let err: SyncError = OpError::OutOfBounds { position: 9, len: 3 }.into();
        assert_eq!(err.conflict_code(), ConflictCode::InvalidOperation);
    }
}
