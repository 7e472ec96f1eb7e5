//! Error types for tabletsnap
//!
//! Every operation crossing a component boundary returns a [`SnapshotError`].
//! Errors are:
//! - **Structured**: each variant carries typed details and maps to an [`ErrorCode`]
//! - **Serializable**: a FAILED entity persists the error that failed it
//!
//! # Categories
//!
//! | Code | Variants | Handling |
//! |------|----------|----------|
//! | Conflict | `Conflict` | Operation not valid in the entity's current state |
//! | Unavailable | `Unavailable`, `TryAgain` | Retried internally until the deadline |
//! | HistoryNotAvailable | `HistoryNotAvailable` | Terminal, surfaced to the caller |
//! | IllegalState | `IllegalState`, `Corruption` | Invariant violation, fatal to the operation |
//! | Timeout | `Timeout` | Deadline exceeded, entity goes FAILED |
//! | NotFound | `NotFound` | Unknown entity or tombstoned tablet |
//! | InvalidArgument | `InvalidArgument` | Bad request |
//! | Internal | `Io`, `Serialization`, `Internal` | Infrastructure errors |

use crate::hybrid_time::HybridTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for tabletsnap operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Explicit status code attached to every [`SnapshotError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Operation not valid in the current entity state
    Conflict,
    /// Participant unreachable or not ready
    Unavailable,
    /// Requested hybrid time precedes retained history
    HistoryNotAvailable,
    /// Invariant violation
    IllegalState,
    /// Overall deadline exceeded
    Timeout,
    /// Entity or object does not exist
    NotFound,
    /// Malformed request
    InvalidArgument,
    /// Infrastructure failure
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::HistoryNotAvailable => "HISTORY_NOT_AVAILABLE",
            ErrorCode::IllegalState => "ILLEGAL_STATE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Error type for snapshot coordination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SnapshotError {
    /// Operation not valid in the entity's current state
    #[error("conflict: {reason}")]
    Conflict {
        /// Why the operation conflicts
        reason: String,
    },

    /// Participant unreachable
    #[error("unavailable: {reason}")]
    Unavailable {
        /// What could not be reached
        reason: String,
    },

    /// Participant is alive but cannot answer yet
    #[error("try again: {reason}")]
    TryAgain {
        /// What the participant is waiting for
        reason: String,
    },

    /// Requested hybrid time is at or below the retained history cutoff
    #[error("history not available: requested {requested}, history cutoff is {cutoff}")]
    HistoryNotAvailable {
        /// Requested hybrid time
        requested: HybridTime,
        /// Cutoff in effect when the request was refused
        cutoff: HybridTime,
    },

    /// Invariant violation
    #[error("illegal state: {reason}")]
    IllegalState {
        /// Violated invariant
        reason: String,
    },

    /// Overall operation deadline exceeded
    #[error("timed out: {reason}")]
    Timeout {
        /// Operation that timed out
        reason: String,
    },

    /// Entity or object not found
    #[error("not found: {what}")]
    NotFound {
        /// Missing object
        what: String,
    },

    /// Malformed request
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What is wrong with the request
        reason: String,
    },

    /// Persisted or on-disk data failed validation
    #[error("corruption: {reason}")]
    Corruption {
        /// What failed validation
        reason: String,
    },

    /// I/O error (stringified so the error stays serializable)
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else
    #[error("internal error: {reason}")]
    Internal {
        /// Details
        reason: String,
    },
}

impl SnapshotError {
    /// Build a `Conflict` error
    pub fn conflict(reason: impl Into<String>) -> Self {
        SnapshotError::Conflict {
            reason: reason.into(),
        }
    }

    /// Build an `Unavailable` error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        SnapshotError::Unavailable {
            reason: reason.into(),
        }
    }

    /// Build a `TryAgain` error
    pub fn try_again(reason: impl Into<String>) -> Self {
        SnapshotError::TryAgain {
            reason: reason.into(),
        }
    }

    /// Build an `IllegalState` error
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        SnapshotError::IllegalState {
            reason: reason.into(),
        }
    }

    /// Build a `Timeout` error
    pub fn timeout(reason: impl Into<String>) -> Self {
        SnapshotError::Timeout {
            reason: reason.into(),
        }
    }

    /// Build a `NotFound` error
    pub fn not_found(what: impl Into<String>) -> Self {
        SnapshotError::NotFound { what: what.into() }
    }

    /// Build an `InvalidArgument` error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        SnapshotError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Build a `Corruption` error
    pub fn corruption(reason: impl Into<String>) -> Self {
        SnapshotError::Corruption {
            reason: reason.into(),
        }
    }

    /// Build an `Internal` error
    pub fn internal(reason: impl Into<String>) -> Self {
        SnapshotError::Internal {
            reason: reason.into(),
        }
    }

    /// Status code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SnapshotError::Conflict { .. } => ErrorCode::Conflict,
            SnapshotError::Unavailable { .. } | SnapshotError::TryAgain { .. } => {
                ErrorCode::Unavailable
            }
            SnapshotError::HistoryNotAvailable { .. } => ErrorCode::HistoryNotAvailable,
            SnapshotError::IllegalState { .. } | SnapshotError::Corruption { .. } => {
                ErrorCode::IllegalState
            }
            SnapshotError::Timeout { .. } => ErrorCode::Timeout,
            SnapshotError::NotFound { .. } => ErrorCode::NotFound,
            SnapshotError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            SnapshotError::Io(_) | SnapshotError::Serialization(_) | SnapshotError::Internal { .. } => {
                ErrorCode::Internal
            }
        }
    }

    /// Whether a participant answering with this error should simply be asked again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapshotError::Unavailable { .. } | SnapshotError::TryAgain { .. }
        )
    }

    /// Whether this error means the addressed object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }
}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        SnapshotError::Io(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SnapshotError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SnapshotError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_conflict() {
        let err = SnapshotError::conflict("snapshot is still being created");
        let msg = err.to_string();
        assert!(msg.contains("conflict"));
        assert!(msg.contains("still being created"));
    }

    #[test]
    fn test_error_display_history() {
        let err = SnapshotError::HistoryNotAvailable {
            requested: HybridTime::from_raw(10),
            cutoff: HybridTime::from_raw(20),
        };
        let msg = err.to_string();
        assert!(msg.contains("history not available"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SnapshotError::conflict("x").code(), ErrorCode::Conflict);
        assert_eq!(SnapshotError::unavailable("x").code(), ErrorCode::Unavailable);
        assert_eq!(SnapshotError::try_again("x").code(), ErrorCode::Unavailable);
        assert_eq!(SnapshotError::timeout("x").code(), ErrorCode::Timeout);
        assert_eq!(
            SnapshotError::corruption("x").code(),
            ErrorCode::IllegalState
        );
        assert_eq!(SnapshotError::Io("x".into()).code(), ErrorCode::Internal);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SnapshotError::unavailable("down").is_retryable());
        assert!(SnapshotError::try_again("pending").is_retryable());
        assert!(!SnapshotError::conflict("x").is_retryable());
        assert!(!SnapshotError::not_found("x").is_retryable());
        assert!(SnapshotError::not_found("x").is_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: SnapshotError = io_err.into();
        assert!(matches!(err, SnapshotError::Io(_)));
    }

    #[test]
    fn test_error_serde_roundtrip() {
        let err = SnapshotError::timeout("create snapshot");
        let json = serde_json::to_string(&err).unwrap();
        let back: SnapshotError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
