//! Operation log errors

use tabletsnap_core::{RecordKey, SnapshotError};
use thiserror::Error;

/// Result type alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Errors raised by an [`OperationLog`](crate::OperationLog)
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on the log file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compare-and-set precondition failed
    #[error("Version mismatch for {key}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        /// Record key
        key: RecordKey,
        /// Version the writer expected (`None` = record must not exist)
        expected: Option<u64>,
        /// Version actually stored (`None` = record absent)
        actual: Option<u64>,
    },

    /// A frame in the middle of the log failed its checksum
    #[error("Log corruption at offset {offset}: {reason}")]
    Corruption {
        /// Byte offset of the bad frame
        offset: u64,
        /// What failed
        reason: String,
    },

    /// The log refused the write
    #[error("Log unavailable: {0}")]
    Unavailable(String),
}

impl From<rmp_serde::encode::Error> for LogError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LogError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

impl From<LogError> for SnapshotError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::VersionMismatch { .. } => SnapshotError::illegal_state(e.to_string()),
            LogError::Corruption { .. } => SnapshotError::corruption(e.to_string()),
            LogError::Unavailable(reason) => SnapshotError::unavailable(reason),
            LogError::Io(io) => SnapshotError::Io(io.to_string()),
            LogError::Serialization(s) => SnapshotError::Serialization(s),
        }
    }
}
