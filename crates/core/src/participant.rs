//! Participant protocol
//!
//! The coordinator drives tablets through three idempotent operations.
//! Each request carries an [`OperationId`]; a participant that sees the same
//! id twice answers from its ledger instead of applying the operation again.

use crate::error::Result;
use crate::hybrid_time::HybridTime;
use crate::types::{RestoreId, SnapshotId, TabletId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Kind of participant operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Capture a snapshot
    Snapshot,
    /// Roll back to a snapshot or point in time
    Restore,
    /// Remove a snapshot artifact
    Delete,
}

/// Idempotency key of a participant operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    /// Entity (snapshot or restoration) the operation belongs to
    pub entity: Uuid,
    /// Operation kind
    pub kind: OpKind,
}

impl OperationId {
    /// Capture for `snapshot`
    pub fn snapshot(snapshot: SnapshotId) -> Self {
        Self {
            entity: snapshot.as_uuid(),
            kind: OpKind::Snapshot,
        }
    }

    /// Restoration `restore`
    pub fn restore(restore: RestoreId) -> Self {
        Self {
            entity: restore.as_uuid(),
            kind: OpKind::Restore,
        }
    }

    /// Removal of `snapshot`
    pub fn delete(snapshot: SnapshotId) -> Self {
        Self {
            entity: snapshot.as_uuid(),
            kind: OpKind::Delete,
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.entity)
    }
}

/// Operation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletOperation {
    /// `DoSnapshot(op_id, hybrid_time)`
    CreateSnapshot {
        /// Snapshot being captured
        snapshot_id: SnapshotId,
        /// Consistency point; `None` captures at the tablet's current time
        hybrid_time: Option<HybridTime>,
    },
    /// `DoRestore(op_id, snapshot_id, target_hybrid_time)`
    RestoreSnapshot {
        /// Snapshot whose artifact is restored
        snapshot_id: SnapshotId,
        /// Point-in-time target; `None` restores to the snapshot hybrid time
        target_hybrid_time: Option<HybridTime>,
    },
    /// `DoDelete(op_id)`
    DeleteSnapshot {
        /// Snapshot whose artifact is removed
        snapshot_id: SnapshotId,
    },
}

/// Request addressed to one tablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRequest {
    /// Idempotency key
    pub op_id: OperationId,
    /// Target tablet
    pub tablet_id: TabletId,
    /// Operation
    pub operation: TabletOperation,
}

/// Successful participant answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletOpOutcome {
    /// Operation applied; carries the hybrid time it took effect at
    Applied {
        /// Capture point (snapshot) or apply point (restore); `None` for delete
        hybrid_time: Option<HybridTime>,
    },
    /// A delivery of the same operation is still executing
    InProgress,
}

/// RPC surface of the participant executors
///
/// A call returns within `timeout`; a participant that has not answered by
/// then yields `Unavailable`. Transient failures come back as retryable
/// errors (see [`SnapshotError::is_retryable`](crate::SnapshotError::is_retryable));
/// a tablet that no longer exists answers `NotFound`.
pub trait ParticipantTransport: Send + Sync {
    /// Deliver `request` to its tablet and return the participant's answer
    fn send(&self, request: ParticipantRequest, timeout: Duration) -> Result<TabletOpOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_ids_distinguish_kind() {
        let id = SnapshotId::new();
        assert_ne!(OperationId::snapshot(id), OperationId::delete(id));
        assert_eq!(OperationId::snapshot(id), OperationId::snapshot(id));
    }

    #[test]
    fn test_operation_id_display() {
        let id = SnapshotId::new();
        let shown = OperationId::delete(id).to_string();
        assert!(shown.starts_with("Delete/"));
        assert!(shown.ends_with(&id.to_string()));
    }
}
