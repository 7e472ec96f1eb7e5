//! Participant executor
//!
//! Applies coordinator operations to one tablet. Every request carries an
//! [`OperationId`]; the executor remembers each id it has seen:
//!
//! | Ledger entry | Redelivery answers |
//! |--------------|--------------------|
//! | running      | `InProgress` |
//! | applied      | the recorded outcome, nothing is re-applied |
//! | (errored)    | entry dropped, the next delivery runs it again |
//!
//! Nothing here waits on remote state: a capture that would have to wait for
//! an unresolved commit answers `TryAgain` and the coordinator asks again on
//! its next poll.

use crate::tablet::Tablet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tabletsnap_core::{
    Clock, OperationId, ParticipantRequest, Result, SnapshotError, TabletOpOutcome,
    TabletOperation,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
enum LedgerEntry {
    Running,
    Applied(TabletOpOutcome),
}

/// Executes participant operations against a single tablet
pub struct ParticipantExecutor {
    tablet: Arc<Tablet>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<HashMap<OperationId, LedgerEntry>>,
}

impl ParticipantExecutor {
    /// Executor for `tablet` stamping writes with `clock`
    pub fn new(tablet: Arc<Tablet>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tablet,
            clock,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Tablet this executor drives
    pub fn tablet(&self) -> &Arc<Tablet> {
        &self.tablet
    }

    /// Execute `request`, answering redeliveries from the ledger
    pub fn execute(&self, request: &ParticipantRequest) -> Result<TabletOpOutcome> {
        if &request.tablet_id != self.tablet.id() {
            return Err(SnapshotError::invalid_argument(format!(
                "request for tablet {} delivered to tablet {}",
                request.tablet_id,
                self.tablet.id()
            )));
        }

        {
            let mut ledger = self.ledger.lock();
            match ledger.get(&request.op_id) {
                Some(LedgerEntry::Running) => return Ok(TabletOpOutcome::InProgress),
                Some(LedgerEntry::Applied(outcome)) => {
                    debug!(
                        target: "tabletsnap::tablet",
                        tablet_id = %self.tablet.id(),
                        op_id = %request.op_id,
                        "Operation already applied"
                    );
                    return Ok(*outcome);
                }
                None => {
                    ledger.insert(request.op_id, LedgerEntry::Running);
                }
            }
        }

        let result = self.apply(&request.operation);

        let mut ledger = self.ledger.lock();
        match &result {
            Ok(outcome) => {
                ledger.insert(request.op_id, LedgerEntry::Applied(*outcome));
            }
            Err(e) => {
                ledger.remove(&request.op_id);
                if !e.is_retryable() {
                    warn!(
                        target: "tabletsnap::tablet",
                        tablet_id = %self.tablet.id(),
                        op_id = %request.op_id,
                        error = %e,
                        "Operation failed"
                    );
                }
            }
        }
        result
    }

    fn apply(&self, operation: &TabletOperation) -> Result<TabletOpOutcome> {
        match operation {
            TabletOperation::CreateSnapshot {
                snapshot_id,
                hybrid_time,
            } => {
                let hybrid_time = match hybrid_time {
                    Some(ht) => {
                        self.clock.update(*ht);
                        *ht
                    }
                    None => self.clock.now(),
                };
                self.tablet.capture(*snapshot_id, hybrid_time)?;
                Ok(TabletOpOutcome::Applied {
                    hybrid_time: Some(hybrid_time),
                })
            }
            TabletOperation::RestoreSnapshot {
                snapshot_id,
                target_hybrid_time,
            } => {
                let applied_at =
                    self.tablet
                        .restore(*snapshot_id, *target_hybrid_time, self.clock.now())?;
                Ok(TabletOpOutcome::Applied {
                    hybrid_time: Some(applied_at),
                })
            }
            TabletOperation::DeleteSnapshot { snapshot_id } => {
                let existed = self.tablet.artifacts().remove(snapshot_id)?;
                debug!(
                    target: "tabletsnap::tablet",
                    tablet_id = %self.tablet.id(),
                    %snapshot_id,
                    existed,
                    "Artifact removed"
                );
                Ok(TabletOpOutcome::Applied { hybrid_time: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletsnap_core::{
        HybridClock, PartitionBounds, SnapshotId, TableId, TabletId, TabletMeta,
    };
    use tempfile::TempDir;

    fn executor_with_clock(dir: &TempDir, clock: Arc<HybridClock>) -> ParticipantExecutor {
        let meta = TabletMeta {
            id: TabletId::from_raw("tablet-0"),
            table_id: TableId::from_raw("t"),
            partition: PartitionBounds::split(1)[0],
        };
        let tablet = Arc::new(Tablet::open(meta, dir.path()).unwrap());
        ParticipantExecutor::new(tablet, clock)
    }

    fn executor(dir: &TempDir) -> ParticipantExecutor {
        executor_with_clock(dir, Arc::new(HybridClock::default()))
    }

    fn request(op_id: OperationId, operation: TabletOperation) -> ParticipantRequest {
        ParticipantRequest {
            op_id,
            tablet_id: TabletId::from_raw("tablet-0"),
            operation,
        }
    }

    #[test]
    fn test_redelivered_snapshot_answers_recorded_outcome() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir);
        let snapshot_id = SnapshotId::new();
        let req = request(
            OperationId::snapshot(snapshot_id),
            TabletOperation::CreateSnapshot {
                snapshot_id,
                hybrid_time: None,
            },
        );

        let first = executor.execute(&req).unwrap();
        let second = executor.execute(&req).unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, TabletOpOutcome::Applied { hybrid_time: Some(_) }));
    }

    #[test]
    fn test_redelivered_restore_not_reapplied() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(HybridClock::default());
        let executor = executor_with_clock(&dir, clock.clone());
        let snapshot_id = SnapshotId::new();
        executor
            .execute(&request(
                OperationId::snapshot(snapshot_id),
                TabletOperation::CreateSnapshot {
                    snapshot_id,
                    hybrid_time: None,
                },
            ))
            .unwrap();

        let restore = request(
            OperationId::restore(tabletsnap_core::RestoreId::new()),
            TabletOperation::RestoreSnapshot {
                snapshot_id,
                target_hybrid_time: None,
            },
        );
        let first = executor.execute(&restore).unwrap();

        let token = executor.tablet().begin_commit();
        executor.tablet().set_commit_time(token, clock.now()).unwrap();
        executor
            .tablet()
            .apply_commit(token, &[(b"k".to_vec(), Some(b"late".to_vec()))])
            .unwrap();

        assert_eq!(executor.execute(&restore).unwrap(), first);
        assert_eq!(
            executor.tablet().read(b"k", None).unwrap(),
            Some(b"late".to_vec())
        );
    }

    #[test]
    fn test_failed_operation_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir);
        let snapshot_id = SnapshotId::new();
        let token = executor.tablet().begin_commit();
        let req = request(
            OperationId::snapshot(snapshot_id),
            TabletOperation::CreateSnapshot {
                snapshot_id,
                hybrid_time: None,
            },
        );
        assert!(executor.execute(&req).unwrap_err().is_retryable());

        executor.tablet().abort_commit(token);
        assert!(executor.execute(&req).is_ok());
    }

    #[test]
    fn test_snapshot_pushes_clock_past_candidate() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(HybridClock::default());
        let executor = executor_with_clock(&dir, clock.clone());

        let future = clock.now().saturating_add(std::time::Duration::from_secs(60));
        let snapshot_id = SnapshotId::new();
        executor
            .execute(&request(
                OperationId::snapshot(snapshot_id),
                TabletOperation::CreateSnapshot {
                    snapshot_id,
                    hybrid_time: Some(future),
                },
            ))
            .unwrap();
        assert!(clock.now() > future);
    }

    #[test]
    fn test_delete_of_missing_artifact_succeeds() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir);
        let snapshot_id = SnapshotId::new();
        let outcome = executor
            .execute(&request(
                OperationId::delete(snapshot_id),
                TabletOperation::DeleteSnapshot { snapshot_id },
            ))
            .unwrap();
        assert_eq!(outcome, TabletOpOutcome::Applied { hybrid_time: None });
    }

    #[test]
    fn test_misaddressed_request_rejected() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir);
        let snapshot_id = SnapshotId::new();
        let mut req = request(
            OperationId::delete(snapshot_id),
            TabletOperation::DeleteSnapshot { snapshot_id },
        );
        req.tablet_id = TabletId::from_raw("other");
        assert!(matches!(
            executor.execute(&req),
            Err(SnapshotError::InvalidArgument { .. })
        ));
    }
}
