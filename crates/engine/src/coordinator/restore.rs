//! Restorations

use super::state::TrackedRestore;
use super::CoordinatorInner;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    HybridTime, OperationId, ParticipantRequest, RecordKey, RestoreEntity, RestoreId,
    RestoreState, Result, SnapshotError, SnapshotId, SnapshotState, SysEntry, SysRecord,
    TabletId, TabletOpOutcome, TabletOpStatus, TabletOperation,
};
use tabletsnap_durability::LogError;
use tracing::{debug, error, info, warn};

impl CoordinatorInner {
    pub(crate) fn restore_snapshot(
        self: &Arc<Self>,
        snapshot_id: SnapshotId,
        restore_ht: Option<HybridTime>,
        acceptable_interval: Option<Duration>,
    ) -> Result<RestoreId> {
        self.ensure_accepting()?;
        let cell = self
            .snapshot_cell(&snapshot_id)
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot {}", snapshot_id)))?;
        let snapshot = cell.lock();

        if snapshot.entity.state != SnapshotState::Complete {
            return Err(SnapshotError::conflict(format!(
                "snapshot {} is {}, only COMPLETE snapshots can be restored",
                snapshot_id, snapshot.entity.state
            )));
        }
        let snapshot_ht = snapshot.entity.snapshot_hybrid_time.ok_or_else(|| {
            SnapshotError::illegal_state(format!(
                "COMPLETE snapshot {} has no snapshot hybrid time",
                snapshot_id
            ))
        })?;

        let target = match (restore_ht, acceptable_interval) {
            (Some(ht), Some(interval)) => Some(ht.saturating_sub(interval)),
            (Some(ht), None) => Some(ht),
            (None, Some(interval)) => Some(self.ctx.clock.now().saturating_sub(interval)),
            (None, None) => None,
        };
        if let Some(target) = target {
            if target > snapshot_ht {
                return Err(SnapshotError::invalid_argument(format!(
                    "restore target {} is after snapshot hybrid time {}",
                    target, snapshot_ht
                )));
            }
            for tablet_id in snapshot.entity.per_tablet_status.keys() {
                if let Some(cutoff) = self.ctx.tracker.history_cutoff(tablet_id) {
                    if target < cutoff {
                        return Err(SnapshotError::HistoryNotAvailable {
                            requested: target,
                            cutoff,
                        });
                    }
                }
            }
        }

        if let Some(other) = self.restoring_tables(&snapshot.entity.table_ids) {
            return Err(SnapshotError::conflict(format!(
                "restoration {} of the same tables is in progress",
                other
            )));
        }

        // The snapshot stays locked until the restoration is visible to
        // delete_snapshot
        let entity = RestoreEntity::new(RestoreId::new(), &snapshot.entity, target, Utc::now());
        let id = entity.id;
        let version = self.ctx.log.put(&SysRecord::restoration(entity.clone()), None)?;

        info!(
            target: "tabletsnap::coordinator",
            restore_id = %id,
            %snapshot_id,
            target = ?target,
            "Restoration started"
        );
        self.restorations
            .insert(id, Arc::new(Mutex::new(TrackedRestore::new(entity, version))));
        drop(snapshot);
        self.process_restore(id);
        Ok(id)
    }

    /// Advance one restoration: deadline, dispatch
    pub(crate) fn process_restore(self: &Arc<Self>, id: RestoreId) {
        let Some(cell) = self.restore_cell(&id) else {
            return;
        };
        let mut tracked = cell.lock();
        if !tracked.entity.is_in_flight() {
            return;
        }
        if tracked.failure.is_none() {
            let age = (Utc::now() - tracked.entity.creation_time)
                .to_std()
                .unwrap_or_default();
            if age > self.config.restore_timeout() {
                tracked.failure = Some(SnapshotError::timeout(format!(
                    "restoration {} not applied within {:?}",
                    id,
                    self.config.restore_timeout()
                )));
            }
        }
        self.advance_restore(&mut tracked);
        if tracked.entity.is_in_flight() {
            self.dispatch_restore_rpcs(id, &mut tracked);
        }
    }

    fn advance_restore(&self, tracked: &mut TrackedRestore) {
        let target = if tracked.failure.is_some() && tracked.entity.is_in_flight() {
            RestoreState::Failed
        } else {
            match tracked.entity.aggregate() {
                Some(target) => target,
                None => return,
            }
        };

        let id = tracked.entity.id;
        let mut next = tracked.entity.clone();
        if let Err(e) = next.finish(target, Utc::now()) {
            error!(target: "tabletsnap::coordinator", restore_id = %id, error = %e, "Invalid restoration transition");
            return;
        }
        if target == RestoreState::Failed {
            next.error = Some(tracked.failure.clone().unwrap_or_else(|| {
                SnapshotError::internal("a participant failed to restore")
            }));
        }

        if self.commit_restore(tracked, next).is_err() {
            return;
        }
        tracked.in_flight.clear();
        match target {
            RestoreState::Complete => {
                info!(target: "tabletsnap::coordinator", restore_id = %id, "Restoration complete");
            }
            _ => {
                warn!(target: "tabletsnap::coordinator", restore_id = %id, error = ?tracked.entity.error, "Restoration failed");
            }
        }
    }

    pub(crate) fn commit_restore(&self, tracked: &mut TrackedRestore, next: RestoreEntity) -> Result<()> {
        let id = next.id;
        match self
            .ctx
            .log
            .put(&SysRecord::restoration(next.clone()), Some(tracked.version))
        {
            Ok(version) => {
                tracked.entity = next;
                tracked.version = version;
                Ok(())
            }
            Err(e @ LogError::VersionMismatch { .. }) => {
                warn!(target: "tabletsnap::coordinator", restore_id = %id, error = %e, "Restoration record changed underneath, reloading");
                match self.ctx.log.get(&RecordKey::Restoration(id)) {
                    Ok(Some(stored)) => {
                        if let SysEntry::Restoration(entity) = stored.record.entry {
                            tracked.reload(entity, stored.version);
                        }
                    }
                    Ok(None) => {}
                    Err(reload) => {
                        error!(target: "tabletsnap::coordinator", restore_id = %id, error = %reload, "Failed to reload restoration record");
                    }
                }
                Err(e.into())
            }
            Err(e) => {
                error!(target: "tabletsnap::coordinator", restore_id = %id, error = %e, "Failed to persist restoration");
                Err(e.into())
            }
        }
    }

    fn dispatch_restore_rpcs(self: &Arc<Self>, id: RestoreId, tracked: &mut TrackedRestore) {
        let operation = TabletOperation::RestoreSnapshot {
            snapshot_id: tracked.entity.source_snapshot_id,
            target_hybrid_time: tracked.entity.restore_hybrid_time,
        };
        for tablet_id in tracked.entity.pending_tablets() {
            if tracked.in_flight.contains_key(&tablet_id) {
                continue;
            }
            let generation = self.next_generation();
            let request = ParticipantRequest {
                op_id: OperationId::restore(id),
                tablet_id: tablet_id.clone(),
                operation: operation.clone(),
            };
            let inner = Arc::clone(self);
            let tablet = tablet_id.clone();
            let submitted = self.dispatcher.submit(move || {
                let result = inner.ctx.transport.send(request, inner.config.rpc_timeout());
                inner.on_restore_response(id, &tablet, generation, result);
            });
            if let Err(e) = submitted {
                debug!(target: "tabletsnap::coordinator", restore_id = %id, error = %e, "RPC not dispatched");
                break;
            }
            tracked.in_flight.insert(tablet_id, generation);
        }
    }

    fn on_restore_response(
        &self,
        id: RestoreId,
        tablet_id: &TabletId,
        generation: u64,
        result: Result<TabletOpOutcome>,
    ) {
        let Some(cell) = self.restore_cell(&id) else {
            return;
        };
        let mut tracked = cell.lock();
        tracked.finish_rpc(tablet_id, generation);
        if !tracked.entity.is_in_flight() {
            return;
        }

        match result {
            Ok(TabletOpOutcome::Applied { hybrid_time }) => {
                if tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Done) {
                    debug!(
                        target: "tabletsnap::coordinator",
                        restore_id = %id,
                        %tablet_id,
                        applied_at = ?hybrid_time,
                        "Tablet restored"
                    );
                }
            }
            Ok(TabletOpOutcome::InProgress) => {}
            Err(e) if e.is_retryable() => {
                debug!(target: "tabletsnap::coordinator", restore_id = %id, %tablet_id, error = %e, "Retryable participant error");
            }
            Err(e) => {
                warn!(target: "tabletsnap::coordinator", restore_id = %id, %tablet_id, error = %e, "Tablet failed to restore");
                if tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Failed) && tracked.failure.is_none() {
                    tracked.failure = Some(e);
                }
            }
        }
        self.advance_restore(&mut tracked);
    }
}
