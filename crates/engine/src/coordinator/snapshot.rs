//! Snapshot creation and deletion

use super::state::TrackedSnapshot;
use super::CoordinatorInner;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tabletsnap_core::{
    OperationId, ParticipantRequest, RecordKey, Result, SnapshotEntity, SnapshotError,
    SnapshotId, SnapshotState, SysEntry, SysRecord, TableId, TabletId, TabletOpOutcome,
    TabletOpStatus, TabletOperation,
};
use tabletsnap_durability::LogError;
use tracing::{debug, error, info, warn};

impl CoordinatorInner {
    pub(crate) fn create_snapshot(
        self: &Arc<Self>,
        mut table_ids: Vec<TableId>,
        transaction_aware: bool,
    ) -> Result<SnapshotId> {
        self.ensure_accepting()?;
        table_ids.sort();
        table_ids.dedup();
        if table_ids.is_empty() {
            return Err(SnapshotError::invalid_argument("snapshot needs at least one table"));
        }

        let catalog = self.ctx.catalog.describe(&table_ids)?;
        self.check_create_conflicts(&table_ids)?;

        let id = SnapshotId::new();
        let candidate = transaction_aware.then(|| self.ctx.clock.now());
        if let Some(hybrid_time) = candidate {
            self.ctx
                .tracker
                .propose_hold(id, hybrid_time, &catalog.tablet_ids())?;
        }

        let entity = SnapshotEntity::new(id, table_ids, transaction_aware, candidate, catalog, Utc::now());
        let version = match self.ctx.log.put(&SysRecord::snapshot(entity.clone()), None) {
            Ok(version) => version,
            Err(e) => {
                self.ctx.tracker.release(&id);
                return Err(e.into());
            }
        };

        info!(
            target: "tabletsnap::coordinator",
            snapshot_id = %id,
            tablets = entity.per_tablet_status.len(),
            transaction_aware,
            candidate = ?candidate,
            "Snapshot creation started"
        );
        self.snapshots
            .insert(id, Arc::new(Mutex::new(TrackedSnapshot::new(entity, version))));
        self.process_snapshot(id);
        Ok(id)
    }

    fn check_create_conflicts(&self, table_ids: &[TableId]) -> Result<()> {
        for (id, cell) in self.snapshot_cells() {
            let tracked = cell.lock();
            if tracked.entity.state == SnapshotState::Deleting && tracked.entity.overlaps(table_ids) {
                return Err(SnapshotError::conflict(format!(
                    "snapshot {} of the same tables is being deleted",
                    id
                )));
            }
        }
        if let Some(restore_id) = self.restoring_tables(table_ids) {
            return Err(SnapshotError::conflict(format!(
                "restoration {} of the same tables is in progress",
                restore_id
            )));
        }
        Ok(())
    }

    pub(crate) fn delete_snapshot(self: &Arc<Self>, id: SnapshotId) -> Result<()> {
        self.ensure_accepting()?;
        let cell = self
            .snapshot_cell(&id)
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot {}", id)))?;
        let mut tracked = cell.lock();

        match tracked.entity.state {
            SnapshotState::Creating => {
                return Err(SnapshotError::conflict(format!(
                    "snapshot {} is still being created",
                    id
                )))
            }
            SnapshotState::Failed => {
                return Err(SnapshotError::conflict(format!(
                    "snapshot {} failed and is removed automatically",
                    id
                )))
            }
            SnapshotState::Deleting | SnapshotState::Deleted => return Ok(()),
            SnapshotState::Complete => {}
        }
        if self.restoring_from(&id) {
            return Err(SnapshotError::conflict(format!(
                "snapshot {} is being restored",
                id
            )));
        }

        let mut next = tracked.entity.clone();
        next.transition(SnapshotState::Deleting, Utc::now())?;
        self.commit_snapshot(&mut tracked, next)?;
        tracked.in_flight.clear();
        info!(target: "tabletsnap::coordinator", snapshot_id = %id, "Snapshot deletion started");

        self.settle_dropped_tablets(&mut tracked);
        self.advance_snapshot(&mut tracked);
        if tracked.entity.state.is_in_flight() {
            self.dispatch_snapshot_rpcs(id, &mut tracked);
        }
        Ok(())
    }

    /// Advance one snapshot: deadline, holds, dispatch
    pub(crate) fn process_snapshot(self: &Arc<Self>, id: SnapshotId) {
        let Some(cell) = self.snapshot_cell(&id) else {
            return;
        };
        let mut tracked = cell.lock();
        match tracked.entity.state {
            SnapshotState::Creating => {
                if tracked.failure.is_none() {
                    let failure = self.check_creating(&tracked.entity);
                    tracked.failure = failure;
                }
            }
            SnapshotState::Deleting => self.settle_dropped_tablets(&mut tracked),
            _ => return,
        }
        self.advance_snapshot(&mut tracked);
        if tracked.entity.state.is_in_flight() {
            self.dispatch_snapshot_rpcs(id, &mut tracked);
        }
    }

    /// Reasons a CREATING snapshot must fail now
    fn check_creating(&self, entity: &SnapshotEntity) -> Option<SnapshotError> {
        if entity.is_transaction_aware && !self.ctx.tracker.renew(&entity.id) {
            // The lease lapsed: take the hold again if history is still there
            let Some(candidate) = entity.candidate_hybrid_time else {
                return Some(SnapshotError::illegal_state(format!(
                    "transaction-aware snapshot {} has no candidate hybrid time",
                    entity.id
                )));
            };
            if let Err(e) =
                self.ctx
                    .tracker
                    .propose_hold(entity.id, candidate, &entity.catalog.tablet_ids())
            {
                return Some(e);
            }
        }

        let age = (Utc::now() - entity.creation_time)
            .to_std()
            .unwrap_or_default();
        if age > self.config.snapshot_timeout() {
            return Some(SnapshotError::timeout(format!(
                "snapshot {} not captured within {:?}",
                entity.id,
                self.config.snapshot_timeout()
            )));
        }

        entity
            .per_tablet_status
            .keys()
            .find(|t| self.ctx.catalog.is_tablet_deleted(t))
            .map(|t| SnapshotError::not_found(format!("tablet {} was deleted", t)))
    }

    /// Count pending deletes on tablets of dropped tables as done
    fn settle_dropped_tablets(&self, tracked: &mut TrackedSnapshot) {
        let id = tracked.entity.id;
        for tablet_id in tracked.entity.pending_tablets() {
            if self.ctx.catalog.is_tablet_deleted(&tablet_id)
                && tracked.entity.mark_tablet(&tablet_id, TabletOpStatus::Done)
            {
                debug!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, "Tablet of a dropped table, artifact counts as removed");
            }
        }
    }

    /// Apply the aggregate state transition, if any, and persist it
    fn advance_snapshot(&self, tracked: &mut TrackedSnapshot) {
        let target = if tracked.failure.is_some() && tracked.entity.state == SnapshotState::Creating {
            SnapshotState::Failed
        } else {
            match tracked.entity.aggregate() {
                Some(target) => target,
                None => return,
            }
        };

        let id = tracked.entity.id;
        let mut next = tracked.entity.clone();
        if let Err(e) = next.transition(target, Utc::now()) {
            error!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %e, "Invalid snapshot transition");
            return;
        }
        match target {
            SnapshotState::Complete => {
                next.snapshot_hybrid_time = if next.is_transaction_aware {
                    next.candidate_hybrid_time
                } else {
                    tracked.captured_at.values().max().copied()
                };
            }
            SnapshotState::Failed => {
                next.error = Some(tracked.failure.clone().unwrap_or_else(|| {
                    SnapshotError::internal("a participant failed to capture the snapshot")
                }));
            }
            _ => {}
        }

        if self.commit_snapshot(tracked, next).is_err() {
            return;
        }
        tracked.in_flight.clear();
        match target {
            SnapshotState::Complete => {
                self.ctx.tracker.release(&id);
                info!(
                    target: "tabletsnap::coordinator",
                    snapshot_id = %id,
                    snapshot_hybrid_time = ?tracked.entity.snapshot_hybrid_time,
                    "Snapshot complete"
                );
            }
            SnapshotState::Failed => {
                self.ctx.tracker.release(&id);
                warn!(
                    target: "tabletsnap::coordinator",
                    snapshot_id = %id,
                    error = ?tracked.entity.error,
                    "Snapshot failed"
                );
            }
            SnapshotState::Deleted => {
                info!(target: "tabletsnap::coordinator", snapshot_id = %id, "Snapshot deleted");
            }
            _ => {}
        }
    }

    /// Compare-and-set `next` over the tracked record
    ///
    /// On a version mismatch the tracked record is replaced by what the log
    /// holds. On any failure the in-memory state is left as it was.
    pub(crate) fn commit_snapshot(&self, tracked: &mut TrackedSnapshot, next: SnapshotEntity) -> Result<()> {
        let id = next.id;
        match self
            .ctx
            .log
            .put(&SysRecord::snapshot(next.clone()), Some(tracked.version))
        {
            Ok(version) => {
                tracked.entity = next;
                tracked.version = version;
                Ok(())
            }
            Err(e @ LogError::VersionMismatch { .. }) => {
                warn!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %e, "Snapshot record changed underneath, reloading");
                match self.ctx.log.get(&RecordKey::Snapshot(id)) {
                    Ok(Some(stored)) => {
                        if let SysEntry::Snapshot(entity) = stored.record.entry {
                            tracked.reload(entity, stored.version);
                        }
                    }
                    Ok(None) => {}
                    Err(reload) => {
                        error!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %reload, "Failed to reload snapshot record");
                    }
                }
                Err(e.into())
            }
            Err(e) => {
                error!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %e, "Failed to persist snapshot");
                Err(e.into())
            }
        }
    }

    fn dispatch_snapshot_rpcs(self: &Arc<Self>, id: SnapshotId, tracked: &mut TrackedSnapshot) {
        let phase = tracked.entity.state;
        let (op_id, operation) = match phase {
            SnapshotState::Creating => (
                OperationId::snapshot(id),
                TabletOperation::CreateSnapshot {
                    snapshot_id: id,
                    hybrid_time: tracked.entity.candidate_hybrid_time,
                },
            ),
            SnapshotState::Deleting => (
                OperationId::delete(id),
                TabletOperation::DeleteSnapshot { snapshot_id: id },
            ),
            _ => return,
        };

        for tablet_id in tracked.entity.pending_tablets() {
            if tracked.in_flight.contains_key(&tablet_id) {
                continue;
            }
            let generation = self.next_generation();
            let request = ParticipantRequest {
                op_id,
                tablet_id: tablet_id.clone(),
                operation: operation.clone(),
            };
            let inner = Arc::clone(self);
            let tablet = tablet_id.clone();
            let submitted = self.dispatcher.submit(move || {
                let result = inner.ctx.transport.send(request, inner.config.rpc_timeout());
                inner.on_snapshot_response(id, &tablet, phase, generation, result);
            });
            if let Err(e) = submitted {
                debug!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %e, "RPC not dispatched");
                break;
            }
            tracked.in_flight.insert(tablet_id, generation);
        }
    }

    fn on_snapshot_response(
        &self,
        id: SnapshotId,
        tablet_id: &TabletId,
        phase: SnapshotState,
        generation: u64,
        result: Result<TabletOpOutcome>,
    ) {
        let Some(cell) = self.snapshot_cell(&id) else {
            return;
        };
        let mut tracked = cell.lock();
        tracked.finish_rpc(tablet_id, generation);
        if tracked.entity.state != phase {
            return;
        }

        match (phase, result) {
            (_, Ok(TabletOpOutcome::InProgress)) => {}
            (SnapshotState::Creating, Ok(TabletOpOutcome::Applied { hybrid_time })) => {
                if tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Done) {
                    if let Some(ht) = hybrid_time {
                        tracked.captured_at.insert(tablet_id.clone(), ht);
                    }
                    debug!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, "Tablet captured");
                }
            }
            (SnapshotState::Deleting, Ok(TabletOpOutcome::Applied { .. })) => {
                tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Done);
            }
            (SnapshotState::Deleting, Err(e)) if e.is_not_found() => {
                tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Done);
            }
            (_, Err(e)) if e.is_retryable() => {
                debug!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, error = %e, "Retryable participant error");
            }
            (SnapshotState::Creating, Err(e)) => {
                warn!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, error = %e, "Tablet failed to capture");
                if tracked.entity.mark_tablet(tablet_id, TabletOpStatus::Failed) && tracked.failure.is_none() {
                    tracked.failure = Some(e);
                }
            }
            (_, Err(e)) => {
                warn!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, error = %e, "Tablet failed to drop artifact, will retry");
            }
            _ => {}
        }
        self.advance_snapshot(&mut tracked);
    }
}
