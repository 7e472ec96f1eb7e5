//! Cleanup sweep
//!
//! Purges DELETED and FAILED snapshots and terminal restorations once their
//! `finish_time` is older than the cleanup delay. A snapshot record is only
//! removed after every tablet confirmed its artifact is gone; the log
//! removal is a compare-and-set, and a record another instance already
//! removed counts as purged.

use super::state::PurgeProgress;
use super::CoordinatorInner;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    OperationId, ParticipantRequest, RecordKey, RestoreId, Result, SnapshotEntity, SnapshotId,
    SysEntry, TabletId, TabletOpOutcome, TabletOperation,
};
use tabletsnap_durability::LogError;
use tracing::{debug, error, info, warn};

fn aged(finish_time: Option<DateTime<Utc>>, now: DateTime<Utc>, delay: Duration) -> bool {
    finish_time.map_or(false, |finished| {
        (now - finished).to_std().map_or(false, |age| age >= delay)
    })
}

impl CoordinatorInner {
    pub(crate) fn run_cleanup(self: &Arc<Self>) {
        let records = match self.ctx.log.load_all() {
            Ok(records) => records,
            Err(e) => {
                error!(target: "tabletsnap::coordinator", error = %e, "Cleanup could not read the operation log");
                return;
            }
        };
        let now = Utc::now();
        let delay = self.cleanup_delay();

        let restoring: HashSet<SnapshotId> = records
            .iter()
            .filter_map(|stored| match &stored.record.entry {
                SysEntry::Restoration(r) if r.is_in_flight() => Some(r.source_snapshot_id),
                _ => None,
            })
            .collect();
        let live: HashSet<RecordKey> = records.iter().map(|s| s.record.key()).collect();

        for stored in records {
            match stored.record.entry {
                SysEntry::Snapshot(entity)
                    if entity.state.is_purgeable()
                        && aged(entity.finish_time, now, delay)
                        && !restoring.contains(&entity.id) =>
                {
                    self.purge_snapshot(&entity, stored.version);
                }
                SysEntry::Restoration(entity)
                    if !entity.is_in_flight() && aged(entity.finish_time, now, delay) =>
                {
                    if self.remove_record(RecordKey::Restoration(entity.id), stored.version) {
                        self.restorations.remove(&entity.id);
                        info!(target: "tabletsnap::coordinator", restore_id = %entity.id, "Restoration purged");
                    }
                }
                _ => {}
            }
        }

        // Terminal entities purged by another instance
        let gone: Vec<SnapshotId> = self
            .snapshot_cells()
            .into_iter()
            .filter(|(id, cell)| {
                !live.contains(&RecordKey::Snapshot(*id)) && cell.lock().entity.state.is_purgeable()
            })
            .map(|(id, _)| id)
            .collect();
        for id in gone {
            self.snapshots.remove(&id);
        }
        let gone: Vec<RestoreId> = self
            .restore_cells()
            .into_iter()
            .filter(|(id, cell)| {
                !live.contains(&RecordKey::Restoration(*id)) && !cell.lock().entity.is_in_flight()
            })
            .map(|(id, _)| id)
            .collect();
        for id in gone {
            self.restorations.remove(&id);
        }
        self.purges
            .retain(|id, _| live.contains(&RecordKey::Snapshot(*id)));
    }

    fn purge_snapshot(self: &Arc<Self>, entity: &SnapshotEntity, version: u64) {
        let id = entity.id;
        let progress = Arc::clone(
            self.purges
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(PurgeProgress::default())))
                .value(),
        );
        let mut progress = progress.lock();
        for tablet_id in entity.per_tablet_status.keys() {
            if self.ctx.catalog.is_tablet_deleted(tablet_id) {
                progress.confirmed.insert(tablet_id.clone());
            }
        }

        let remaining: Vec<TabletId> = entity
            .per_tablet_status
            .keys()
            .filter(|t| !progress.confirmed.contains(*t))
            .cloned()
            .collect();

        if remaining.is_empty() {
            if self.remove_record(RecordKey::Snapshot(id), version) {
                drop(progress);
                self.snapshots.remove(&id);
                self.purges.remove(&id);
                info!(target: "tabletsnap::coordinator", snapshot_id = %id, "Snapshot purged");
            }
            return;
        }

        for tablet_id in remaining {
            if progress.in_flight.contains_key(&tablet_id) {
                continue;
            }
            let generation = self.next_generation();
            let request = ParticipantRequest {
                op_id: OperationId::delete(id),
                tablet_id: tablet_id.clone(),
                operation: TabletOperation::DeleteSnapshot { snapshot_id: id },
            };
            let inner = Arc::clone(self);
            let tablet = tablet_id.clone();
            let submitted = self.dispatcher.submit(move || {
                let result = inner.ctx.transport.send(request, inner.config.rpc_timeout());
                inner.on_purge_response(id, &tablet, generation, result);
            });
            if let Err(e) = submitted {
                debug!(target: "tabletsnap::coordinator", snapshot_id = %id, error = %e, "Purge RPC not dispatched");
                break;
            }
            progress.in_flight.insert(tablet_id, generation);
        }
    }

    fn on_purge_response(
        &self,
        id: SnapshotId,
        tablet_id: &TabletId,
        generation: u64,
        result: Result<TabletOpOutcome>,
    ) {
        let Some(progress) = self.purges.get(&id).map(|p| Arc::clone(p.value())) else {
            return;
        };
        let mut progress = progress.lock();
        if progress.in_flight.get(tablet_id) == Some(&generation) {
            progress.in_flight.remove(tablet_id);
        }
        match result {
            Ok(TabletOpOutcome::Applied { .. }) => {
                progress.confirmed.insert(tablet_id.clone());
            }
            Err(e) if e.is_not_found() => {
                progress.confirmed.insert(tablet_id.clone());
            }
            Ok(TabletOpOutcome::InProgress) => {}
            Err(e) if e.is_retryable() => {
                debug!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, error = %e, "Purge will be retried");
            }
            Err(e) => {
                warn!(target: "tabletsnap::coordinator", snapshot_id = %id, %tablet_id, error = %e, "Purge failed, will retry");
            }
        }
    }

    /// Compare-and-set removal; `true` once the record is gone
    fn remove_record(&self, key: RecordKey, version: u64) -> bool {
        match self.ctx.log.remove(&key, version) {
            Ok(()) => true,
            Err(LogError::VersionMismatch { actual: None, .. }) => true,
            Err(e @ LogError::VersionMismatch { .. }) => {
                debug!(target: "tabletsnap::coordinator", %key, error = %e, "Record changed since the sweep read it");
                false
            }
            Err(e) => {
                error!(target: "tabletsnap::coordinator", %key, error = %e, "Failed to remove record");
                false
            }
        }
    }
}
