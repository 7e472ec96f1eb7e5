//! Snapshot coordinator
//!
//! Owns the lifecycle of snapshot and restoration entities:
//! - persists every state change to the [`OperationLog`] with compare-and-set
//! - fans participant RPCs out on the [`RpcDispatcher`] and folds the
//!   answers into per-tablet status
//! - drives deadlines, hold renewal and the cleanup sweep from a poll loop
//!
//! Entities live in `DashMap`s, one `parking_lot::Mutex` each. A lock is
//! never held across an RPC; responses come back on dispatcher workers and
//! take the entity lock to apply themselves.
//!
//! # Failover
//!
//! A new instance rebuilds everything from the log in
//! [`SnapshotCoordinator::start`]: per-tablet progress of non-terminal
//! entities is reset to PENDING (participants are idempotent, so re-sending
//! is safe) and transaction-aware holds are proposed again before the
//! instance accepts requests.

mod cleanup;
mod restore;
mod snapshot;
mod state;

use crate::catalog::Catalog;
use crate::config::CoordinatorConfig;
use crate::dispatcher::{DispatcherStats, RpcDispatcher};
use crate::retention::HistoryRetentionTracker;
use crate::translator;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use state::{PurgeProgress, TrackedRestore, TrackedSnapshot};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tabletsnap_core::{
    Clock, HybridTime, ImportMapping, ParticipantTransport, RestoreEntity, RestoreId, Result,
    SnapshotEntity, SnapshotError, SnapshotId, SnapshotState, SysEntry, TableId,
};
use tabletsnap_durability::OperationLog;
use tracing::{info, warn};

/// Collaborators shared by successive coordinator instances
///
/// Everything here outlives a coordinator: a restarted coordinator is built
/// from the same context.
#[derive(Clone)]
pub struct CoordinatorContext {
    /// Persisted operation log
    pub log: Arc<dyn OperationLog>,
    /// Participant RPC surface
    pub transport: Arc<dyn ParticipantTransport>,
    /// Namespaces, tables and tablet placement
    pub catalog: Arc<Catalog>,
    /// History holds
    pub tracker: Arc<HistoryRetentionTracker>,
    /// Cluster clock
    pub clock: Arc<dyn Clock>,
}

/// Selection for [`SnapshotCoordinator::list_snapshots`]
///
/// Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshotsFilter {
    /// Only this snapshot
    pub snapshot_id: Option<SnapshotId>,
    /// Only snapshots covering this table
    pub table_id: Option<TableId>,
    /// Only snapshots in one of these states
    pub states: Vec<SnapshotState>,
}

impl ListSnapshotsFilter {
    /// Filter matching one snapshot
    pub fn by_id(id: SnapshotId) -> Self {
        Self {
            snapshot_id: Some(id),
            ..Self::default()
        }
    }

    /// Filter matching snapshots of one table
    pub fn by_table(table_id: TableId) -> Self {
        Self {
            table_id: Some(table_id),
            ..Self::default()
        }
    }

    /// Restrict to `states`
    pub fn with_states(mut self, states: &[SnapshotState]) -> Self {
        self.states = states.to_vec();
        self
    }

    fn matches(&self, entity: &SnapshotEntity) -> bool {
        self.snapshot_id.map_or(true, |id| id == entity.id)
            && self
                .table_id
                .as_ref()
                .map_or(true, |t| entity.table_ids.contains(t))
            && (self.states.is_empty() || self.states.contains(&entity.state))
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct CoordinatorInner {
    config: CoordinatorConfig,
    ctx: CoordinatorContext,
    dispatcher: RpcDispatcher,
    snapshots: DashMap<SnapshotId, Arc<Mutex<TrackedSnapshot>>>,
    restorations: DashMap<RestoreId, Arc<Mutex<TrackedRestore>>>,
    purges: DashMap<SnapshotId, Arc<Mutex<PurgeProgress>>>,
    cleanup_delay_ms: AtomicU64,
    generation: AtomicU64,
    accepting: AtomicBool,
}

impl CoordinatorInner {
    fn ensure_accepting(&self) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SnapshotError::unavailable(
                "snapshot coordinator is not accepting requests",
            ));
        }
        Ok(())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms.load(Ordering::Relaxed))
    }

    fn snapshot_cell(&self, id: &SnapshotId) -> Option<Arc<Mutex<TrackedSnapshot>>> {
        self.snapshots.get(id).map(|c| Arc::clone(c.value()))
    }

    fn restore_cell(&self, id: &RestoreId) -> Option<Arc<Mutex<TrackedRestore>>> {
        self.restorations.get(id).map(|c| Arc::clone(c.value()))
    }

    fn snapshot_cells(&self) -> Vec<(SnapshotId, Arc<Mutex<TrackedSnapshot>>)> {
        self.snapshots
            .iter()
            .map(|c| (*c.key(), Arc::clone(c.value())))
            .collect()
    }

    fn restore_cells(&self) -> Vec<(RestoreId, Arc<Mutex<TrackedRestore>>)> {
        self.restorations
            .iter()
            .map(|c| (*c.key(), Arc::clone(c.value())))
            .collect()
    }

    /// In-flight restorations sourced from `snapshot_id`
    fn restoring_from(&self, snapshot_id: &SnapshotId) -> bool {
        self.restore_cells().into_iter().any(|(_, cell)| {
            let tracked = cell.lock();
            tracked.entity.is_in_flight() && tracked.entity.source_snapshot_id == *snapshot_id
        })
    }

    /// In-flight restorations touching any of `tables`
    fn restoring_tables(&self, tables: &[TableId]) -> Option<RestoreId> {
        self.restore_cells().into_iter().find_map(|(id, cell)| {
            let tracked = cell.lock();
            let overlaps = tables.iter().any(|t| tracked.entity.table_ids.contains(t));
            (tracked.entity.is_in_flight() && overlaps).then_some(id)
        })
    }

    /// One pass over every tracked entity, then the cleanup sweep
    fn poll_once(self: &Arc<Self>) {
        for (id, _) in self.snapshot_cells() {
            self.process_snapshot(id);
        }
        for (id, _) in self.restore_cells() {
            self.process_restore(id);
        }
        self.run_cleanup();
    }

    /// Rebuild the cache from the log
    fn load(&self) -> Result<()> {
        let records = self.ctx.log.load_all()?;
        let mut snapshots = 0usize;
        let mut restorations = 0usize;

        for stored in records {
            match stored.record.entry {
                SysEntry::Snapshot(mut entity) => {
                    entity.reset_progress();
                    let mut tracked = TrackedSnapshot::new(entity, stored.version);
                    self.rehold(&mut tracked);
                    self.snapshots
                        .insert(tracked.entity.id, Arc::new(Mutex::new(tracked)));
                    snapshots += 1;
                }
                SysEntry::Restoration(mut entity) => {
                    entity.reset_progress();
                    self.restorations.insert(
                        entity.id,
                        Arc::new(Mutex::new(TrackedRestore::new(entity, stored.version))),
                    );
                    restorations += 1;
                }
            }
        }

        info!(
            target: "tabletsnap::coordinator",
            snapshots,
            restorations,
            "Coordinator state rebuilt from operation log"
        );
        Ok(())
    }

    /// Re-establish the hold of a transaction-aware snapshot still being created
    fn rehold(&self, tracked: &mut TrackedSnapshot) {
        let entity = &tracked.entity;
        if entity.state != SnapshotState::Creating || !entity.is_transaction_aware {
            return;
        }
        let Some(candidate) = entity.candidate_hybrid_time else {
            tracked.failure = Some(SnapshotError::illegal_state(format!(
                "transaction-aware snapshot {} has no candidate hybrid time",
                entity.id
            )));
            return;
        };
        let tablets = entity.catalog.tablet_ids();
        if let Err(e) = self.ctx.tracker.propose_hold(entity.id, candidate, &tablets) {
            warn!(
                target: "tabletsnap::coordinator",
                snapshot_id = %entity.id,
                error = %e,
                "Could not re-establish history hold"
            );
            tracked.failure = Some(e);
        }
    }
}

/// Coordinator of snapshots and restorations
pub struct SnapshotCoordinator {
    inner: Arc<CoordinatorInner>,
    stop: Arc<StopSignal>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotCoordinator {
    /// Rebuild from the log and start the poll thread
    pub fn start(config: CoordinatorConfig, ctx: CoordinatorContext) -> Result<Self> {
        let coordinator = Self::recover(config, ctx)?;
        coordinator.spawn_poller()?;
        Ok(coordinator)
    }

    /// Rebuild from the log without a poll thread
    ///
    /// The caller drives progress with [`poll_once`](Self::poll_once).
    pub fn recover(config: CoordinatorConfig, ctx: CoordinatorContext) -> Result<Self> {
        config.validate()?;
        let dispatcher = RpcDispatcher::with_overflow(config.rpc_workers, config.rpc_max_workers)?;
        let inner = Arc::new(CoordinatorInner {
            cleanup_delay_ms: AtomicU64::new(config.cleanup_delay_ms),
            config,
            ctx,
            dispatcher,
            snapshots: DashMap::new(),
            restorations: DashMap::new(),
            purges: DashMap::new(),
            generation: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
        });

        inner.load()?;
        inner.accepting.store(true, Ordering::Release);
        inner.poll_once();

        Ok(Self {
            inner,
            stop: Arc::new(StopSignal::default()),
            poller: Mutex::new(None),
        })
    }

    fn spawn_poller(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.stop);
        let interval = self.inner.config.poll_interval();
        let handle = std::thread::Builder::new()
            .name("tabletsnap-coordinator".into())
            .spawn(move || {
                info!(target: "tabletsnap::coordinator", "Coordinator poll thread started");
                loop {
                    {
                        let mut stopped = stop.stopped.lock();
                        if !*stopped {
                            stop.cond.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    inner.poll_once();
                }
                info!(target: "tabletsnap::coordinator", "Coordinator poll thread stopped");
            })?;
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    /// Start a snapshot of `table_ids`
    ///
    /// Transaction-aware snapshots pin a single hybrid time across every
    /// tablet; others let each tablet capture at its own current time.
    pub fn create_snapshot(&self, table_ids: &[TableId], transaction_aware: bool) -> Result<SnapshotId> {
        self.inner.create_snapshot(table_ids.to_vec(), transaction_aware)
    }

    /// Move a COMPLETE snapshot to DELETING
    pub fn delete_snapshot(&self, id: SnapshotId) -> Result<()> {
        self.inner.delete_snapshot(id)
    }

    /// Snapshots matching `filter`, oldest first
    pub fn list_snapshots(&self, filter: &ListSnapshotsFilter) -> Result<Vec<SnapshotEntity>> {
        self.inner.ensure_accepting()?;
        let mut snapshots: Vec<SnapshotEntity> = self
            .inner
            .snapshot_cells()
            .into_iter()
            .map(|(_, cell)| cell.lock().entity.clone())
            .filter(|e| filter.matches(e))
            .collect();
        snapshots.sort_by_key(|e| (e.creation_time, e.id));
        Ok(snapshots)
    }

    /// One snapshot
    pub fn snapshot(&self, id: SnapshotId) -> Result<SnapshotEntity> {
        self.inner.ensure_accepting()?;
        self.inner
            .snapshot_cell(&id)
            .map(|cell| cell.lock().entity.clone())
            .ok_or_else(|| SnapshotError::not_found(format!("snapshot {}", id)))
    }

    /// Roll the snapshot's tables back
    ///
    /// Target hybrid time:
    /// - `restore_ht - interval` when both are given
    /// - `restore_ht` when only it is given
    /// - `now - interval` when only the interval is given
    /// - the snapshot hybrid time otherwise
    pub fn restore_snapshot(
        &self,
        id: SnapshotId,
        restore_ht: Option<HybridTime>,
        acceptable_interval: Option<Duration>,
    ) -> Result<RestoreId> {
        self.inner.restore_snapshot(id, restore_ht, acceptable_interval)
    }

    /// Restorations, optionally only those of one snapshot, oldest first
    pub fn list_restorations(&self, snapshot_id: Option<SnapshotId>) -> Result<Vec<RestoreEntity>> {
        self.inner.ensure_accepting()?;
        let mut restorations: Vec<RestoreEntity> = self
            .inner
            .restore_cells()
            .into_iter()
            .map(|(_, cell)| cell.lock().entity.clone())
            .filter(|e| snapshot_id.map_or(true, |s| e.source_snapshot_id == s))
            .collect();
        restorations.sort_by_key(|e| (e.creation_time, e.id));
        Ok(restorations)
    }

    /// One restoration
    pub fn restoration(&self, id: RestoreId) -> Result<RestoreEntity> {
        self.inner.ensure_accepting()?;
        self.inner
            .restore_cell(&id)
            .map(|cell| cell.lock().entity.clone())
            .ok_or_else(|| SnapshotError::not_found(format!("restoration {}", id)))
    }

    /// Encode the metadata of a COMPLETE snapshot
    pub fn export_snapshot_meta(&self, id: SnapshotId) -> Result<Vec<u8>> {
        let snapshot = self.snapshot(id)?;
        translator::export(&snapshot)
    }

    /// Recreate or match the objects described by an exported blob
    pub fn import_snapshot_meta(&self, blob: &[u8]) -> Result<ImportMapping> {
        self.inner.ensure_accepting()?;
        translator::import(&self.inner.ctx.catalog, blob)
    }

    /// Whether every table of an import can be opened
    pub fn is_import_done(&self, mapping: &ImportMapping) -> Result<bool> {
        translator::is_import_done(&self.inner.ctx.catalog, mapping)
    }

    /// Run one poll pass on the calling thread
    pub fn poll_once(&self) {
        self.inner.poll_once();
    }

    /// Block until every RPC submitted so far has been answered
    pub fn drain_rpcs(&self) {
        self.inner.dispatcher.drain();
    }

    /// Change the age after which terminal records are purged
    pub fn set_cleanup_delay(&self, delay: Duration) {
        self.inner
            .cleanup_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current cleanup delay
    pub fn cleanup_delay(&self) -> Duration {
        self.inner.cleanup_delay()
    }

    /// RPC worker pool metrics
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.inner.dispatcher.stats()
    }

    /// Stop accepting requests, stop polling and wait for outstanding RPCs
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut stopped = self.stop.stopped.lock();
            *stopped = true;
            self.stop.cond.notify_all();
        }
        if let Some(handle) = self.poller.lock().take() {
            let _ = handle.join();
        }
        self.inner.dispatcher.shutdown();
        info!(target: "tabletsnap::coordinator", "Snapshot coordinator shut down");
    }
}

impl Drop for SnapshotCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
