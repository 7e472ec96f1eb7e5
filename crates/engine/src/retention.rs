//! History retention tracker
//!
//! Decides how far each tablet may garbage-collect history. The cutoff
//! pushed to a tablet is `now - retention_interval`, capped strictly below
//! the hybrid time of every snapshot hold covering that tablet.
//!
//! ## Holds
//!
//! A transaction-aware snapshot in CREATING pins its candidate time `T` with
//! [`HistoryRetentionTracker::propose_hold`]. The proposal and every cutoff
//! propagation run under one lock, so a hold is either refused (some covered
//! tablet already has `cutoff >= T`) or guaranteed to be respected by every
//! later propagation.
//!
//! Holds are leases. The coordinator renews them on each poll pass; a hold
//! whose owner stopped renewing (for instance because the coordinator is
//! down) lapses, and the cutoff is free to move past it.

use crate::config::RetentionConfig;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tabletsnap_core::{Clock, HybridTime, Result, SnapshotError, SnapshotId, TabletId};
use tabletsnap_tablet::TabletCluster;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Hold {
    hybrid_time: HybridTime,
    tablets: BTreeSet<TabletId>,
    expires_at: Instant,
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Tracks snapshot holds and propagates history cutoffs to tablets
pub struct HistoryRetentionTracker {
    cluster: Arc<TabletCluster>,
    clock: Arc<dyn Clock>,
    retention_interval_ms: AtomicU64,
    propagation_interval: Duration,
    hold_lease: Duration,
    holds: Mutex<HashMap<SnapshotId, Hold>>,
    stop: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryRetentionTracker {
    /// Tracker for the tablets of `cluster`
    pub fn new(cluster: Arc<TabletCluster>, clock: Arc<dyn Clock>, config: &RetentionConfig) -> Self {
        Self {
            cluster,
            clock,
            retention_interval_ms: AtomicU64::new(config.retention_interval_ms),
            propagation_interval: config.propagation_interval(),
            hold_lease: config.hold_lease(),
            holds: Mutex::new(HashMap::new()),
            stop: Arc::new(StopSignal::default()),
            thread: Mutex::new(None),
        }
    }

    /// Current retention interval
    pub fn retention_interval(&self) -> Duration {
        Duration::from_millis(self.retention_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the retention interval at runtime
    pub fn set_retention_interval(&self, interval: Duration) {
        self.retention_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current history cutoff of a hosted tablet
    pub fn history_cutoff(&self, tablet_id: &TabletId) -> Option<HybridTime> {
        self.cluster
            .peer(tablet_id)
            .map(|p| p.tablet().history_cutoff())
    }

    /// Pin `hybrid_time` on `tablets` for `owner`
    ///
    /// Fails with `HistoryNotAvailable` if any covered tablet already has a
    /// cutoff at or above `hybrid_time`. Proposing again for the same owner
    /// replaces its hold and restarts the lease.
    pub fn propose_hold(
        &self,
        owner: SnapshotId,
        hybrid_time: HybridTime,
        tablets: &[TabletId],
    ) -> Result<()> {
        let mut holds = self.holds.lock();
        for tablet_id in tablets {
            if let Some(cutoff) = self.history_cutoff(tablet_id) {
                if hybrid_time <= cutoff {
                    warn!(
                        target: "tabletsnap::retention",
                        snapshot_id = %owner,
                        %tablet_id,
                        requested = %hybrid_time,
                        %cutoff,
                        "Hold refused"
                    );
                    return Err(SnapshotError::HistoryNotAvailable {
                        requested: hybrid_time,
                        cutoff,
                    });
                }
            }
        }
        holds.insert(
            owner,
            Hold {
                hybrid_time,
                tablets: tablets.iter().cloned().collect(),
                expires_at: Instant::now() + self.hold_lease,
            },
        );
        debug!(
            target: "tabletsnap::retention",
            snapshot_id = %owner,
            %hybrid_time,
            tablets = tablets.len(),
            "Hold placed"
        );
        Ok(())
    }

    /// Extend the lease of `owner`'s hold; `false` if it has lapsed
    pub fn renew(&self, owner: &SnapshotId) -> bool {
        let mut holds = self.holds.lock();
        match holds.get_mut(owner) {
            Some(hold) if hold.expires_at > Instant::now() => {
                hold.expires_at = Instant::now() + self.hold_lease;
                true
            }
            Some(_) => {
                holds.remove(owner);
                false
            }
            None => false,
        }
    }

    /// Drop `owner`'s hold
    pub fn release(&self, owner: &SnapshotId) {
        if self.holds.lock().remove(owner).is_some() {
            debug!(target: "tabletsnap::retention", snapshot_id = %owner, "Hold released");
        }
    }

    /// Hybrid time held for `owner`, if any
    pub fn hold_of(&self, owner: &SnapshotId) -> Option<HybridTime> {
        self.holds.lock().get(owner).map(|h| h.hybrid_time)
    }

    /// Smallest live hold covering `tablet_id`
    pub fn min_hold(&self, tablet_id: &TabletId) -> Option<HybridTime> {
        let now = Instant::now();
        self.holds
            .lock()
            .values()
            .filter(|h| h.expires_at > now && h.tablets.contains(tablet_id))
            .map(|h| h.hybrid_time)
            .min()
    }

    /// One propagation round; returns how many tablets moved their cutoff
    pub fn propagate_once(&self) -> usize {
        let mut holds = self.holds.lock();
        let now = Instant::now();
        holds.retain(|owner, hold| {
            let live = hold.expires_at > now;
            if !live {
                info!(
                    target: "tabletsnap::retention",
                    snapshot_id = %owner,
                    hybrid_time = %hold.hybrid_time,
                    "Hold lease lapsed"
                );
            }
            live
        });

        let base = self.clock.now().saturating_sub(self.retention_interval());
        let mut advanced = 0;
        for peer in self.cluster.running_peers() {
            let tablet = peer.tablet();
            let cap = holds
                .values()
                .filter(|h| h.tablets.contains(tablet.id()))
                .map(|h| h.hybrid_time.decremented())
                .min();
            let target = match cap {
                Some(cap) => base.min(cap),
                None => base,
            };
            let before = tablet.history_cutoff();
            if tablet.advance_history_cutoff(target) > before {
                advanced += 1;
            }
        }
        advanced
    }

    /// Run [`propagate_once`](Self::propagate_once) every propagation interval on a named thread
    pub fn spawn(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        *self.stop.stopped.lock() = false;
        let tracker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("tabletsnap-retention".into())
            .spawn(move || tracker.run())?;
        *slot = Some(handle);
        Ok(())
    }

    fn run(&self) {
        info!(target: "tabletsnap::retention", "History retention thread started");
        loop {
            self.propagate_once();
            let mut stopped = self.stop.stopped.lock();
            if !*stopped {
                self.stop
                    .cond
                    .wait_for(&mut stopped, self.propagation_interval);
            }
            if *stopped {
                break;
            }
        }
        info!(target: "tabletsnap::retention", "History retention thread stopped");
    }

    /// Stop the propagation thread
    pub fn shutdown(&self) {
        {
            let mut stopped = self.stop.stopped.lock();
            *stopped = true;
            self.stop.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tabletsnap_core::{HybridClock, PartitionBounds, TableId, TabletMeta};
    use tempfile::TempDir;

    fn setup(dir: &TempDir, config: RetentionConfig) -> (Arc<HistoryRetentionTracker>, TabletId) {
        let clock: Arc<dyn Clock> = Arc::new(HybridClock::default());
        let cluster = Arc::new(TabletCluster::with_servers(dir.path(), clock.clone(), 1).unwrap());
        let tablet_id = TabletId::generate();
        cluster.servers()[0]
            .create_tablet(TabletMeta {
                id: tablet_id.clone(),
                table_id: TableId::from_raw("t"),
                partition: PartitionBounds::split(1)[0],
            })
            .unwrap();
        (
            Arc::new(HistoryRetentionTracker::new(cluster, clock, &config)),
            tablet_id,
        )
    }

    fn config(retention_ms: u64, lease_ms: u64) -> RetentionConfig {
        RetentionConfig {
            retention_interval_ms: retention_ms,
            propagation_interval_ms: 5,
            hold_lease_ms: lease_ms,
        }
    }

    #[test]
    fn test_cutoff_lags_now_by_interval() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(60_000, 1_000));
        let before = tracker.clock.now();
        tracker.propagate_once();
        let cutoff = tracker.history_cutoff(&tablet).unwrap();
        assert!(cutoff > HybridTime::MIN);
        assert!(cutoff <= before.saturating_sub(Duration::from_secs(59)));
    }

    #[test]
    fn test_hold_caps_cutoff() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(0, 60_000));
        let pinned = tracker.clock.now();
        tracker
            .propose_hold(SnapshotId::new(), pinned, &[tablet.clone()])
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        tracker.propagate_once();
        let cutoff = tracker.history_cutoff(&tablet).unwrap();
        assert!(cutoff < pinned);
        assert_eq!(tracker.min_hold(&tablet), Some(pinned));
    }

    #[test]
    fn test_hold_below_cutoff_refused() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(0, 60_000));
        let old = tracker.clock.now();
        std::thread::sleep(Duration::from_millis(2));
        tracker.propagate_once();
        let err = tracker
            .propose_hold(SnapshotId::new(), old, &[tablet])
            .unwrap_err();
        assert!(matches!(err, SnapshotError::HistoryNotAvailable { .. }));
    }

    #[test]
    fn test_released_hold_lets_cutoff_advance() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(0, 60_000));
        let owner = SnapshotId::new();
        let pinned = tracker.clock.now();
        tracker.propose_hold(owner, pinned, &[tablet.clone()]).unwrap();
        tracker.release(&owner);
        std::thread::sleep(Duration::from_millis(2));
        tracker.propagate_once();
        assert!(tracker.history_cutoff(&tablet).unwrap() > pinned);
    }

    #[test]
    fn test_lapsed_lease_stops_capping() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(0, 20));
        let owner = SnapshotId::new();
        let pinned = tracker.clock.now();
        tracker.propose_hold(owner, pinned, &[tablet.clone()]).unwrap();
        assert!(tracker.renew(&owner));

        std::thread::sleep(Duration::from_millis(40));
        tracker.propagate_once();
        assert!(tracker.history_cutoff(&tablet).unwrap() > pinned);
        assert!(!tracker.renew(&owner));
        assert_eq!(tracker.hold_of(&owner), None);
    }

    #[test]
    fn test_background_thread_propagates() {
        let dir = TempDir::new().unwrap();
        let (tracker, tablet) = setup(&dir, config(0, 60_000));
        tracker.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while tracker.history_cutoff(&tablet).unwrap() == HybridTime::MIN {
            assert!(Instant::now() < deadline, "cutoff never propagated");
            std::thread::sleep(Duration::from_millis(5));
        }
        tracker.shutdown();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn accepted_holds_stay_above_cutoff(
            ages_ms in proptest::collection::vec(0u64..5_000, 1..6),
            retention_ms in 0u64..3_000,
        ) {
            let dir = TempDir::new().unwrap();
            let (tracker, tablet) = setup(&dir, config(retention_ms, 60_000));
            let now = tracker.clock.now();
            let mut accepted = Vec::new();
            for age in ages_ms {
                let pinned = now.saturating_sub(Duration::from_millis(age));
                if tracker.propose_hold(SnapshotId::new(), pinned, &[tablet.clone()]).is_ok() {
                    accepted.push(pinned);
                }
                tracker.propagate_once();
            }
            let cutoff = tracker.history_cutoff(&tablet).unwrap();
            for pinned in accepted {
                prop_assert!(cutoff < pinned);
            }
        }
    }
}
