//! In-memory bookkeeping around persisted entities
//!
//! A tracked entity pairs the last committed record with its log version and
//! the volatile progress of the current leadership term: RPCs in flight,
//! captured hybrid times, and a failure waiting to be persisted. Only the
//! record survives a coordinator restart.

use std::collections::{BTreeMap, HashMap, HashSet};
use tabletsnap_core::{HybridTime, RestoreEntity, SnapshotEntity, SnapshotError, TabletId};

/// A snapshot as this coordinator instance sees it
#[derive(Debug)]
pub(crate) struct TrackedSnapshot {
    /// Last committed record
    pub entity: SnapshotEntity,
    /// Log version of `entity`
    pub version: u64,
    /// Tablets with an outstanding RPC, mapped to the RPC's generation
    pub in_flight: HashMap<TabletId, u64>,
    /// Capture point reported by each DONE tablet
    pub captured_at: BTreeMap<TabletId, HybridTime>,
    /// First terminal failure seen, applied on the next transition
    pub failure: Option<SnapshotError>,
}

impl TrackedSnapshot {
    pub(crate) fn new(entity: SnapshotEntity, version: u64) -> Self {
        Self {
            entity,
            version,
            in_flight: HashMap::new(),
            captured_at: BTreeMap::new(),
            failure: None,
        }
    }

    /// Replace the record with a newer one read back from the log
    pub(crate) fn reload(&mut self, mut entity: SnapshotEntity, version: u64) {
        if entity.state != self.entity.state {
            self.in_flight.clear();
            self.failure = None;
        }
        entity.reset_progress();
        self.entity = entity;
        self.version = version;
    }

    /// Record the end of an RPC if it is the latest one sent to `tablet`
    pub(crate) fn finish_rpc(&mut self, tablet: &TabletId, generation: u64) {
        if self.in_flight.get(tablet) == Some(&generation) {
            self.in_flight.remove(tablet);
        }
    }
}

/// A restoration as this coordinator instance sees it
#[derive(Debug)]
pub(crate) struct TrackedRestore {
    pub entity: RestoreEntity,
    pub version: u64,
    pub in_flight: HashMap<TabletId, u64>,
    pub failure: Option<SnapshotError>,
}

impl TrackedRestore {
    pub(crate) fn new(entity: RestoreEntity, version: u64) -> Self {
        Self {
            entity,
            version,
            in_flight: HashMap::new(),
            failure: None,
        }
    }

    pub(crate) fn reload(&mut self, mut entity: RestoreEntity, version: u64) {
        if entity.state != self.entity.state {
            self.in_flight.clear();
            self.failure = None;
        }
        entity.reset_progress();
        self.entity = entity;
        self.version = version;
    }

    pub(crate) fn finish_rpc(&mut self, tablet: &TabletId, generation: u64) {
        if self.in_flight.get(tablet) == Some(&generation) {
            self.in_flight.remove(tablet);
        }
    }
}

/// Purge progress of one terminal snapshot
#[derive(Debug, Default)]
pub(crate) struct PurgeProgress {
    /// Tablets that confirmed the artifact is gone
    pub confirmed: HashSet<TabletId>,
    /// Tablets with an outstanding purge RPC
    pub in_flight: HashMap<TabletId, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tabletsnap_core::{
        CatalogSlice, PartitionBounds, SnapshotId, SnapshotState, TableId, TabletMeta,
        TabletOpStatus,
    };

    fn entity() -> SnapshotEntity {
        let table = TableId::generate();
        let catalog = CatalogSlice {
            namespaces: vec![],
            tables: vec![],
            tablets: PartitionBounds::split(2)
                .into_iter()
                .map(|partition| TabletMeta {
                    id: TabletId::generate(),
                    table_id: table.clone(),
                    partition,
                })
                .collect(),
        };
        SnapshotEntity::new(SnapshotId::new(), vec![table], false, None, catalog, Utc::now())
    }

    #[test]
    fn test_stale_generation_keeps_in_flight() {
        let mut tracked = TrackedSnapshot::new(entity(), 1);
        let tablet = tracked.entity.pending_tablets()[0].clone();
        tracked.in_flight.insert(tablet.clone(), 7);

        tracked.finish_rpc(&tablet, 3);
        assert!(tracked.in_flight.contains_key(&tablet));
        tracked.finish_rpc(&tablet, 7);
        assert!(tracked.in_flight.is_empty());
    }

    #[test]
    fn test_reload_resets_progress_on_state_change() {
        let mut tracked = TrackedSnapshot::new(entity(), 1);
        let tablet = tracked.entity.pending_tablets()[0].clone();
        tracked.entity.mark_tablet(&tablet, TabletOpStatus::Done);
        tracked.in_flight.insert(tablet.clone(), 1);
        tracked.failure = Some(SnapshotError::timeout("deadline"));

        let mut newer = tracked.entity.clone();
        newer.transition(SnapshotState::Failed, Utc::now()).unwrap();
        tracked.reload(newer, 5);

        assert_eq!(tracked.version, 5);
        assert_eq!(tracked.entity.state, SnapshotState::Failed);
        assert!(tracked.in_flight.is_empty());
        assert!(tracked.failure.is_none());
    }
}
