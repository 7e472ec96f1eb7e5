//! Snapshot and restoration entities
//!
//! These are the records the coordinator persists, one per entity, keyed by
//! id. The coordinator is the only writer; participants only report
//! outcomes that the coordinator folds in through [`SnapshotEntity::mark_tablet`]
//! and [`RestoreEntity::mark_tablet`].
//!
//! ## Snapshot State Machine
//!
//! ```text
//! *CREATING ──all tablets DONE──────────────▶ COMPLETE
//! CREATING  ──tablet FAILED / timeout───────▶ FAILED
//! COMPLETE  ──delete request────────────────▶ DELETING
//! DELETING  ──all tablets confirmed removal─▶ DELETED
//! ```
//!
//! FAILED and DELETED are left only by removal of the record after the
//! cleanup delay.

use crate::error::{Result, SnapshotError};
use crate::hybrid_time::HybridTime;
use crate::metadata::CatalogSlice;
use crate::types::{RestoreId, SnapshotId, TableId, TabletId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current [`SysRecord`] format version
pub const SYS_RECORD_FORMAT_VERSION: u8 = 1;

/// Aggregate state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Participants are still capturing
    Creating,
    /// Every participant captured
    Complete,
    /// A participant failed or the deadline passed
    Failed,
    /// Participants are removing their artifacts
    Deleting,
    /// Every participant confirmed removal
    Deleted,
}

impl SnapshotState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(&self, next: SnapshotState) -> bool {
        use SnapshotState::*;
        matches!(
            (self, next),
            (Creating, Complete) | (Creating, Failed) | (Complete, Deleting) | (Deleting, Deleted)
        )
    }

    /// States the coordinator still drives with participant RPCs
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SnapshotState::Creating | SnapshotState::Deleting)
    }

    /// States whose record is removed after the cleanup delay
    pub fn is_purgeable(&self) -> bool {
        matches!(self, SnapshotState::Failed | SnapshotState::Deleted)
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotState::Creating => "CREATING",
            SnapshotState::Complete => "COMPLETE",
            SnapshotState::Failed => "FAILED",
            SnapshotState::Deleting => "DELETING",
            SnapshotState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Per-tablet progress of the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabletOpStatus {
    /// No confirmation yet
    Pending,
    /// Participant confirmed
    Done,
    /// Participant reported an unrecoverable failure
    Failed,
}

/// Snapshot entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntity {
    /// Immutable id
    pub id: SnapshotId,
    /// Aggregate state
    pub state: SnapshotState,
    /// Tables covered, ordered and de-duplicated
    pub table_ids: Vec<TableId>,
    /// Whether a consistent hybrid-time cutoff is enforced
    pub is_transaction_aware: bool,
    /// Hybrid time fixed at creation for transaction-aware snapshots
    pub candidate_hybrid_time: Option<HybridTime>,
    /// Consistency point, set once when the snapshot completes
    pub snapshot_hybrid_time: Option<HybridTime>,
    /// Progress of the current phase, per tablet
    pub per_tablet_status: BTreeMap<TabletId, TabletOpStatus>,
    /// Catalog objects captured at creation
    pub catalog: CatalogSlice,
    /// Wall-clock creation time
    pub creation_time: DateTime<Utc>,
    /// Wall-clock time the delete request was accepted
    pub delete_start_time: Option<DateTime<Utc>>,
    /// Wall-clock time a terminal state (COMPLETE, FAILED, DELETED) was reached
    pub finish_time: Option<DateTime<Utc>>,
    /// Error that failed the snapshot
    pub error: Option<SnapshotError>,
}

impl SnapshotEntity {
    /// New entity in CREATING with every tablet of `catalog` pending
    pub fn new(
        id: SnapshotId,
        table_ids: Vec<TableId>,
        is_transaction_aware: bool,
        candidate_hybrid_time: Option<HybridTime>,
        catalog: CatalogSlice,
        creation_time: DateTime<Utc>,
    ) -> Self {
        let per_tablet_status = catalog
            .tablets
            .iter()
            .map(|t| (t.id.clone(), TabletOpStatus::Pending))
            .collect();
        Self {
            id,
            state: SnapshotState::Creating,
            table_ids,
            is_transaction_aware,
            candidate_hybrid_time,
            snapshot_hybrid_time: None,
            per_tablet_status,
            catalog,
            creation_time,
            delete_start_time: None,
            finish_time: None,
            error: None,
        }
    }

    /// Move to `next`, refusing edges the state machine does not have
    pub fn transition(&mut self, next: SnapshotState, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        match next {
            SnapshotState::Deleting => {
                self.delete_start_time = Some(at);
                self.finish_time = None;
                for status in self.per_tablet_status.values_mut() {
                    *status = TabletOpStatus::Pending;
                }
            }
            SnapshotState::Complete | SnapshotState::Failed | SnapshotState::Deleted => {
                self.finish_time = Some(at);
            }
            SnapshotState::Creating => {}
        }
        Ok(())
    }

    /// Record a participant outcome; returns whether anything changed
    ///
    /// Outcomes for unknown tablets and repeats for settled tablets are ignored.
    pub fn mark_tablet(&mut self, tablet_id: &TabletId, status: TabletOpStatus) -> bool {
        match self.per_tablet_status.get_mut(tablet_id) {
            Some(current) if *current == TabletOpStatus::Pending => {
                *current = status;
                status != TabletOpStatus::Pending
            }
            _ => false,
        }
    }

    /// State the per-tablet statuses call for, if different from the current one
    pub fn aggregate(&self) -> Option<SnapshotState> {
        match self.state {
            SnapshotState::Creating => {
                if self.count(TabletOpStatus::Failed) > 0 {
                    Some(SnapshotState::Failed)
                } else if self.all(TabletOpStatus::Done) {
                    Some(SnapshotState::Complete)
                } else {
                    None
                }
            }
            SnapshotState::Deleting => {
                if self.all(TabletOpStatus::Done) {
                    Some(SnapshotState::Deleted)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Tablets still awaiting confirmation in the current phase
    pub fn pending_tablets(&self) -> Vec<TabletId> {
        self.per_tablet_status
            .iter()
            .filter(|(_, s)| **s == TabletOpStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget which tablets answered in the current phase
    ///
    /// Used after failover: the answers are rebuilt by polling again.
    pub fn reset_progress(&mut self) {
        if self.state.is_in_flight() {
            for status in self.per_tablet_status.values_mut() {
                *status = TabletOpStatus::Pending;
            }
        }
    }

    /// Whether any of `tables` is covered by this snapshot
    pub fn overlaps(&self, tables: &[TableId]) -> bool {
        tables.iter().any(|t| self.table_ids.contains(t))
    }

    fn count(&self, wanted: TabletOpStatus) -> usize {
        self.per_tablet_status
            .values()
            .filter(|s| **s == wanted)
            .count()
    }

    fn all(&self, wanted: TabletOpStatus) -> bool {
        self.per_tablet_status.values().all(|s| *s == wanted)
    }
}

/// Aggregate state of a restoration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestoreState {
    /// Participants are still rolling back
    Creating,
    /// Every participant restored
    Complete,
    /// A participant failed or the deadline passed
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreState::Creating => "CREATING",
            RestoreState::Complete => "COMPLETE",
            RestoreState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Restoration entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreEntity {
    /// Immutable id
    pub id: RestoreId,
    /// Snapshot being restored
    pub source_snapshot_id: SnapshotId,
    /// Point-in-time target; `None` restores to the snapshot hybrid time
    pub restore_hybrid_time: Option<HybridTime>,
    /// Aggregate state
    pub state: RestoreState,
    /// Tables touched by the restoration
    pub table_ids: Vec<TableId>,
    /// Progress per tablet
    pub per_tablet_status: BTreeMap<TabletId, TabletOpStatus>,
    /// Wall-clock creation time
    pub creation_time: DateTime<Utc>,
    /// Wall-clock time a terminal state was reached
    pub finish_time: Option<DateTime<Utc>>,
    /// Error that failed the restoration
    pub error: Option<SnapshotError>,
}

impl RestoreEntity {
    /// New restoration of `snapshot` in CREATING
    pub fn new(
        id: RestoreId,
        snapshot: &SnapshotEntity,
        restore_hybrid_time: Option<HybridTime>,
        creation_time: DateTime<Utc>,
    ) -> Self {
        let per_tablet_status = snapshot
            .per_tablet_status
            .keys()
            .map(|t| (t.clone(), TabletOpStatus::Pending))
            .collect();
        Self {
            id,
            source_snapshot_id: snapshot.id,
            restore_hybrid_time,
            state: RestoreState::Creating,
            table_ids: snapshot.table_ids.clone(),
            per_tablet_status,
            creation_time,
            finish_time: None,
            error: None,
        }
    }

    /// Whether the restoration is still running
    pub fn is_in_flight(&self) -> bool {
        self.state == RestoreState::Creating
    }

    /// Move to a terminal state
    pub fn finish(&mut self, next: RestoreState, at: DateTime<Utc>) -> Result<()> {
        if self.state != RestoreState::Creating || next == RestoreState::Creating {
            return Err(SnapshotError::illegal_state(format!(
                "restoration {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.finish_time = Some(at);
        Ok(())
    }

    /// Record a participant outcome; returns whether anything changed
    pub fn mark_tablet(&mut self, tablet_id: &TabletId, status: TabletOpStatus) -> bool {
        match self.per_tablet_status.get_mut(tablet_id) {
            Some(current) if *current == TabletOpStatus::Pending => {
                *current = status;
                status != TabletOpStatus::Pending
            }
            _ => false,
        }
    }

    /// Terminal state the per-tablet statuses call for
    pub fn aggregate(&self) -> Option<RestoreState> {
        if self.state != RestoreState::Creating {
            return None;
        }
        let statuses = self.per_tablet_status.values();
        if statuses.clone().any(|s| *s == TabletOpStatus::Failed) {
            Some(RestoreState::Failed)
        } else if statuses.clone().all(|s| *s == TabletOpStatus::Done) {
            Some(RestoreState::Complete)
        } else {
            None
        }
    }

    /// Tablets still awaiting confirmation
    pub fn pending_tablets(&self) -> Vec<TabletId> {
        self.per_tablet_status
            .iter()
            .filter(|(_, s)| **s == TabletOpStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget which tablets answered (after failover)
    pub fn reset_progress(&mut self) {
        if self.is_in_flight() {
            for status in self.per_tablet_status.values_mut() {
                *status = TabletOpStatus::Pending;
            }
        }
    }
}

/// Key of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    /// Snapshot record
    Snapshot(SnapshotId),
    /// Restoration record
    Restoration(RestoreId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Snapshot(id) => write!(f, "snapshot/{}", id),
            RecordKey::Restoration(id) => write!(f, "restoration/{}", id),
        }
    }
}

/// Entity payload of a persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SysEntry {
    /// Snapshot entity
    Snapshot(SnapshotEntity),
    /// Restoration entity
    Restoration(RestoreEntity),
}

/// Versioned record stored in the operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysRecord {
    /// Record format version
    pub format_version: u8,
    /// Entity payload
    pub entry: SysEntry,
}

impl SysRecord {
    /// Wrap a snapshot entity
    pub fn snapshot(entity: SnapshotEntity) -> Self {
        Self {
            format_version: SYS_RECORD_FORMAT_VERSION,
            entry: SysEntry::Snapshot(entity),
        }
    }

    /// Wrap a restoration entity
    pub fn restoration(entity: RestoreEntity) -> Self {
        Self {
            format_version: SYS_RECORD_FORMAT_VERSION,
            entry: SysEntry::Restoration(entity),
        }
    }

    /// Key under which this record is stored
    pub fn key(&self) -> RecordKey {
        match &self.entry {
            SysEntry::Snapshot(s) => RecordKey::Snapshot(s.id),
            SysEntry::Restoration(r) => RecordKey::Restoration(r.id),
        }
    }
}
