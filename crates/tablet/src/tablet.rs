//! One tablet: versioned rows, history cutoff and in-flight commits
//!
//! A commit lands on a tablet in three steps:
//!
//! 1. [`Tablet::begin_commit`] registers a placeholder with no hybrid time
//! 2. [`Tablet::set_commit_time`] fixes the hybrid time chosen by the writer
//! 3. [`Tablet::apply_commit`] makes the rows visible and drops the entry
//!
//! While an entry is registered, a capture at `T` cannot tell whether the
//! commit belongs to the snapshot: a placeholder may still pick any time and
//! a fixed time `<= T` is not applied yet. [`Tablet::capture`] answers
//! `TryAgain` in both cases; it never waits.

use crate::artifact::{ArtifactStore, SnapshotArtifact};
use crate::mvcc::MvccStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tabletsnap_core::{
    HybridTime, Result, SnapshotError, SnapshotId, TabletId, TabletMeta,
};
use tracing::{debug, info};

/// In-flight commit registered on a tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommit {
    /// Registration token
    pub token: u64,
    /// Commit time once the writer fixed it
    pub hybrid_time: Option<HybridTime>,
}

struct TabletState {
    store: MvccStore,
    history_cutoff: HybridTime,
    pending: BTreeMap<u64, Option<HybridTime>>,
}

/// A single partition of a table
pub struct Tablet {
    meta: TabletMeta,
    dir: PathBuf,
    artifacts: ArtifactStore,
    state: RwLock<TabletState>,
    next_token: AtomicU64,
}

impl Tablet {
    /// Open a tablet whose files live under `dir`
    pub fn open(meta: TabletMeta, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let artifacts = ArtifactStore::open(&dir)?;
        Ok(Self {
            meta,
            dir,
            artifacts,
            state: RwLock::new(TabletState {
                store: MvccStore::new(),
                history_cutoff: HybridTime::MIN,
                pending: BTreeMap::new(),
            }),
            next_token: AtomicU64::new(1),
        })
    }

    /// Tablet id
    pub fn id(&self) -> &TabletId {
        &self.meta.id
    }

    /// Catalog descriptor
    pub fn meta(&self) -> &TabletMeta {
        &self.meta
    }

    /// Directory holding the tablet's files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot artifacts of this tablet
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Current history cutoff
    pub fn history_cutoff(&self) -> HybridTime {
        self.state.read().history_cutoff
    }

    /// Raise the history cutoff and garbage-collect below it
    ///
    /// Returns the cutoff in effect afterwards; a lower `cutoff` is ignored.
    pub fn advance_history_cutoff(&self, cutoff: HybridTime) -> HybridTime {
        let mut state = self.state.write();
        if cutoff <= state.history_cutoff {
            return state.history_cutoff;
        }
        state.history_cutoff = cutoff;
        let removed = state.store.gc(cutoff);
        if removed > 0 {
            debug!(
                target: "tabletsnap::tablet",
                tablet_id = %self.meta.id,
                %cutoff,
                removed,
                "Collected versions below history cutoff"
            );
        }
        cutoff
    }

    /// Register a commit whose hybrid time is not chosen yet
    pub fn begin_commit(&self) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.state.write().pending.insert(token, None);
        token
    }

    /// Fix the hybrid time of a registered commit
    pub fn set_commit_time(&self, token: u64, hybrid_time: HybridTime) -> Result<()> {
        let mut state = self.state.write();
        match state.pending.get_mut(&token) {
            Some(slot) => {
                *slot = Some(hybrid_time);
                Ok(())
            }
            None => Err(SnapshotError::illegal_state(format!(
                "commit {} is not registered on tablet {}",
                token, self.meta.id
            ))),
        }
    }

    /// Make a registered commit visible
    pub fn apply_commit(&self, token: u64, writes: &[(Vec<u8>, Option<Vec<u8>>)]) -> Result<()> {
        let mut state = self.state.write();
        let hybrid_time = match state.pending.remove(&token) {
            Some(Some(ht)) => ht,
            Some(None) => {
                state.pending.insert(token, None);
                return Err(SnapshotError::illegal_state(format!(
                    "commit {} on tablet {} has no hybrid time",
                    token, self.meta.id
                )));
            }
            None => {
                return Err(SnapshotError::illegal_state(format!(
                    "commit {} is not registered on tablet {}",
                    token, self.meta.id
                )))
            }
        };
        state.store.apply(writes, hybrid_time);
        Ok(())
    }

    /// Drop a registered commit without applying it
    pub fn abort_commit(&self, token: u64) {
        self.state.write().pending.remove(&token);
    }

    /// In-flight commits, oldest registration first
    pub fn pending_commits(&self) -> Vec<PendingCommit> {
        self.state
            .read()
            .pending
            .iter()
            .map(|(token, hybrid_time)| PendingCommit {
                token: *token,
                hybrid_time: *hybrid_time,
            })
            .collect()
    }

    /// Value of `key` at `hybrid_time` (latest when `None`)
    pub fn read(&self, key: &[u8], hybrid_time: Option<HybridTime>) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        match hybrid_time {
            Some(ht) if ht < state.history_cutoff => Err(SnapshotError::HistoryNotAvailable {
                requested: ht,
                cutoff: state.history_cutoff,
            }),
            Some(ht) => Ok(state.store.read_at(key, ht)),
            None => Ok(state.store.read_latest(key)),
        }
    }

    /// Live rows at `hybrid_time` (latest when `None`)
    pub fn scan(&self, hybrid_time: Option<HybridTime>) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.state
            .read()
            .store
            .image_at(hybrid_time.unwrap_or(HybridTime::MAX))
    }

    /// Capture every retained version with `ht <= hybrid_time` into an artifact
    pub fn capture(&self, snapshot_id: SnapshotId, hybrid_time: HybridTime) -> Result<()> {
        let artifact = {
            let state = self.state.read();
            if hybrid_time <= state.history_cutoff {
                return Err(SnapshotError::HistoryNotAvailable {
                    requested: hybrid_time,
                    cutoff: state.history_cutoff,
                });
            }
            let blocking = state.pending.values().find(|ht| match ht {
                None => true,
                Some(ht) => *ht <= hybrid_time,
            });
            if let Some(blocking) = blocking {
                return Err(SnapshotError::try_again(format!(
                    "tablet {} has an unresolved commit ({}) at or before {}",
                    self.meta.id,
                    blocking.map_or_else(|| "time not chosen".to_string(), |ht| ht.to_string()),
                    hybrid_time
                )));
            }
            SnapshotArtifact {
                snapshot_id,
                tablet_id: self.meta.id.clone(),
                hybrid_time,
                history_cutoff: state.history_cutoff,
                rows: state.store.versions_up_to(hybrid_time),
            }
        };
        self.artifacts.write(&artifact)?;
        info!(
            target: "tabletsnap::tablet",
            tablet_id = %self.meta.id,
            %snapshot_id,
            %hybrid_time,
            rows = artifact.rows.len(),
            "Snapshot captured"
        );
        Ok(())
    }

    /// Roll the tablet back to `target` using the artifact of `snapshot_id`
    ///
    /// The image at `target` is written as new versions at `apply_at`; keys
    /// without a value at `target` get tombstones.
    pub fn restore(
        &self,
        snapshot_id: SnapshotId,
        target: Option<HybridTime>,
        apply_at: HybridTime,
    ) -> Result<HybridTime> {
        let artifact = self.artifacts.read(&snapshot_id)?.ok_or_else(|| {
            SnapshotError::illegal_state(format!(
                "tablet {} has no artifact for snapshot {}",
                self.meta.id, snapshot_id
            ))
        })?;
        // Bounded by the history the artifact holds, not the live cutoff
        let target = match target {
            None => artifact.hybrid_time,
            Some(target) if target > artifact.hybrid_time => {
                return Err(SnapshotError::invalid_argument(format!(
                    "restore target {} is after snapshot time {}",
                    target, artifact.hybrid_time
                )));
            }
            Some(target) if target < artifact.history_cutoff => {
                return Err(SnapshotError::HistoryNotAvailable {
                    requested: target,
                    cutoff: artifact.history_cutoff,
                });
            }
            Some(target) => target,
        };

        let mut state = self.state.write();

        let image = MvccStore::from_versions(artifact.rows).image_at(target);
        let keys: BTreeSet<Vec<u8>> = state
            .store
            .keys()
            .into_iter()
            .chain(image.keys().cloned())
            .collect();
        let writes: Vec<(Vec<u8>, Option<Vec<u8>>)> = keys
            .into_iter()
            .map(|key| {
                let value = image.get(&key).cloned();
                (key, value)
            })
            .collect();
        state.store.apply(&writes, apply_at);

        info!(
            target: "tabletsnap::tablet",
            tablet_id = %self.meta.id,
            %snapshot_id,
            %target,
            rows = image.len(),
            "Tablet restored"
        );
        Ok(apply_at)
    }
}
