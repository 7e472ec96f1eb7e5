//! Multi-version row store
//!
//! Every row keeps its versions ordered by commit hybrid time. A read at
//! hybrid time `t` sees the newest version with `ht <= t`; a `None` value is
//! a tombstone.
//!
//! Garbage collection below a history cutoff `c` keeps every version newer
//! than `c` plus the newest version at or below `c`, so the row image at any
//! `t >= c` is still exact.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tabletsnap_core::HybridTime;

/// One committed version of a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVersion {
    /// Commit hybrid time
    pub hybrid_time: HybridTime,
    /// Row value; `None` is a tombstone
    pub value: Option<Vec<u8>>,
}

/// Versioned rows of one tablet
#[derive(Debug, Clone, Default)]
pub struct MvccStore {
    rows: BTreeMap<Vec<u8>, Vec<RowVersion>>,
}

impl MvccStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from captured versions
    pub fn from_versions(rows: BTreeMap<Vec<u8>, Vec<RowVersion>>) -> Self {
        Self { rows }
    }

    /// Apply a batch of writes at one hybrid time
    pub fn apply(&mut self, writes: &[(Vec<u8>, Option<Vec<u8>>)], hybrid_time: HybridTime) {
        for (key, value) in writes {
            let versions = self.rows.entry(key.clone()).or_default();
            let version = RowVersion {
                hybrid_time,
                value: value.clone(),
            };
            let at = versions.partition_point(|v| v.hybrid_time <= hybrid_time);
            versions.insert(at, version);
        }
    }

    /// Value of `key` as of `hybrid_time`
    pub fn read_at(&self, key: &[u8], hybrid_time: HybridTime) -> Option<Vec<u8>> {
        let versions = self.rows.get(key)?;
        let at = versions.partition_point(|v| v.hybrid_time <= hybrid_time);
        if at == 0 {
            return None;
        }
        versions[at - 1].value.clone()
    }

    /// Latest value of `key`
    pub fn read_latest(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read_at(key, HybridTime::MAX)
    }

    /// Every version with `ht <= hybrid_time`
    pub fn versions_up_to(&self, hybrid_time: HybridTime) -> BTreeMap<Vec<u8>, Vec<RowVersion>> {
        self.rows
            .iter()
            .filter_map(|(key, versions)| {
                let kept: Vec<RowVersion> = versions
                    .iter()
                    .take_while(|v| v.hybrid_time <= hybrid_time)
                    .cloned()
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some((key.clone(), kept))
                }
            })
            .collect()
    }

    /// Live rows as of `hybrid_time` (tombstoned rows omitted)
    pub fn image_at(&self, hybrid_time: HybridTime) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.rows
            .keys()
            .filter_map(|key| self.read_at(key, hybrid_time).map(|v| (key.clone(), v)))
            .collect()
    }

    /// Every key with at least one version
    pub fn keys(&self) -> BTreeSet<Vec<u8>> {
        self.rows.keys().cloned().collect()
    }

    /// Drop versions no longer needed to read at or after `cutoff`
    ///
    /// Returns the number of versions removed.
    pub fn gc(&mut self, cutoff: HybridTime) -> usize {
        let mut removed = 0;
        self.rows.retain(|_, versions| {
            let at_or_below = versions.partition_point(|v| v.hybrid_time <= cutoff);
            if at_or_below > 1 {
                versions.drain(..at_or_below - 1);
                removed += at_or_below - 1;
            }
            let only_tombstone = versions.len() == 1
                && versions[0].value.is_none()
                && versions[0].hybrid_time <= cutoff;
            if only_tombstone {
                removed += 1;
            }
            !only_tombstone
        });
        removed
    }

    /// Total number of stored versions
    pub fn version_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}
