//! The operation log seam
//!
//! A strongly consistent key-value log holding one record per entity.
//! Versions are assigned by the log and strictly increase across all keys,
//! so a writer can detect that someone else committed since it last read.

use crate::error::{LogError, LogResult};
use crate::frame::LogEntry;
use std::collections::BTreeMap;
use tabletsnap_core::{RecordKey, SysRecord};

/// A record together with the version it was committed at
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Commit version
    pub version: u64,
    /// Record contents
    pub record: SysRecord,
}

/// Replicated, strongly consistent record store
pub trait OperationLog: Send + Sync {
    /// Every live record, ordered by key
    fn load_all(&self) -> LogResult<Vec<StoredRecord>>;

    /// One record
    fn get(&self, key: &RecordKey) -> LogResult<Option<StoredRecord>>;

    /// Write `record` if the stored version equals `expected`
    ///
    /// `expected = None` requires the record to be absent. Returns the new
    /// version.
    fn put(&self, record: &SysRecord, expected: Option<u64>) -> LogResult<u64>;

    /// Remove the record stored under `key` if its version equals `expected`
    fn remove(&self, key: &RecordKey, expected: u64) -> LogResult<()>;
}

/// In-memory view of the live records, shared by both log implementations
#[derive(Debug, Default)]
pub(crate) struct RecordIndex {
    records: BTreeMap<RecordKey, StoredRecord>,
    last_version: u64,
}

impl RecordIndex {
    /// Verify the compare-and-set precondition for `key`
    pub(crate) fn check(&self, key: &RecordKey, expected: Option<u64>) -> LogResult<()> {
        let actual = self.records.get(key).map(|r| r.version);
        if actual != expected {
            return Err(LogError::VersionMismatch {
                key: *key,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Version the next mutation will carry
    pub(crate) fn next_version(&self) -> u64 {
        self.last_version + 1
    }

    /// Apply a logged mutation
    pub(crate) fn apply(&mut self, entry: LogEntry) {
        self.last_version = self.last_version.max(entry.version);
        match entry.record {
            Some(record) => {
                self.records.insert(
                    entry.key,
                    StoredRecord {
                        version: entry.version,
                        record,
                    },
                );
            }
            None => {
                self.records.remove(&entry.key);
            }
        }
    }

    pub(crate) fn get(&self, key: &RecordKey) -> Option<StoredRecord> {
        self.records.get(key).cloned()
    }

    pub(crate) fn all(&self) -> Vec<StoredRecord> {
        self.records.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
