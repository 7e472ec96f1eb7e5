//! In-process operation log
//!
//! Survives any number of coordinator instances as long as the `Arc` holding
//! it does. Write failures can be injected to exercise the coordinator's
//! handling of persistence errors.

use crate::error::{LogError, LogResult};
use crate::frame::LogEntry;
use crate::oplog::{OperationLog, RecordIndex, StoredRecord};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tabletsnap_core::{RecordKey, SysRecord};
use tracing::trace;

/// Operation log kept in memory
#[derive(Debug, Default)]
pub struct MemoryOperationLog {
    index: Mutex<RecordIndex>,
    fail_writes: AtomicBool,
    commits: AtomicU64,
}

impl MemoryOperationLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Unavailable` (or stop doing so)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Number of successful writes so far
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn check_writable(&self) -> LogResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(LogError::Unavailable("write rejected by log".into()));
        }
        Ok(())
    }
}

impl OperationLog for MemoryOperationLog {
    fn load_all(&self) -> LogResult<Vec<StoredRecord>> {
        Ok(self.index.lock().all())
    }

    fn get(&self, key: &RecordKey) -> LogResult<Option<StoredRecord>> {
        Ok(self.index.lock().get(key))
    }

    fn put(&self, record: &SysRecord, expected: Option<u64>) -> LogResult<u64> {
        self.check_writable()?;
        let key = record.key();
        let mut index = self.index.lock();
        index.check(&key, expected)?;
        let version = index.next_version();
        index.apply(LogEntry {
            key,
            version,
            record: Some(record.clone()),
        });
        self.commits.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tabletsnap::log", %key, version, "Record committed");
        Ok(version)
    }

    fn remove(&self, key: &RecordKey, expected: u64) -> LogResult<()> {
        self.check_writable()?;
        let mut index = self.index.lock();
        index.check(key, Some(expected))?;
        let version = index.next_version();
        index.apply(LogEntry {
            key: *key,
            version,
            record: None,
        });
        self.commits.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tabletsnap::log", %key, "Record removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tabletsnap_core::{CatalogSlice, SnapshotEntity, SnapshotId};

    fn record() -> SysRecord {
        SysRecord::snapshot(SnapshotEntity::new(
            SnapshotId::new(),
            vec![],
            false,
            None,
            CatalogSlice::default(),
            Utc::now(),
        ))
    }

    #[test]
    fn test_put_then_get() {
        let log = MemoryOperationLog::new();
        let r = record();
        let v = log.put(&r, None).unwrap();
        let stored = log.get(&r.key()).unwrap().unwrap();
        assert_eq!(stored.version, v);
        assert_eq!(stored.record, r);
    }

    #[test]
    fn test_cas_rejects_stale_writer() {
        let log = MemoryOperationLog::new();
        let r = record();
        let v1 = log.put(&r, None).unwrap();
        let v2 = log.put(&r, Some(v1)).unwrap();
        assert!(v2 > v1);

        let err = log.put(&r, Some(v1)).unwrap_err();
        assert!(matches!(err, LogError::VersionMismatch { .. }));
        let err = log.put(&r, None).unwrap_err();
        assert!(matches!(err, LogError::VersionMismatch { .. }));
    }

    #[test]
    fn test_remove() {
        let log = MemoryOperationLog::new();
        let r = record();
        let v = log.put(&r, None).unwrap();
        assert!(log.remove(&r.key(), v + 1).is_err());
        log.remove(&r.key(), v).unwrap();
        assert!(log.get(&r.key()).unwrap().is_none());
        assert!(log.remove(&r.key(), v).is_err());
    }

    #[test]
    fn test_injected_write_failure() {
        let log = MemoryOperationLog::new();
        log.set_fail_writes(true);
        assert!(matches!(
            log.put(&record(), None),
            Err(LogError::Unavailable(_))
        ));
        log.set_fail_writes(false);
        log.put(&record(), None).unwrap();
        assert_eq!(log.commit_count(), 1);
    }
}
