//! On-disk snapshot artifacts
//!
//! One file per snapshot under `<tablet dir>/snapshots/<snapshot id>.snap`:
//!
//! ```text
//! ┌─────────────────────────────┬──────────────┐
//! │ bincode(SnapshotArtifact)   │ CRC32 (u32)  │
//! └─────────────────────────────┴──────────────┘
//! ```
//!
//! Files are written to a temporary name, fsynced, then renamed into place,
//! so a reader only ever sees complete artifacts.

use crate::mvcc::RowVersion;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tabletsnap_core::{HybridTime, Result, SnapshotError, SnapshotId, TabletId};
use tracing::{debug, warn};

/// Name of the artifact directory inside a tablet directory
pub const SNAPSHOTS_DIR_NAME: &str = "snapshots";

const ARTIFACT_EXTENSION: &str = "snap";

/// Captured state of one tablet for one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotArtifact {
    /// Snapshot the artifact belongs to
    pub snapshot_id: SnapshotId,
    /// Tablet it was captured on
    pub tablet_id: TabletId,
    /// Capture point
    pub hybrid_time: HybridTime,
    /// Tablet history cutoff at capture; no read below it is exact
    pub history_cutoff: HybridTime,
    /// Every retained version with `ht <= hybrid_time`
    pub rows: BTreeMap<Vec<u8>, Vec<RowVersion>>,
}

/// Artifact directory of one tablet
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open the artifact directory under `tablet_dir`, creating it if needed
    pub fn open(tablet_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = tablet_dir.as_ref().join(SNAPSHOTS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the artifacts
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, snapshot_id: &SnapshotId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", snapshot_id, ARTIFACT_EXTENSION))
    }

    /// Durably write `artifact`, replacing any previous file for the snapshot
    pub fn write(&self, artifact: &SnapshotArtifact) -> Result<()> {
        let mut bytes = bincode::serialize(artifact)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, crc32fast::hash(&bytes));
        bytes.extend_from_slice(&crc);

        let final_path = self.path_of(&artifact.snapshot_id);
        let temp_path = self
            .dir
            .join(format!(".{}.tmp", artifact.snapshot_id));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        debug!(
            target: "tabletsnap::tablet",
            path = %final_path.display(),
            bytes = bytes.len(),
            "Artifact written"
        );
        Ok(())
    }

    /// Read the artifact of `snapshot_id`, `None` if there is none
    pub fn read(&self, snapshot_id: &SnapshotId) -> Result<Option<SnapshotArtifact>> {
        let path = self.path_of(snapshot_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(SnapshotError::corruption(format!(
                "artifact {} is truncated",
                path.display()
            )));
        }
        let (payload, crc) = bytes.split_at(bytes.len() - 4);
        if crc32fast::hash(payload) != LittleEndian::read_u32(crc) {
            warn!(
                target: "tabletsnap::tablet",
                path = %path.display(),
                "Artifact checksum mismatch"
            );
            return Err(SnapshotError::corruption(format!(
                "artifact {} failed its checksum",
                path.display()
            )));
        }
        let artifact = bincode::deserialize(payload)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(Some(artifact))
    }

    /// Remove the artifact of `snapshot_id`; returns whether one existed
    pub fn remove(&self, snapshot_id: &SnapshotId) -> Result<bool> {
        match std::fs::remove_file(self.path_of(snapshot_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshots that have an artifact here
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(SnapshotId::from_string)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(id: SnapshotId) -> SnapshotArtifact {
        let mut rows = BTreeMap::new();
        rows.insert(
            b"k".to_vec(),
            vec![RowVersion {
                hybrid_time: HybridTime::from_micros(5),
                value: Some(b"v".to_vec()),
            }],
        );
        SnapshotArtifact {
            snapshot_id: id,
            tablet_id: TabletId::from_raw("tablet-0"),
            hybrid_time: HybridTime::from_micros(10),
            history_cutoff: HybridTime::MIN,
            rows,
        }
    }

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let id = SnapshotId::new();
        store.write(&artifact(id)).unwrap();

        assert_eq!(store.read(&id).unwrap(), Some(artifact(id)));
        assert_eq!(store.list().unwrap(), vec![id]);
        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        assert_eq!(store.read(&id).unwrap(), None);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_artifact_detected() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let id = SnapshotId::new();
        store.write(&artifact(id)).unwrap();

        let path = store.path_of(&id);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            store.read(&id),
            Err(SnapshotError::Corruption { .. })
        ));
    }

    #[test]
    fn test_temp_files_not_listed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        std::fs::write(store.dir().join(".leftover.tmp"), b"x").unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
