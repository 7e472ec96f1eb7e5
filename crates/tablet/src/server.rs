//! Tablet server: hosts tablet peers and answers participant requests
//!
//! A stopped server keeps its tablets (their data is owned by the replicated
//! log in a real deployment) but answers every request with `Unavailable`
//! until it is started again. A deleted tablet leaves a tombstone behind so
//! late requests get `NotFound` rather than `Unavailable`.

use crate::executor::ParticipantExecutor;
use crate::tablet::Tablet;
use dashmap::{DashMap, DashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabletsnap_core::{
    Clock, ParticipantRequest, Result, ServerId, SnapshotError, TabletId, TabletMeta,
    TabletOpOutcome,
};
use tracing::{debug, info};

/// A tablet together with its executor
pub struct TabletPeer {
    tablet: Arc<Tablet>,
    executor: ParticipantExecutor,
}

impl TabletPeer {
    /// The hosted tablet
    pub fn tablet(&self) -> &Arc<Tablet> {
        &self.tablet
    }

    /// Executor applying coordinator operations
    pub fn executor(&self) -> &ParticipantExecutor {
        &self.executor
    }
}

/// Process hosting a set of tablets
pub struct TabletServer {
    id: ServerId,
    data_dir: PathBuf,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    peers: DashMap<TabletId, Arc<TabletPeer>>,
    tombstones: DashSet<TabletId>,
}

impl TabletServer {
    /// New running server keeping tablet files under `data_dir`
    pub fn new(id: ServerId, data_dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            id,
            data_dir,
            clock,
            running: AtomicBool::new(true),
            peers: DashMap::new(),
            tombstones: DashSet::new(),
        })
    }

    /// Server id
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Clock shared by every tablet of this server
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the server answers requests
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Resume answering requests
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!(target: "tabletsnap::tablet", server_id = %self.id, "Tablet server started");
        }
    }

    /// Stop answering requests
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!(target: "tabletsnap::tablet", server_id = %self.id, "Tablet server stopped");
        }
    }

    /// Create and host a tablet
    pub fn create_tablet(&self, meta: TabletMeta) -> Result<Arc<TabletPeer>> {
        if self.peers.contains_key(&meta.id) || self.tombstones.contains(&meta.id) {
            return Err(SnapshotError::conflict(format!(
                "tablet {} already exists on server {}",
                meta.id, self.id
            )));
        }
        let dir = self.data_dir.join(format!("tablet-{}", meta.id));
        let tablet = Arc::new(Tablet::open(meta, dir)?);
        let peer = Arc::new(TabletPeer {
            executor: ParticipantExecutor::new(tablet.clone(), self.clock.clone()),
            tablet,
        });
        self.peers.insert(peer.tablet.id().clone(), peer.clone());
        debug!(
            target: "tabletsnap::tablet",
            server_id = %self.id,
            tablet_id = %peer.tablet.id(),
            "Tablet created"
        );
        Ok(peer)
    }

    /// Drop a tablet and its files, leaving a tombstone
    ///
    /// Returns whether the tablet was hosted here.
    pub fn delete_tablet(&self, tablet_id: &TabletId) -> Result<bool> {
        let Some((_, peer)) = self.peers.remove(tablet_id) else {
            return Ok(false);
        };
        self.tombstones.insert(tablet_id.clone());
        match std::fs::remove_dir_all(peer.tablet.dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            target: "tabletsnap::tablet",
            server_id = %self.id,
            %tablet_id,
            "Tablet deleted"
        );
        Ok(true)
    }

    /// Hosted peer, regardless of whether the server is running
    pub fn peer(&self, tablet_id: &TabletId) -> Option<Arc<TabletPeer>> {
        self.peers.get(tablet_id).map(|p| p.value().clone())
    }

    /// Every hosted peer
    pub fn peers(&self) -> Vec<Arc<TabletPeer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Whether `tablet_id` is hosted here or was deleted here
    pub fn knows(&self, tablet_id: &TabletId) -> bool {
        self.peers.contains_key(tablet_id) || self.tombstones.contains(tablet_id)
    }

    /// Whether `tablet_id` was deleted on this server
    pub fn is_tombstoned(&self, tablet_id: &TabletId) -> bool {
        self.tombstones.contains(tablet_id)
    }

    /// Hosted peer of a running server
    pub fn running_peer(&self, tablet_id: &TabletId) -> Result<Arc<TabletPeer>> {
        if !self.is_running() {
            return Err(SnapshotError::unavailable(format!(
                "tablet server {} is not running",
                self.id
            )));
        }
        self.peer(tablet_id).ok_or_else(|| {
            SnapshotError::not_found(format!("tablet {} on server {}", tablet_id, self.id))
        })
    }

    /// Answer a participant request
    pub fn handle(&self, request: &ParticipantRequest) -> Result<TabletOpOutcome> {
        self.running_peer(&request.tablet_id)?
            .executor
            .execute(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletsnap_core::{
        HybridClock, OperationId, PartitionBounds, SnapshotId, TableId, TabletOperation,
    };
    use tempfile::TempDir;

    fn meta(id: &str) -> TabletMeta {
        TabletMeta {
            id: TabletId::from_raw(id),
            table_id: TableId::from_raw("t"),
            partition: PartitionBounds::split(1)[0],
        }
    }

    fn delete_request(tablet: &str) -> ParticipantRequest {
        let snapshot_id = SnapshotId::new();
        ParticipantRequest {
            op_id: OperationId::delete(snapshot_id),
            tablet_id: TabletId::from_raw(tablet),
            operation: TabletOperation::DeleteSnapshot { snapshot_id },
        }
    }

    fn server(dir: &TempDir) -> TabletServer {
        TabletServer::new(
            ServerId::from_raw("ts-0"),
            dir.path(),
            Arc::new(HybridClock::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_stopped_server_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server.create_tablet(meta("a")).unwrap();
        server.shutdown();
        let err = server.handle(&delete_request("a")).unwrap_err();
        assert!(err.is_retryable());
        server.start();
        assert!(server.handle(&delete_request("a")).is_ok());
    }

    #[test]
    fn test_deleted_tablet_is_not_found() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let peer = server.create_tablet(meta("a")).unwrap();
        let tablet_dir = peer.tablet().dir().to_path_buf();
        assert!(server.delete_tablet(&TabletId::from_raw("a")).unwrap());
        assert!(!tablet_dir.exists());
        assert!(server.is_tombstoned(&TabletId::from_raw("a")));
        assert!(server.handle(&delete_request("a")).unwrap_err().is_not_found());
        assert!(!server.delete_tablet(&TabletId::from_raw("a")).unwrap());
    }

    #[test]
    fn test_duplicate_tablet_rejected() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server.create_tablet(meta("a")).unwrap();
        assert!(server.create_tablet(meta("a")).is_err());
    }
}
