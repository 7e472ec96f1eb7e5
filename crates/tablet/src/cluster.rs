//! A set of tablet servers sharing one hybrid clock
//!
//! Besides locating tablets, the cluster provides [`TxnWriter`], a
//! multi-tablet writer that commits every row of a transaction at one hybrid
//! time. It drives the commit registry of each tablet it touches, which is
//! what lets a snapshot decide whether a commit belongs to it.

use crate::server::{TabletPeer, TabletServer};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabletsnap_core::{
    partition_hash, Clock, HybridTime, Result, ServerId, SnapshotError, TabletId, TabletMeta,
};
use tracing::trace;

/// Tablet servers of one cluster
pub struct TabletCluster {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    servers: RwLock<Vec<Arc<TabletServer>>>,
}

impl TabletCluster {
    /// Empty cluster storing server directories under `root`
    pub fn new(root: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            clock,
            servers: RwLock::new(Vec::new()),
        }
    }

    /// Cluster with `count` running servers
    pub fn with_servers(root: impl AsRef<Path>, clock: Arc<dyn Clock>, count: usize) -> Result<Self> {
        let cluster = Self::new(root, clock);
        for _ in 0..count {
            cluster.add_server()?;
        }
        Ok(cluster)
    }

    /// Shared clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Start a new server and add it to the cluster
    pub fn add_server(&self) -> Result<Arc<TabletServer>> {
        let mut servers = self.servers.write();
        let id = ServerId::from_raw(format!("ts-{}", servers.len()));
        let dir = self.root.join(id.as_str());
        let server = Arc::new(TabletServer::new(id, dir, self.clock.clone())?);
        servers.push(server.clone());
        Ok(server)
    }

    /// Every server, in creation order
    pub fn servers(&self) -> Vec<Arc<TabletServer>> {
        self.servers.read().clone()
    }

    /// Server by id
    pub fn server(&self, id: &ServerId) -> Option<Arc<TabletServer>> {
        self.servers.read().iter().find(|s| s.id() == id).cloned()
    }

    /// Server that hosts, or used to host, `tablet_id`
    pub fn locate(&self, tablet_id: &TabletId) -> Option<Arc<TabletServer>> {
        self.servers
            .read()
            .iter()
            .find(|s| s.knows(tablet_id))
            .cloned()
    }

    /// Hosted peer of `tablet_id`, regardless of server state
    pub fn peer(&self, tablet_id: &TabletId) -> Option<Arc<TabletPeer>> {
        self.servers.read().iter().find_map(|s| s.peer(tablet_id))
    }

    /// Peers hosted on running servers
    pub fn running_peers(&self) -> Vec<Arc<TabletPeer>> {
        self.servers
            .read()
            .iter()
            .filter(|s| s.is_running())
            .flat_map(|s| s.peers())
            .collect()
    }

    /// Start every server
    pub fn start_all(&self) {
        for server in self.servers() {
            server.start();
        }
    }

    /// Stop every server
    pub fn shutdown_all(&self) {
        for server in self.servers() {
            server.shutdown();
        }
    }

    /// Begin a multi-tablet transaction
    pub fn txn(&self) -> TxnWriter<'_> {
        TxnWriter {
            cluster: self,
            writes: BTreeMap::new(),
        }
    }

    /// Read `key` of a table whose tablets are `tablets`
    pub fn read(
        &self,
        tablets: &[TabletMeta],
        key: &[u8],
        hybrid_time: Option<HybridTime>,
    ) -> Result<Option<Vec<u8>>> {
        let meta = route(tablets, key)?;
        let server = self
            .locate(&meta.id)
            .ok_or_else(|| SnapshotError::not_found(format!("tablet {}", meta.id)))?;
        server.running_peer(&meta.id)?.tablet().read(key, hybrid_time)
    }
}

/// Tablet of `tablets` owning `key`
pub fn route<'a>(tablets: &'a [TabletMeta], key: &[u8]) -> Result<&'a TabletMeta> {
    let hash = partition_hash(key);
    tablets
        .iter()
        .find(|t| t.partition.contains(hash))
        .ok_or_else(|| {
            SnapshotError::invalid_argument(format!("no tablet owns partition hash {}", hash))
        })
}

/// Rows buffered for one transaction
pub struct TxnWriter<'a> {
    cluster: &'a TabletCluster,
    writes: BTreeMap<TabletId, Vec<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl<'a> TxnWriter<'a> {
    /// Buffer an upsert of `key` in the table whose tablets are `tablets`
    pub fn put(&mut self, tablets: &[TabletMeta], key: &[u8], value: &[u8]) -> Result<&mut Self> {
        let tablet = route(tablets, key)?;
        self.writes
            .entry(tablet.id.clone())
            .or_default()
            .push((key.to_vec(), Some(value.to_vec())));
        Ok(self)
    }

    /// Buffer a delete of `key`
    pub fn delete(&mut self, tablets: &[TabletMeta], key: &[u8]) -> Result<&mut Self> {
        let tablet = route(tablets, key)?;
        self.writes
            .entry(tablet.id.clone())
            .or_default()
            .push((key.to_vec(), None));
        Ok(self)
    }

    /// Commit every buffered row at one hybrid time
    ///
    /// Each touched tablet registers the commit before its time is chosen, so
    /// a concurrent capture either sees all of the transaction or none of it.
    pub fn commit(self) -> Result<HybridTime> {
        let mut registered: Vec<(Arc<TabletPeer>, u64, Vec<(Vec<u8>, Option<Vec<u8>>)>)> =
            Vec::with_capacity(self.writes.len());

        for (tablet_id, rows) in self.writes {
            let peer = self
                .cluster
                .locate(&tablet_id)
                .ok_or_else(|| SnapshotError::not_found(format!("tablet {}", tablet_id)))
                .and_then(|server| server.running_peer(&tablet_id));
            let peer = match peer {
                Ok(peer) => peer,
                Err(e) => {
                    abort_all(&registered);
                    return Err(e);
                }
            };
            let token = peer.tablet().begin_commit();
            registered.push((peer, token, rows));
        }

        let hybrid_time = self.cluster.clock.now();
        for (peer, token, _) in &registered {
            if let Err(e) = peer.tablet().set_commit_time(*token, hybrid_time) {
                abort_all(&registered);
                return Err(e);
            }
        }
        for (peer, token, rows) in &registered {
            peer.tablet().apply_commit(*token, rows)?;
        }

        trace!(
            target: "tabletsnap::tablet",
            tablets = registered.len(),
            %hybrid_time,
            "Transaction committed"
        );
        Ok(hybrid_time)
    }
}

fn abort_all(registered: &[(Arc<TabletPeer>, u64, Vec<(Vec<u8>, Option<Vec<u8>>)>)]) {
    for (peer, token, _) in registered {
        peer.tablet().abort_commit(*token);
    }
}
