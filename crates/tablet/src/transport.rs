//! In-process participant transport
//!
//! Routes each request to the server that hosts (or tombstoned) the tablet.
//! Tests can make a kind of operation fail on every tablet, or slow down
//! one tablet, to drive the coordinator's failure paths.

use crate::cluster::TabletCluster;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    OpKind, ParticipantRequest, ParticipantTransport, Result, SnapshotError, TabletId,
    TabletOpOutcome,
};
use tracing::trace;

/// [`ParticipantTransport`] over a [`TabletCluster`] in the same process
pub struct LocalTransport {
    cluster: Arc<TabletCluster>,
    injected: RwLock<HashMap<OpKind, SnapshotError>>,
    delays: RwLock<HashMap<TabletId, Duration>>,
}

impl LocalTransport {
    /// Transport delivering to `cluster`
    pub fn new(cluster: Arc<TabletCluster>) -> Self {
        Self {
            cluster,
            injected: RwLock::new(HashMap::new()),
            delays: RwLock::new(HashMap::new()),
        }
    }

    /// Answer every request of `kind` with `error` until cleared
    pub fn inject_failure(&self, kind: OpKind, error: SnapshotError) {
        self.injected.write().insert(kind, error);
    }

    /// Stop injecting failures for `kind`
    pub fn clear_failure(&self, kind: OpKind) {
        self.injected.write().remove(&kind);
    }

    /// Hold every request to `tablet_id` for `delay` before delivering it
    pub fn inject_delay(&self, tablet_id: &TabletId, delay: Duration) {
        self.delays.write().insert(tablet_id.clone(), delay);
    }

    /// Deliver requests to `tablet_id` immediately again
    pub fn clear_delay(&self, tablet_id: &TabletId) {
        self.delays.write().remove(tablet_id);
    }
}

impl ParticipantTransport for LocalTransport {
    fn send(&self, request: ParticipantRequest, timeout: Duration) -> Result<TabletOpOutcome> {
        if let Some(error) = self.injected.read().get(&request.op_id.kind) {
            return Err(error.clone());
        }
        let delay = self.delays.read().get(&request.tablet_id).copied();
        if let Some(delay) = delay {
            if delay >= timeout {
                std::thread::sleep(timeout);
                return Err(SnapshotError::unavailable(format!(
                    "tablet {} did not answer within {:?}",
                    request.tablet_id, timeout
                )));
            }
            std::thread::sleep(delay);
        }
        let server = self
            .cluster
            .locate(&request.tablet_id)
            .ok_or_else(|| SnapshotError::not_found(format!("tablet {}", request.tablet_id)))?;
        if server.is_tombstoned(&request.tablet_id) {
            return Err(SnapshotError::not_found(format!(
                "tablet {} was deleted",
                request.tablet_id
            )));
        }
        trace!(
            target: "tabletsnap::tablet",
            server_id = %server.id(),
            tablet_id = %request.tablet_id,
            op_id = %request.op_id,
            "Delivering participant request"
        );
        server.handle(&request)
    }
}
