//! Participant side of tabletsnap
//!
//! Everything that runs next to the data:
//! - [`MvccStore`]: multi-version rows keyed by hybrid time
//! - [`Tablet`]: one partition with its history cutoff and pending commits
//! - [`ArtifactStore`]: crash-safe on-disk snapshot artifacts
//! - [`ParticipantExecutor`]: idempotent DoSnapshot / DoRestore / DoDelete
//! - [`TabletServer`] / [`TabletCluster`]: hosting, start/stop, routing
//! - [`LocalTransport`]: in-process implementation of the participant RPC seam

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod cluster;
pub mod executor;
pub mod mvcc;
pub mod server;
pub mod tablet;
pub mod transport;

pub use artifact::{ArtifactStore, SnapshotArtifact, SNAPSHOTS_DIR_NAME};
pub use cluster::{route, TabletCluster, TxnWriter};
pub use executor::ParticipantExecutor;
pub use mvcc::{MvccStore, RowVersion};
pub use server::{TabletPeer, TabletServer};
pub use tablet::{PendingCommit, Tablet};
pub use transport::LocalTransport;
