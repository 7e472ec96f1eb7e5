//! Coordination layer for tabletsnap
//!
//! This crate drives snapshots across the tablets of a cluster:
//! - SnapshotCoordinator: snapshot and restoration lifecycle, failover, cleanup
//! - HistoryRetentionTracker: history holds and cutoff propagation
//! - Catalog: namespaces, tables and tablet placement
//! - translator: snapshot metadata export/import
//! - RpcDispatcher: worker pool fanning participant RPCs out
//! - CoordinatorConfig: `tabletsnap.toml` settings
//!
//! The coordinator is the only component that writes the operation log.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod retention;
pub mod translator;

pub use catalog::{Catalog, TableHandle, TableState};
pub use config::{ConfigError, CoordinatorConfig, RetentionConfig, CONFIG_FILE_NAME};
pub use coordinator::{CoordinatorContext, ListSnapshotsFilter, SnapshotCoordinator};
pub use dispatcher::{DispatcherStats, RpcDispatcher};
pub use retention::HistoryRetentionTracker;
