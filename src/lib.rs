//! tabletsnap - distributed snapshots for partitioned transactional storage
//!
//! A table is split into tablets hosted on tablet servers. tabletsnap takes
//! consistent snapshots across every tablet of a set of tables, restores
//! them (optionally to an earlier point in time), and exports their metadata
//! so the tables can be recreated elsewhere.
//!
//! # Quick Start
//!
//! ```ignore
//! use tabletsnap::*;
//!
//! let clock: Arc<dyn Clock> = Arc::new(HybridClock::default());
//! let cluster = Arc::new(TabletCluster::with_servers(dir, clock.clone(), 3)?);
//! let catalog = Arc::new(Catalog::new(cluster.clone()));
//! let config = CoordinatorConfig::default();
//! let tracker = Arc::new(HistoryRetentionTracker::new(cluster.clone(), clock.clone(), &config.retention));
//! let log = Arc::new(FileOperationLog::open(dir, config.log_config()?)?);
//!
//! let coordinator = SnapshotCoordinator::start(config, CoordinatorContext {
//!     log,
//!     transport: Arc::new(LocalTransport::new(cluster.clone())),
//!     catalog,
//!     tracker,
//!     clock,
//! })?;
//! let snapshot_id = coordinator.create_snapshot(&[table_id], true)?;
//! ```
//!
//! # Architecture
//!
//! - `tabletsnap-core`: ids, hybrid time, errors, entities, participant protocol
//! - `tabletsnap-durability`: the operation log the coordinator persists to
//! - `tabletsnap-tablet`: tablets, participant executors, tablet servers
//! - `tabletsnap-engine`: coordinator, retention tracker, catalog, translator

pub use tabletsnap_core::*;
pub use tabletsnap_durability::{
    DurabilityMode, FileOperationLog, LogConfig, LogError, MemoryOperationLog, OperationLog,
    StoredRecord,
};
pub use tabletsnap_engine::{
    translator, Catalog, ConfigError, CoordinatorConfig, CoordinatorContext, DispatcherStats,
    HistoryRetentionTracker, ListSnapshotsFilter, RetentionConfig, RpcDispatcher,
    SnapshotCoordinator, TableHandle, TableState, CONFIG_FILE_NAME,
};
pub use tabletsnap_tablet::{
    LocalTransport, TabletCluster, TabletPeer, TabletServer, TxnWriter,
};
