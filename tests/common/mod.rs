//! Shared cluster harness for the integration suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tabletsnap::{
    Catalog, Clock, ColumnSchema, CoordinatorConfig, CoordinatorContext, FileOperationLog,
    HistoryRetentionTracker, HybridClock, HybridTime, LocalTransport, RestoreEntity, RestoreId,
    RestoreState, SnapshotCoordinator, SnapshotEntity, SnapshotId, SnapshotState, TableId,
    TabletCluster, TabletMeta,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every 20ms until it holds; panics after `timeout`.
pub fn wait_for(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub const WAIT: Duration = Duration::from_secs(20);

pub const NAMESPACE: &str = "yugabyte";
pub const TABLE: &str = "test_table";

// ============================================================================
// TestCluster - tablet servers, catalog, retention and a restartable coordinator
// ============================================================================

/// Three tablet servers sharing one clock, with a coordinator persisting to
/// a file log that survives coordinator restarts.
pub struct TestCluster {
    pub dir: TempDir,
    pub clock: Arc<HybridClock>,
    pub cluster: Arc<TabletCluster>,
    pub catalog: Arc<Catalog>,
    pub tracker: Arc<HistoryRetentionTracker>,
    pub transport: Arc<LocalTransport>,
    pub config: CoordinatorConfig,
    coordinator: Option<SnapshotCoordinator>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::for_testing())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(HybridClock::new(config.max_clock_skew()));
        let cluster = Arc::new(
            TabletCluster::with_servers(dir.path().join("tservers"), clock.clone(), 3)
                .expect("Failed to start tablet servers"),
        );
        let tracker = Arc::new(HistoryRetentionTracker::new(
            Arc::clone(&cluster),
            clock.clone(),
            &config.retention,
        ));
        tracker.spawn().expect("Failed to start retention thread");

        let mut test_cluster = TestCluster {
            catalog: Arc::new(Catalog::new(Arc::clone(&cluster))),
            transport: Arc::new(LocalTransport::new(Arc::clone(&cluster))),
            tracker,
            cluster,
            clock,
            config,
            dir,
            coordinator: None,
        };
        test_cluster.start_coordinator();
        test_cluster
    }

    /// Running coordinator
    pub fn coordinator(&self) -> &SnapshotCoordinator {
        self.coordinator.as_ref().expect("coordinator is down")
    }

    /// Open the log from disk and start a coordinator on it
    pub fn start_coordinator(&mut self) {
        assert!(self.coordinator.is_none(), "coordinator already running");
        let log = FileOperationLog::open(
            self.dir.path().join("master"),
            self.config.log_config().expect("bad log config"),
        )
        .expect("Failed to open operation log");
        let ctx = CoordinatorContext {
            log: Arc::new(log),
            transport: self.transport.clone(),
            catalog: Arc::clone(&self.catalog),
            tracker: Arc::clone(&self.tracker),
            clock: self.clock.clone(),
        };
        self.coordinator = Some(
            SnapshotCoordinator::start(self.config.clone(), ctx).expect("Failed to start coordinator"),
        );
    }

    pub fn shutdown_coordinator(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown();
        }
    }

    pub fn restart_coordinator(&mut self) {
        self.shutdown_coordinator();
        self.start_coordinator();
    }

    pub fn shutdown_tservers(&self) {
        self.cluster.shutdown_all();
    }

    pub fn start_tservers(&self) {
        self.cluster.start_all();
    }

    pub fn now(&self) -> HybridTime {
        self.clock.now()
    }

    // ========================================================================
    // Tables and rows
    // ========================================================================

    pub fn create_table(&self, namespace: &str, name: &str, tablets: usize) -> TableId {
        let ns = self.catalog.create_namespace_if_missing(namespace);
        self.catalog
            .create_table(
                &ns,
                name,
                vec![ColumnSchema::key("key", "int32"), ColumnSchema::value("value", "int32")],
                tablets,
            )
            .expect("Failed to create table")
    }

    /// `yugabyte.test_table` with 3 tablets
    pub fn create_test_table(&self) -> TableId {
        self.create_table(NAMESPACE, TABLE, 3)
    }

    pub fn tablets(&self, table: &TableId) -> Vec<TabletMeta> {
        self.catalog.tablets_of(table).expect("table is not live")
    }

    /// Upsert `value(key)` for every key in `keys`, one transaction
    pub fn write_rows(&self, table: &TableId, keys: std::ops::Range<i32>, value: impl Fn(i32) -> i32) {
        let tablets = self.tablets(table);
        let mut txn = self.cluster.txn();
        for key in keys {
            txn.put(&tablets, &key.to_be_bytes(), &value(key).to_be_bytes())
                .expect("Failed to buffer row");
        }
        txn.commit().expect("Failed to commit rows");
    }

    pub fn read_row(&self, table: &TableId, key: i32) -> Option<i32> {
        self.cluster
            .read(&self.tablets(table), &key.to_be_bytes(), None)
            .expect("Failed to read row")
            .map(|bytes| i32::from_be_bytes(bytes.as_slice().try_into().expect("4-byte value")))
    }

    /// Value of `key` as of `hybrid_time`
    pub fn read_row_at(&self, table: &TableId, key: i32, hybrid_time: HybridTime) -> Option<i32> {
        self.cluster
            .read(&self.tablets(table), &key.to_be_bytes(), Some(hybrid_time))
            .expect("Failed to read row")
            .map(|bytes| i32::from_be_bytes(bytes.as_slice().try_into().expect("4-byte value")))
    }

    pub fn verify_rows(&self, table: &TableId, keys: std::ops::Range<i32>, value: impl Fn(i32) -> i32) {
        for key in keys {
            assert_eq!(self.read_row(table, key), Some(value(key)), "row {}", key);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn snapshot(&self, id: SnapshotId) -> SnapshotEntity {
        self.coordinator().snapshot(id).expect("snapshot not listed")
    }

    pub fn wait_snapshot_state(&self, id: SnapshotId, state: SnapshotState) -> SnapshotEntity {
        wait_for(WAIT, &format!("snapshot {} to reach {}", id, state), || {
            self.snapshot(id).state == state
        });
        self.snapshot(id)
    }

    pub fn create_snapshot_and_wait(&self, tables: &[TableId]) -> SnapshotId {
        let id = self
            .coordinator()
            .create_snapshot(tables, true)
            .expect("Failed to create snapshot");
        self.wait_snapshot_state(id, SnapshotState::Complete);
        id
    }

    pub fn wait_restoration_done(&self, id: RestoreId) -> RestoreEntity {
        wait_for(WAIT, &format!("restoration {}", id), || {
            self.coordinator()
                .restoration(id)
                .map(|r| r.state != RestoreState::Creating)
                .unwrap_or(false)
        });
        self.coordinator().restoration(id).expect("restoration not listed")
    }

    pub fn restore_and_wait(
        &self,
        id: SnapshotId,
        restore_ht: Option<HybridTime>,
        interval: Option<Duration>,
    ) -> RestoreEntity {
        let restore_id = self
            .coordinator()
            .restore_snapshot(id, restore_ht, interval)
            .expect("Failed to start restoration");
        let restoration = self.wait_restoration_done(restore_id);
        assert_eq!(restoration.state, RestoreState::Complete, "{:?}", restoration.error);
        restoration
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown_coordinator();
        self.tracker.shutdown();
    }
}
