//! End-to-end snapshot, restore and failover scenarios on a three-server cluster.

mod common;

use common::*;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletsnap::{
    CoordinatorConfig, ListSnapshotsFilter, OpKind, SnapshotError, SnapshotState,
};

const ROWS: std::ops::Range<i32> = 0..100;

fn original(key: i32) -> i32 {
    key
}

fn overwritten(key: i32) -> i32 {
    -key
}

#[test]
fn simple() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);

    // Hold one tablet back so the pending phase is observable
    let slow = tc.tablets(&table)[0].id.clone();
    tc.transport.inject_delay(&slow, Duration::from_millis(300));
    let snapshot_id = tc
        .coordinator()
        .create_snapshot(&[table.clone()], true)
        .unwrap();
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Creating);
    tc.transport.clear_delay(&slow);
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Complete);

    tc.write_rows(&table, ROWS, overwritten);
    tc.verify_rows(&table, ROWS, overwritten);

    tc.restore_and_wait(snapshot_id, None, None);
    tc.verify_rows(&table, ROWS, original);
}

#[test]
fn point_in_time_restore() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);
    std::thread::sleep(Duration::from_millis(5));
    let restore_ht = tc.now();
    tc.write_rows(&table, ROWS, overwritten);

    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);
    tc.restore_and_wait(snapshot_id, Some(restore_ht), None);
    tc.verify_rows(&table, ROWS, original);
}

#[test]
fn point_in_time_restore_interval() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);
    std::thread::sleep(Duration::from_millis(5));
    let pre_sleep_ht = tc.now();
    std::thread::sleep(Duration::from_millis(200));
    tc.write_rows(&table, ROWS, overwritten);

    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);
    let restore_ht = tc.now();
    let interval = restore_ht.physical_diff(pre_sleep_ht);
    tc.restore_and_wait(snapshot_id, Some(restore_ht), Some(interval));
    tc.verify_rows(&table, ROWS, original);
}

#[test]
fn point_in_time_restore_rejects_target_after_snapshot() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);
    let later = tc.now().saturating_add(Duration::from_secs(60));

    let err = tc
        .coordinator()
        .restore_snapshot(snapshot_id, Some(later), None)
        .unwrap_err();
    assert!(matches!(err, SnapshotError::InvalidArgument { .. }), "{}", err);
}

#[test]
fn restore_after_history_retention_passed() {
    let mut config = CoordinatorConfig::for_testing();
    config.retention.retention_interval_ms = 200;
    let tc = TestCluster::with_config(config);
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);
    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);
    tc.write_rows(&table, ROWS, overwritten);

    let snapshot_ht = tc.snapshot(snapshot_id).snapshot_hybrid_time.unwrap();
    wait_for(WAIT, "history cutoff to pass the snapshot", || {
        tc.tablets(&table).iter().all(|t| {
            tc.cluster
                .peer(&t.id)
                .map_or(false, |p| p.tablet().history_cutoff() > snapshot_ht)
        })
    });

    tc.restore_and_wait(snapshot_id, None, None);
    tc.verify_rows(&table, ROWS, original);
}

#[test]
fn persistence() {
    let mut tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);
    let before = tc.snapshot(snapshot_id);

    tc.restart_coordinator();
    let after = tc.snapshot(snapshot_id);
    assert_eq!(after.state, SnapshotState::Complete);
    assert_eq!(after.snapshot_hybrid_time, before.snapshot_hybrid_time);
    assert_eq!(after.table_ids, before.table_ids);
    assert_eq!(after.catalog, before.catalog);
}

#[test]
fn delete() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);

    tc.coordinator().delete_snapshot(snapshot_id).unwrap();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Deleted);

    for peer in tc.cluster.running_peers() {
        assert!(peer.tablet().artifacts().list().unwrap().is_empty());
    }
    // Deleting again is a no-op
    tc.coordinator().delete_snapshot(snapshot_id).unwrap();
}

#[test]
fn delete_after_table_dropped_with_unreachable_tablets() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);

    tc.transport
        .inject_failure(OpKind::Delete, SnapshotError::unavailable("tablet servers unreachable"));
    tc.catalog.delete_table(&table).unwrap();
    tc.coordinator().delete_snapshot(snapshot_id).unwrap();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Deleted);
}

#[test]
fn cleanup_after_restart() {
    let mut config = CoordinatorConfig::for_testing();
    config.cleanup_delay_ms = 300_000;
    let mut tc = TestCluster::with_config(config);
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);

    tc.coordinator().delete_snapshot(snapshot_id).unwrap();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Deleted);
    std::thread::sleep(Duration::from_millis(300));
    let listed = tc
        .coordinator()
        .list_snapshots(&ListSnapshotsFilter::default())
        .unwrap();
    assert_eq!(listed.len(), 1);

    tc.config.cleanup_delay_ms = 1_000;
    tc.restart_coordinator();
    wait_for(WAIT, "snapshot record to be purged", || {
        tc.coordinator()
            .list_snapshots(&ListSnapshotsFilter::default())
            .unwrap()
            .is_empty()
    });
}

#[test]
fn import_meta() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.write_rows(&table, ROWS, original);
    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);
    let blob = tc.coordinator().export_snapshot_meta(snapshot_id).unwrap();

    let namespace = tc.catalog.find_namespace(NAMESPACE).unwrap();
    tc.catalog.delete_table(&table).unwrap();
    tc.catalog.delete_namespace(&namespace.id).unwrap();

    let mapping = tc.coordinator().import_snapshot_meta(&blob).unwrap();
    assert_eq!(mapping.tables.len(), 1);
    assert_eq!(mapping.tables[0].old_table_id, table);
    wait_for(WAIT, "import to finish", || {
        tc.coordinator().is_import_done(&mapping).unwrap()
    });

    let imported = tc.catalog.open_table_by_name(NAMESPACE, TABLE).unwrap();
    assert_eq!(imported.meta.id, mapping.tables[0].new_table_id);
    assert_eq!(imported.tablets.len(), 3);
    tc.write_rows(&imported.meta.id, ROWS, overwritten);
    tc.verify_rows(&imported.meta.id, ROWS, overwritten);
}

#[test]
fn retry() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();
    tc.transport
        .inject_failure(OpKind::Snapshot, SnapshotError::unavailable("injected"));

    let snapshot_id = tc.coordinator().create_snapshot(&[table], true).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Creating);

    tc.transport.clear_failure(OpKind::Snapshot);
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Complete);
}

#[test]
fn failure() {
    let mut config = CoordinatorConfig::for_testing();
    config.retention.hold_lease_ms = 300;
    let mut tc = TestCluster::with_config(config);
    let table = tc.create_test_table();

    tc.shutdown_tservers();
    let snapshot_id = tc.coordinator().create_snapshot(&[table], true).unwrap();
    tc.tracker.set_retention_interval(Duration::ZERO);
    tc.shutdown_coordinator();

    // Without a coordinator renewing it the hold lapses and history moves on
    tc.start_tservers();
    std::thread::sleep(Duration::from_millis(1_000));

    tc.start_coordinator();
    let snapshot = tc.wait_snapshot_state(snapshot_id, SnapshotState::Failed);
    assert!(
        matches!(snapshot.error, Some(SnapshotError::HistoryNotAvailable { .. })),
        "{:?}",
        snapshot.error
    );
}

#[test]
fn restart() {
    let mut tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);
    let snapshot_ht = tc.snapshot(snapshot_id).snapshot_hybrid_time;

    tc.restart_coordinator();
    std::thread::sleep(Duration::from_millis(200));
    let snapshot = tc.snapshot(snapshot_id);
    assert_eq!(snapshot.state, SnapshotState::Complete);
    assert_eq!(snapshot.snapshot_hybrid_time, snapshot_ht);
}

#[test]
fn complete_and_bounce_coordinator() {
    let mut tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);

    tc.catalog.delete_table(&table).unwrap();
    tc.restart_coordinator();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Complete);
}

#[test]
fn flush_log_and_delete() {
    let mut tc = TestCluster::new();
    let table = tc.create_test_table();
    let snapshot_id = tc.create_snapshot_and_wait(&[table]);

    tc.shutdown_tservers();
    tc.coordinator().delete_snapshot(snapshot_id).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Deleting);

    tc.restart_coordinator();
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Deleting);
    tc.start_tservers();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Deleted);
}

#[test]
fn consistency() {
    const WRITERS: usize = 5;
    const KEYS: std::ops::Range<i32> = 0..10;

    let tc = Arc::new(TestCluster::new());
    let table = tc.create_test_table();
    tc.write_rows(&table, KEYS, |_| 0);

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let tc = Arc::clone(&tc);
            let table = table.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut commits = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let value: i32 = rng.gen_range(1..i32::MAX);
                    tc.write_rows(&table, KEYS, |_| value);
                    commits += 1;
                }
                commits
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(200));
    let snapshot_id = tc.create_snapshot_and_wait(&[table.clone()]);
    std::thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    let commits: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(commits > 0);

    // The committed state as of the snapshot hybrid time, one transaction
    let snapshot_ht = tc.snapshot(snapshot_id).snapshot_hybrid_time.unwrap();
    let at_snapshot: Vec<Option<i32>> = KEYS
        .map(|key| tc.read_row_at(&table, key, snapshot_ht))
        .collect();
    assert!(at_snapshot[0].is_some());
    assert!(
        at_snapshot.iter().all(|v| *v == at_snapshot[0]),
        "snapshot time splits a transaction: {:?}",
        at_snapshot
    );

    tc.restore_and_wait(snapshot_id, None, None);
    for (key, expected) in KEYS.zip(at_snapshot) {
        assert_eq!(tc.read_row(&table, key), expected, "key {} diverged", key);
    }
}

#[test]
fn delete_table() {
    let tc = TestCluster::new();
    let table = tc.create_test_table();

    tc.shutdown_tservers();
    let snapshot_id = tc.coordinator().create_snapshot(&[table.clone()], true).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Creating);

    tc.catalog.delete_table(&table).unwrap();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Failed);
    tc.start_tservers();
}

#[test]
fn delete_table_with_coordinator_restart() {
    let mut tc = TestCluster::new();
    let table = tc.create_test_table();

    tc.shutdown_tservers();
    let snapshot_id = tc.coordinator().create_snapshot(&[table.clone()], true).unwrap();
    tc.restart_coordinator();
    assert_eq!(tc.snapshot(snapshot_id).state, SnapshotState::Creating);

    tc.catalog.delete_table(&table).unwrap();
    tc.wait_snapshot_state(snapshot_id, SnapshotState::Failed);
    tc.start_tservers();
}
