//! Snapshot metadata import/export
//!
//! Export serializes the catalog slice a COMPLETE snapshot captured at
//! creation, so it works even after the source tables were dropped.
//!
//! Import upserts by qualified name, never by foreign id:
//! - a namespace is matched by name, created if missing
//! - a table is matched by (namespace name, table name); an existing table
//!   is reused only if its columns are identical, otherwise the import fails
//!   with `Conflict`
//! - a new table is created with the exported partition bounds
//! - tablets are paired by identical partition bounds
//!
//! Importing the same blob twice yields the same mapping.

use crate::catalog::Catalog;
use tabletsnap_core::{
    ImportMapping, PartitionBounds, Result, SnapshotEntity, SnapshotError, SnapshotMetadata,
    SnapshotState, TableIdMapping,
};
use tracing::info;

/// Encode the metadata of a COMPLETE snapshot
pub fn export(snapshot: &SnapshotEntity) -> Result<Vec<u8>> {
    if snapshot.state != SnapshotState::Complete {
        return Err(SnapshotError::conflict(format!(
            "snapshot {} is {}, only COMPLETE snapshots can be exported",
            snapshot.id, snapshot.state
        )));
    }
    let snapshot_hybrid_time = snapshot.snapshot_hybrid_time.ok_or_else(|| {
        SnapshotError::illegal_state(format!(
            "COMPLETE snapshot {} has no snapshot hybrid time",
            snapshot.id
        ))
    })?;
    SnapshotMetadata {
        snapshot_id: snapshot.id,
        snapshot_hybrid_time,
        catalog: snapshot.catalog.clone(),
    }
    .encode()
}

/// Recreate or match the objects of an exported snapshot in `catalog`
pub fn import(catalog: &Catalog, blob: &[u8]) -> Result<ImportMapping> {
    let metadata = SnapshotMetadata::decode(blob)?;
    let slice = &metadata.catalog;
    let mut mapping = ImportMapping::default();

    for table in &slice.tables {
        let namespace = slice.namespace(&table.namespace_id).ok_or_else(|| {
            SnapshotError::invalid_argument(format!(
                "exported table {} refers to namespace {} missing from the blob",
                table.id, table.namespace_id
            ))
        })?;
        let old_tablets = slice.tablets_of(&table.id);
        let partitions: Vec<PartitionBounds> = old_tablets.iter().map(|t| t.partition).collect();

        let new_namespace_id = catalog.create_namespace_if_missing(&namespace.name);
        let new_table_id = match catalog.find_table(&namespace.name, &table.name) {
            Some(existing) => {
                if existing.columns != table.columns {
                    return Err(SnapshotError::conflict(format!(
                        "table {}.{} exists with a different schema",
                        namespace.name, table.name
                    )));
                }
                existing.id
            }
            None => catalog.create_table_with_partitions(
                &new_namespace_id,
                &table.name,
                table.columns.clone(),
                &partitions,
            )?,
        };

        let new_tablets = catalog.tablets_of(&new_table_id)?;
        let mut tablets = Vec::with_capacity(old_tablets.len());
        for old in &old_tablets {
            let new = new_tablets
                .iter()
                .find(|t| t.partition == old.partition)
                .ok_or_else(|| {
                    SnapshotError::conflict(format!(
                        "table {}.{} has no tablet with partition [{}, {})",
                        namespace.name, table.name, old.partition.start, old.partition.end
                    ))
                })?;
            tablets.push((old.id.clone(), new.id.clone()));
        }

        mapping.tables.push(TableIdMapping {
            old_namespace_id: table.namespace_id.clone(),
            new_namespace_id,
            old_table_id: table.id.clone(),
            new_table_id,
            tablets,
        });
    }

    info!(
        target: "tabletsnap::coordinator",
        snapshot_id = %metadata.snapshot_id,
        tables = mapping.tables.len(),
        "Snapshot metadata imported"
    );
    Ok(mapping)
}

/// Whether every table of `mapping` can be opened
///
/// Tables still being created report `false`; a table that is gone is an
/// error.
pub fn is_import_done(catalog: &Catalog, mapping: &ImportMapping) -> Result<bool> {
    for table in &mapping.tables {
        match catalog.open_table(&table.new_table_id) {
            Ok(_) => {}
            Err(e) if e.is_retryable() => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use tabletsnap_core::{ColumnSchema, HybridClock, HybridTime, SnapshotId, TableId};
    use tabletsnap_tablet::TabletCluster;
    use tempfile::TempDir;

    fn catalog(dir: &TempDir) -> Catalog {
        Catalog::new(Arc::new(
            TabletCluster::with_servers(dir.path(), Arc::new(HybridClock::default()), 2).unwrap(),
        ))
    }

    fn columns() -> Vec<ColumnSchema> {
        vec![ColumnSchema::key("k", "int32"), ColumnSchema::value("v", "int32")]
    }

    fn complete_snapshot(catalog: &Catalog, tables: Vec<TableId>) -> SnapshotEntity {
        let slice = catalog.describe(&tables).unwrap();
        let mut entity = SnapshotEntity::new(SnapshotId::new(), tables, true, None, slice, Utc::now());
        entity.transition(SnapshotState::Complete, Utc::now()).unwrap();
        entity.snapshot_hybrid_time = Some(HybridTime::from_micros(42));
        entity
    }

    #[test]
    fn test_export_requires_complete() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let ns = catalog.create_namespace("db").unwrap();
        let table = catalog.create_table(&ns, "t", columns(), 2).unwrap();
        let slice = catalog.describe(&[table.clone()]).unwrap();
        let creating = SnapshotEntity::new(SnapshotId::new(), vec![table], true, None, slice, Utc::now());
        assert!(matches!(export(&creating), Err(SnapshotError::Conflict { .. })));
    }

    #[test]
    fn test_import_after_drop_recreates_objects() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let ns = catalog.create_namespace("db").unwrap();
        let table = catalog.create_table(&ns, "t", columns(), 3).unwrap();
        let snapshot = complete_snapshot(&catalog, vec![table.clone()]);
        let blob = export(&snapshot).unwrap();

        catalog.delete_table(&table).unwrap();
        catalog.delete_namespace(&ns).unwrap();

        let mapping = import(&catalog, &blob).unwrap();
        assert_eq!(mapping.tables.len(), 1);
        let entry = &mapping.tables[0];
        assert_eq!(entry.old_table_id, table);
        assert_ne!(entry.new_table_id, table);
        assert_eq!(entry.tablets.len(), 3);
        assert!(is_import_done(&catalog, &mapping).unwrap());
        assert!(catalog.open_table_by_name("db", "t").is_ok());

        let old_tablet = &snapshot.catalog.tablets[0].id;
        assert!(mapping.new_tablet_id(old_tablet).is_some());
        assert_eq!(
            mapping.lookup(&ns, &table).map(|(_, t)| t.clone()),
            Some(entry.new_table_id.clone())
        );
    }

    #[test]
    fn test_import_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let ns = catalog.create_namespace("db").unwrap();
        let table = catalog.create_table(&ns, "t", columns(), 2).unwrap();
        let blob = export(&complete_snapshot(&catalog, vec![table.clone()])).unwrap();

        let first = import(&catalog, &blob).unwrap();
        let second = import(&catalog, &blob).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tables[0].new_table_id, table);
        assert_eq!(first.tables[0].new_namespace_id, ns);
    }

    #[test]
    fn test_import_schema_mismatch_conflicts() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let ns = catalog.create_namespace("db").unwrap();
        let table = catalog.create_table(&ns, "t", columns(), 2).unwrap();
        let blob = export(&complete_snapshot(&catalog, vec![table.clone()])).unwrap();

        catalog.delete_table(&table).unwrap();
        catalog
            .create_table(&ns, "t", vec![ColumnSchema::key("other", "text")], 2)
            .unwrap();
        assert!(matches!(
            import(&catalog, &blob),
            Err(SnapshotError::Conflict { .. })
        ));
    }

    #[test]
    fn test_import_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        assert!(matches!(
            import(&catalog, b"not a snapshot"),
            Err(SnapshotError::InvalidArgument { .. })
        ));
    }
}
