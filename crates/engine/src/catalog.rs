//! Cluster catalog: namespaces, tables and tablet placement
//!
//! Tables are split into hash-partitioned tablets placed round-robin on the
//! cluster's tablet servers. Deleting a table tombstones its tablets on
//! their servers, after which participant requests for them answer
//! `NotFound`.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tabletsnap_core::{
    CatalogSlice, ColumnSchema, NamespaceId, NamespaceMeta, PartitionBounds, Result,
    SnapshotError, TableId, TableMeta, TabletId, TabletMeta,
};
use tabletsnap_tablet::TabletCluster;
use tracing::info;

/// Lifecycle of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Tablets are being placed
    Preparing,
    /// Every tablet is placed
    Running,
    /// Dropped; its tablets are tombstoned
    Deleted,
}

#[derive(Debug, Clone)]
struct TableEntry {
    meta: TableMeta,
    state: TableState,
    tablets: Vec<TabletMeta>,
}

#[derive(Debug, Default)]
struct CatalogState {
    namespaces: BTreeMap<NamespaceId, NamespaceMeta>,
    tables: BTreeMap<TableId, TableEntry>,
}

impl CatalogState {
    fn namespace_by_name(&self, name: &str) -> Option<&NamespaceMeta> {
        self.namespaces.values().find(|n| n.name == name)
    }

    fn live_table_by_name(&self, namespace_id: &NamespaceId, name: &str) -> Option<&TableEntry> {
        self.tables.values().find(|t| {
            t.state != TableState::Deleted
                && &t.meta.namespace_id == namespace_id
                && t.meta.name == name
        })
    }

    fn live_table(&self, table_id: &TableId) -> Result<&TableEntry> {
        match self.tables.get(table_id) {
            Some(entry) if entry.state != TableState::Deleted => Ok(entry),
            Some(_) => Err(SnapshotError::not_found(format!("table {} was deleted", table_id))),
            None => Err(SnapshotError::not_found(format!("table {}", table_id))),
        }
    }
}

/// An opened table: its descriptor and tablets ordered by partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    /// Table descriptor
    pub meta: TableMeta,
    /// Tablets ordered by partition start
    pub tablets: Vec<TabletMeta>,
}

/// Namespaces and tables of one cluster
pub struct Catalog {
    cluster: Arc<TabletCluster>,
    state: RwLock<CatalogState>,
    next_server: AtomicUsize,
}

impl Catalog {
    /// Empty catalog placing tablets on `cluster`
    pub fn new(cluster: Arc<TabletCluster>) -> Self {
        Self {
            cluster,
            state: RwLock::new(CatalogState::default()),
            next_server: AtomicUsize::new(0),
        }
    }

    /// Cluster hosting the tablets
    pub fn cluster(&self) -> &Arc<TabletCluster> {
        &self.cluster
    }

    /// Create a namespace; `Conflict` if the name is taken
    pub fn create_namespace(&self, name: &str) -> Result<NamespaceId> {
        let mut state = self.state.write();
        if state.namespace_by_name(name).is_some() {
            return Err(SnapshotError::conflict(format!("namespace '{}' already exists", name)));
        }
        let id = NamespaceId::generate();
        state.namespaces.insert(
            id.clone(),
            NamespaceMeta {
                id: id.clone(),
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    /// Id of namespace `name`, creating it if needed
    pub fn create_namespace_if_missing(&self, name: &str) -> NamespaceId {
        let mut state = self.state.write();
        if let Some(existing) = state.namespace_by_name(name) {
            return existing.id.clone();
        }
        let id = NamespaceId::generate();
        state.namespaces.insert(
            id.clone(),
            NamespaceMeta {
                id: id.clone(),
                name: name.to_string(),
            },
        );
        id
    }

    /// Namespace by name
    pub fn find_namespace(&self, name: &str) -> Option<NamespaceMeta> {
        self.state.read().namespace_by_name(name).cloned()
    }

    /// Drop an empty namespace
    pub fn delete_namespace(&self, id: &NamespaceId) -> Result<()> {
        let mut state = self.state.write();
        let has_tables = state
            .tables
            .values()
            .any(|t| t.state != TableState::Deleted && &t.meta.namespace_id == id);
        if has_tables {
            return Err(SnapshotError::conflict(format!("namespace {} still has tables", id)));
        }
        state
            .namespaces
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SnapshotError::not_found(format!("namespace {}", id)))
    }

    /// Create a table with `num_tablets` evenly split hash partitions
    pub fn create_table(
        &self,
        namespace_id: &NamespaceId,
        name: &str,
        columns: Vec<ColumnSchema>,
        num_tablets: usize,
    ) -> Result<TableId> {
        if num_tablets == 0 {
            return Err(SnapshotError::invalid_argument("a table needs at least one tablet"));
        }
        self.create_table_with_partitions(
            namespace_id,
            name,
            columns,
            &PartitionBounds::split(num_tablets),
        )
    }

    /// Create a table whose tablets own exactly `partitions`
    pub fn create_table_with_partitions(
        &self,
        namespace_id: &NamespaceId,
        name: &str,
        columns: Vec<ColumnSchema>,
        partitions: &[PartitionBounds],
    ) -> Result<TableId> {
        let servers = self.cluster.servers();
        if servers.is_empty() {
            return Err(SnapshotError::unavailable("cluster has no tablet servers"));
        }
        if partitions.is_empty() {
            return Err(SnapshotError::invalid_argument("a table needs at least one partition"));
        }

        let table_id = TableId::generate();
        let tablets: Vec<TabletMeta> = partitions
            .iter()
            .map(|partition| TabletMeta {
                id: TabletId::generate(),
                table_id: table_id.clone(),
                partition: *partition,
            })
            .collect();
        {
            let mut state = self.state.write();
            if !state.namespaces.contains_key(namespace_id) {
                return Err(SnapshotError::not_found(format!("namespace {}", namespace_id)));
            }
            if state.live_table_by_name(namespace_id, name).is_some() {
                return Err(SnapshotError::conflict(format!("table '{}' already exists", name)));
            }
            state.tables.insert(
                table_id.clone(),
                TableEntry {
                    meta: TableMeta {
                        id: table_id.clone(),
                        name: name.to_string(),
                        namespace_id: namespace_id.clone(),
                        columns,
                    },
                    state: TableState::Preparing,
                    tablets: tablets.clone(),
                },
            );
        }

        for tablet in &tablets {
            let slot = self.next_server.fetch_add(1, Ordering::Relaxed) % servers.len();
            servers[slot].create_tablet(tablet.clone())?;
        }

        if let Some(entry) = self.state.write().tables.get_mut(&table_id) {
            if entry.state == TableState::Preparing {
                entry.state = TableState::Running;
            }
        }
        info!(
            target: "tabletsnap::coordinator",
            %table_id,
            name,
            tablets = tablets.len(),
            "Table created"
        );
        Ok(table_id)
    }

    /// Drop a table and tombstone its tablets
    pub fn delete_table(&self, table_id: &TableId) -> Result<()> {
        let tablets = {
            let mut state = self.state.write();
            let entry = state
                .tables
                .get_mut(table_id)
                .ok_or_else(|| SnapshotError::not_found(format!("table {}", table_id)))?;
            if entry.state == TableState::Deleted {
                return Ok(());
            }
            entry.state = TableState::Deleted;
            entry.tablets.clone()
        };
        for tablet in &tablets {
            if let Some(server) = self.cluster.locate(&tablet.id) {
                server.delete_tablet(&tablet.id)?;
            }
        }
        info!(target: "tabletsnap::coordinator", %table_id, "Table deleted");
        Ok(())
    }

    /// Live table by qualified name
    pub fn find_table(&self, namespace_name: &str, table_name: &str) -> Option<TableMeta> {
        let state = self.state.read();
        let namespace = state.namespace_by_name(namespace_name)?;
        state
            .live_table_by_name(&namespace.id, table_name)
            .map(|t| t.meta.clone())
    }

    /// State of a table, `None` if it never existed
    pub fn table_state(&self, table_id: &TableId) -> Option<TableState> {
        self.state.read().tables.get(table_id).map(|t| t.state)
    }

    /// Tablets of a live table ordered by partition
    pub fn tablets_of(&self, table_id: &TableId) -> Result<Vec<TabletMeta>> {
        let state = self.state.read();
        let mut tablets = state.live_table(table_id)?.tablets.clone();
        tablets.sort_by_key(|t| t.partition);
        Ok(tablets)
    }

    /// Open a table: it must be running and every tablet hosted
    pub fn open_table(&self, table_id: &TableId) -> Result<TableHandle> {
        let (meta, mut tablets) = {
            let state = self.state.read();
            let entry = state.live_table(table_id)?;
            if entry.state != TableState::Running {
                return Err(SnapshotError::try_again(format!(
                    "table {} is still being created",
                    table_id
                )));
            }
            (entry.meta.clone(), entry.tablets.clone())
        };
        for tablet in &tablets {
            if self.cluster.peer(&tablet.id).is_none() {
                return Err(SnapshotError::try_again(format!(
                    "tablet {} of table {} is not hosted yet",
                    tablet.id, table_id
                )));
            }
        }
        tablets.sort_by_key(|t| t.partition);
        Ok(TableHandle { meta, tablets })
    }

    /// Open a table by qualified name
    pub fn open_table_by_name(&self, namespace_name: &str, table_name: &str) -> Result<TableHandle> {
        let meta = self.find_table(namespace_name, table_name).ok_or_else(|| {
            SnapshotError::not_found(format!("table {}.{}", namespace_name, table_name))
        })?;
        self.open_table(&meta.id)
    }

    /// Whether `tablet_id` belongs to a deleted table
    pub fn is_tablet_deleted(&self, tablet_id: &TabletId) -> bool {
        self.state.read().tables.values().any(|t| {
            t.state == TableState::Deleted && t.tablets.iter().any(|m| &m.id == tablet_id)
        })
    }

    /// Namespaces, schemas and tablets of `table_ids`; every table must be live
    pub fn describe(&self, table_ids: &[TableId]) -> Result<CatalogSlice> {
        let state = self.state.read();
        let mut slice = CatalogSlice::default();
        for table_id in table_ids {
            let entry = state.live_table(table_id)?;
            if !slice
                .namespaces
                .iter()
                .any(|n| n.id == entry.meta.namespace_id)
            {
                let namespace = state.namespaces.get(&entry.meta.namespace_id).ok_or_else(|| {
                    SnapshotError::illegal_state(format!(
                        "table {} refers to missing namespace {}",
                        table_id, entry.meta.namespace_id
                    ))
                })?;
                slice.namespaces.push(namespace.clone());
            }
            slice.tables.push(entry.meta.clone());
            let mut tablets = entry.tablets.clone();
            tablets.sort_by_key(|t| t.partition);
            slice.tablets.extend(tablets);
        }
        Ok(slice)
    }
}
