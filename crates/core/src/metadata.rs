//! Catalog metadata captured with a snapshot and the export/import formats
//!
//! A snapshot records the namespaces, table schemas and tablet partition
//! bounds of the tables it covers ([`CatalogSlice`]). Export wraps that slice
//! into a [`SnapshotMetadata`] blob; import maps it onto a destination
//! cluster and yields an [`ImportMapping`].
//!
//! # Blob Layout
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────────────────────┐
//! │ Magic "TSNP" │ Format Ver (1) │ SnapshotMetadata (msgpack)    │
//! └──────────────┴────────────────┴──────────────────────────────┘
//! ```

use crate::error::{Result, SnapshotError};
use crate::hybrid_time::HybridTime;
use crate::types::{NamespaceId, SnapshotId, TableId, TabletId};
use serde::{Deserialize, Serialize};

/// Magic bytes prefixing an exported metadata blob
pub const METADATA_MAGIC: [u8; 4] = *b"TSNP";

/// Current metadata blob format version
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Exclusive upper bound of the partition hash space
pub const PARTITION_HASH_SPACE: u32 = 0x1_0000;

/// Hash of a row key into the partition hash space (FNV-1a folded to 16 bits)
pub fn partition_hash(key: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash >> 16) ^ (hash & 0xFFFF)
}

/// Half-open hash range `[start, end)` owned by one tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionBounds {
    /// Inclusive lower bound
    pub start: u32,
    /// Exclusive upper bound
    pub end: u32,
}

impl PartitionBounds {
    /// Split the hash space into `count` contiguous ranges
    pub fn split(count: usize) -> Vec<PartitionBounds> {
        let count = count.max(1) as u32;
        let step = PARTITION_HASH_SPACE / count;
        (0..count)
            .map(|i| PartitionBounds {
                start: i * step,
                end: if i + 1 == count {
                    PARTITION_HASH_SPACE
                } else {
                    (i + 1) * step
                },
            })
            .collect()
    }

    /// Whether `hash` falls in this range
    pub fn contains(&self, hash: u32) -> bool {
        hash >= self.start && hash < self.end
    }
}

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Type name (opaque to the coordinator)
    pub type_name: String,
    /// Whether the column is part of the primary key
    pub is_key: bool,
}

impl ColumnSchema {
    /// Key column
    pub fn key(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_key: true,
        }
    }

    /// Non-key column
    pub fn value(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_key: false,
        }
    }
}

/// Namespace descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMeta {
    /// Namespace id
    pub id: NamespaceId,
    /// Namespace name, unique per cluster
    pub name: String,
}

/// Table descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table id
    pub id: TableId,
    /// Table name, unique per namespace
    pub name: String,
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Column list
    pub columns: Vec<ColumnSchema>,
}

/// Tablet descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMeta {
    /// Tablet id
    pub id: TabletId,
    /// Owning table
    pub table_id: TableId,
    /// Hash range
    pub partition: PartitionBounds,
}

/// Catalog objects covered by a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSlice {
    /// Namespaces owning the tables
    pub namespaces: Vec<NamespaceMeta>,
    /// Tables in snapshot order
    pub tables: Vec<TableMeta>,
    /// Every tablet of every table
    pub tablets: Vec<TabletMeta>,
}

impl CatalogSlice {
    /// Ids of all tablets in the slice
    pub fn tablet_ids(&self) -> Vec<TabletId> {
        self.tablets.iter().map(|t| t.id.clone()).collect()
    }

    /// Tablets of one table, ordered by partition start
    pub fn tablets_of(&self, table_id: &TableId) -> Vec<&TabletMeta> {
        let mut tablets: Vec<&TabletMeta> = self
            .tablets
            .iter()
            .filter(|t| &t.table_id == table_id)
            .collect();
        tablets.sort_by_key(|t| t.partition);
        tablets
    }

    /// Namespace descriptor by id
    pub fn namespace(&self, id: &NamespaceId) -> Option<&NamespaceMeta> {
        self.namespaces.iter().find(|n| &n.id == id)
    }
}

/// Exported snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Source snapshot
    pub snapshot_id: SnapshotId,
    /// Consistency point of the source snapshot
    pub snapshot_hybrid_time: HybridTime,
    /// Captured catalog objects
    pub catalog: CatalogSlice,
}

impl SnapshotMetadata {
    /// Encode into a self-describing blob
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec(self)?;
        let mut blob = Vec::with_capacity(payload.len() + 5);
        blob.extend_from_slice(&METADATA_MAGIC);
        blob.push(METADATA_FORMAT_VERSION);
        blob.extend_from_slice(&payload);
        Ok(blob)
    }

    /// Decode a blob produced by [`SnapshotMetadata::encode`]
    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() < 5 || blob[0..4] != METADATA_MAGIC {
            return Err(SnapshotError::invalid_argument(
                "snapshot metadata blob has no TSNP header",
            ));
        }
        if blob[4] != METADATA_FORMAT_VERSION {
            return Err(SnapshotError::invalid_argument(format!(
                "unsupported snapshot metadata format version {}",
                blob[4]
            )));
        }
        Ok(rmp_serde::from_slice(&blob[5..])?)
    }
}

/// Old/new id pair for one imported table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdMapping {
    /// Namespace id in the source cluster
    pub old_namespace_id: NamespaceId,
    /// Namespace id in this cluster
    pub new_namespace_id: NamespaceId,
    /// Table id in the source cluster
    pub old_table_id: TableId,
    /// Table id in this cluster
    pub new_table_id: TableId,
    /// Tablet pairs, matched by partition bounds
    pub tablets: Vec<(TabletId, TabletId)>,
}

/// Result of an import: old id → new id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMapping {
    /// One entry per imported table
    pub tables: Vec<TableIdMapping>,
}

impl ImportMapping {
    /// New `(namespace, table)` for an old `(namespace, table)`
    pub fn lookup(
        &self,
        old_namespace_id: &NamespaceId,
        old_table_id: &TableId,
    ) -> Option<(&NamespaceId, &TableId)> {
        self.tables
            .iter()
            .find(|m| &m.old_namespace_id == old_namespace_id && &m.old_table_id == old_table_id)
            .map(|m| (&m.new_namespace_id, &m.new_table_id))
    }

    /// New tablet id for an old tablet id
    pub fn new_tablet_id(&self, old: &TabletId) -> Option<&TabletId> {
        self.tables
            .iter()
            .flat_map(|m| m.tablets.iter())
            .find(|(o, _)| o == old)
            .map(|(_, n)| n)
    }

    /// Ids of every table created or matched by the import
    pub fn new_table_ids(&self) -> Vec<TableId> {
        self.tables.iter().map(|m| m.new_table_id.clone()).collect()
    }
}
