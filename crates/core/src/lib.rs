//! Core types and traits for tabletsnap
//!
//! This crate defines the foundational types shared by every layer:
//! - Identifiers: SnapshotId, RestoreId, NamespaceId, TableId, TabletId, ServerId
//! - HybridTime and the Clock seam (HybridClock)
//! - SnapshotError: structured error with an explicit status code
//! - Entities: SnapshotEntity, RestoreEntity and the versioned SysRecord
//! - Participant protocol: requests, outcomes and the ParticipantTransport seam
//! - Catalog metadata: CatalogSlice, SnapshotMetadata, ImportMapping

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod error;
pub mod hybrid_time;
pub mod metadata;
pub mod participant;
pub mod types;

pub use entity::{
    RecordKey, RestoreEntity, RestoreState, SnapshotEntity, SnapshotState, SysEntry, SysRecord,
    TabletOpStatus, SYS_RECORD_FORMAT_VERSION,
};
pub use error::{ErrorCode, Result, SnapshotError};
pub use hybrid_time::{Clock, HybridClock, HybridTime};
pub use metadata::{
    CatalogSlice, ColumnSchema, ImportMapping, NamespaceMeta, PartitionBounds, SnapshotMetadata,
    partition_hash, TableIdMapping, TableMeta, TabletMeta, PARTITION_HASH_SPACE,
};
pub use participant::{
    OpKind, OperationId, ParticipantRequest, ParticipantTransport, TabletOpOutcome,
    TabletOperation,
};
pub use types::{NamespaceId, RestoreId, ServerId, SnapshotId, TableId, TabletId};
