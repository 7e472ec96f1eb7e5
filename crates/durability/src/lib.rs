//! Durability layer for tabletsnap
//!
//! This crate holds the persisted operation log: one record per snapshot or
//! restoration entity, keyed by id, written with compare-and-set semantics.
//! The coordinator rebuilds its in-memory state from this log on every
//! leadership acquisition.
//!
//! - [`OperationLog`]: the seam the coordinator talks to
//! - [`MemoryOperationLog`]: in-process log that outlives coordinator instances
//! - [`FileOperationLog`]: CRC-framed append-only file with replay and compaction

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod file_log;
pub mod frame;
pub mod memory_log;
pub mod oplog;

pub use config::{DurabilityMode, LogConfig};
pub use error::{LogError, LogResult};
pub use file_log::{FileOperationLog, LOG_FILE_NAME};
pub use memory_log::MemoryOperationLog;
pub use oplog::{OperationLog, StoredRecord};
