//! Coordinator configuration via `tabletsnap.toml`
//!
//! Every knob has a default, so an empty file is a valid configuration. On
//! first start a commented default file can be written next to the operation
//! log; edit it and restart the coordinator to change settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabletsnap_core::SnapshotError;
use tabletsnap_durability::{DurabilityMode, LogConfig};
use thiserror::Error;

/// Config file name placed in the coordinator data directory
pub const CONFIG_FILE_NAME: &str = "tabletsnap.toml";

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("config file '{path}': {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse config file '{path}': {message}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SnapshotError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io { .. } => SnapshotError::Io(e.to_string()),
            ConfigError::Parse { .. } | ConfigError::Invalid(_) => {
                SnapshotError::invalid_argument(e.to_string())
            }
        }
    }
}

/// History retention settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How far the history cutoff lags the current time (default: 15 minutes)
    pub retention_interval_ms: u64,
    /// Period of the cutoff propagation thread (default: 3 minutes)
    pub propagation_interval_ms: u64,
    /// Lifetime of a snapshot hold that is not renewed (default: 60 seconds)
    pub hold_lease_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_interval_ms: 900_000,
            propagation_interval_ms: 180_000,
            hold_lease_ms: 60_000,
        }
    }
}

impl RetentionConfig {
    /// Retention interval as a duration
    pub fn retention_interval(&self) -> Duration {
        Duration::from_millis(self.retention_interval_ms)
    }

    /// Propagation interval as a duration
    pub fn propagation_interval(&self) -> Duration {
        Duration::from_millis(self.propagation_interval_ms)
    }

    /// Hold lease as a duration
    pub fn hold_lease(&self) -> Duration {
        Duration::from_millis(self.hold_lease_ms)
    }
}

/// Coordinator configuration loaded from `tabletsnap.toml`
///
/// # Example
///
/// ```toml
/// poll_interval_ms = 2000
/// cleanup_delay_ms = 30000
///
/// [retention]
/// retention_interval_ms = 900000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the poll loop (default: 2 seconds)
    pub poll_interval_ms: u64,
    /// Deadline of a snapshot creation, from its creation time (default: 2 minutes)
    pub snapshot_timeout_ms: u64,
    /// Deadline of a restoration, from its creation time (default: 2 minutes)
    pub restore_timeout_ms: u64,
    /// Age after which DELETED/FAILED records are purged (default: 30 seconds)
    pub cleanup_delay_ms: u64,
    /// Worker threads delivering participant RPCs (default: 4)
    pub rpc_workers: usize,
    /// Upper bound on workers, including extra ones started while every
    /// worker is blocked on a slow participant (default: 64)
    pub rpc_max_workers: usize,
    /// Deadline of a single participant RPC (default: 10 seconds)
    pub rpc_timeout_ms: u64,
    /// Operation log fsync policy: `"always"` (default) or `"buffered"`
    pub durability: String,
    /// Superseded log frames tolerated before compaction (default: 1024)
    pub compaction_threshold: usize,
    /// Bound on clock skew between nodes (default: 500 ms)
    pub max_clock_skew_ms: u64,
    /// History retention
    pub retention: RetentionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            snapshot_timeout_ms: 120_000,
            restore_timeout_ms: 120_000,
            cleanup_delay_ms: 30_000,
            rpc_workers: 4,
            rpc_max_workers: 64,
            rpc_timeout_ms: 10_000,
            durability: "always".to_string(),
            compaction_threshold: 1024,
            max_clock_skew_ms: 500,
            retention: RetentionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Short intervals for tests
    pub fn for_testing() -> Self {
        Self {
            poll_interval_ms: 50,
            snapshot_timeout_ms: 20_000,
            restore_timeout_ms: 20_000,
            cleanup_delay_ms: 300_000,
            rpc_workers: 4,
            rpc_max_workers: 32,
            rpc_timeout_ms: 2_000,
            durability: "buffered".to_string(),
            compaction_threshold: 16,
            max_clock_skew_ms: 500,
            retention: RetentionConfig {
                retention_interval_ms: 60_000,
                propagation_interval_ms: 20,
                hold_lease_ms: 2_000,
            },
        }
    }

    /// Poll period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Snapshot creation deadline
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Restoration deadline
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    /// Cleanup delay at startup; adjustable at runtime on the coordinator
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    /// Participant RPC deadline
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Clock skew bound
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    /// Parse the durability string
    pub fn durability_mode(&self) -> Result<DurabilityMode, ConfigError> {
        match self.durability.as_str() {
            "always" => Ok(DurabilityMode::Always),
            "buffered" => Ok(DurabilityMode::Buffered),
            other => Err(ConfigError::Invalid(format!(
                "durability '{}' is not \"always\" or \"buffered\"",
                other
            ))),
        }
    }

    /// Operation log configuration derived from this file
    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        Ok(LogConfig::default()
            .with_durability(self.durability_mode()?)
            .with_compaction_threshold(self.compaction_threshold))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.rpc_workers == 0 {
            return Err(ConfigError::Invalid("rpc_workers must be positive".into()));
        }
        if self.rpc_max_workers < self.rpc_workers {
            return Err(ConfigError::Invalid(format!(
                "rpc_max_workers ({}) is below rpc_workers ({})",
                self.rpc_max_workers, self.rpc_workers
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("rpc_timeout_ms must be positive".into()));
        }
        if self.snapshot_timeout_ms == 0 || self.restore_timeout_ms == 0 {
            return Err(ConfigError::Invalid("operation timeouts must be positive".into()));
        }
        if self.retention.propagation_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retention.propagation_interval_ms must be positive".into(),
            ));
        }
        if self.retention.hold_lease_ms <= self.poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "retention.hold_lease_ms ({}) must exceed poll_interval_ms ({}) or holds lapse between renewals",
                self.retention.hold_lease_ms, self.poll_interval_ms
            )));
        }
        self.durability_mode()?;
        Ok(())
    }

    /// Default file content with comments
    pub fn default_toml() -> &'static str {
        r#"# tabletsnap coordinator configuration

# Poll loop period in milliseconds
poll_interval_ms = 2000

# Deadlines, measured from the creation time of the snapshot / restoration
snapshot_timeout_ms = 120000
restore_timeout_ms = 120000

# DELETED and FAILED records are purged this long after they finished
cleanup_delay_ms = 30000

# Threads delivering participant RPCs; more are started up to
# rpc_max_workers while every worker waits on a slow participant
rpc_workers = 4
rpc_max_workers = 64
# A participant that has not answered within this deadline counts as unavailable
rpc_timeout_ms = 10000

# Operation log fsync policy: "always" (default) or "buffered"
#   "always"   = fsync every commit
#   "buffered" = flush to the OS only, survives process crashes
durability = "always"
compaction_threshold = 1024

max_clock_skew_ms = 500

[retention]
# The history cutoff lags the current time by this much
retention_interval_ms = 900000
# How often the cutoff is pushed to tablets
propagation_interval_ms = 180000
# A snapshot hold not renewed for this long lapses
hold_lease_ms = 60000
"#
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CoordinatorConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file unless one exists
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
