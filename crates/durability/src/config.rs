//! Operation log configuration

/// When the log file is fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every commit (the default)
    ///
    /// A commit that returned `Ok` survives a crash of the process and the
    /// machine.
    Always,

    /// Flush to the OS only
    ///
    /// Survives a process crash, not a machine crash. Used by tests that
    /// restart the coordinator many times.
    Buffered,
}

impl DurabilityMode {
    /// Whether every commit is followed by an fsync
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }
}

/// Operation log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// fsync policy
    pub durability: DurabilityMode,

    /// Superseded frames tolerated before the file is compacted (default: 1024)
    ///
    /// Compaction also requires superseded frames to outnumber live records.
    pub compaction_threshold: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            durability: DurabilityMode::Always,
            compaction_threshold: 1024,
        }
    }
}

impl LogConfig {
    /// Configuration for tests: no fsync, eager compaction
    pub fn for_testing() -> Self {
        LogConfig {
            durability: DurabilityMode::Buffered,
            compaction_threshold: 16,
        }
    }

    /// Set the durability mode
    pub fn with_durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Set the compaction threshold
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }
}
