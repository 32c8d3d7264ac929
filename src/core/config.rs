use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the write-ahead log synchronizes appended markers to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync on every commit marker
    Sync,
    /// background flushes only
    #[default]
    Async,
    /// no log at all (testing)
    None,
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub durability: DurabilityMode,

    /// Upper bound for acquiring collection and compaction locks.
    pub lock_timeout: Duration,

    /// How long a write transaction waits for the WAL throttle to clear
    /// before failing with WriteThrottleTimeout.
    pub throttle_max_wait: Duration,

    /// Sleep interval of the throttle wait loop.
    pub throttle_poll_interval: Duration,

    /// Capacity of the transaction manager's recent-status cache.
    pub status_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            lock_timeout: Duration::from_secs(10),
            throttle_max_wait: Duration::from_secs(5),
            throttle_poll_interval: Duration::from_millis(50),
            status_cache_capacity: 16384,
        }
    }
}
