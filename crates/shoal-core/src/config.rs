//! Sharding Configuration
//!
//! Centralized configuration for all sharding timeouts, backoffs and
//! capacities, with environment variable overrides for the values most
//! often tuned in deployment.

use std::time::Duration;

/// Sharding configuration with sensible defaults.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Optional cluster role gating which nodes host the coordinator and
    /// entries. `None` means every node may host. (env: SHOAL_ROLE)
    pub role: Option<String>,

    /// Name of the per-node guardian registry; part of every region key.
    /// (env: SHOAL_GUARDIAN_NAME)
    pub guardian_name: String,

    /// Delay before the supervisor restarts a failed coordinator.
    pub coordinator_failure_backoff: Duration,

    /// Cadence at which a region retries registration and re-requests
    /// homes for buffered shards. (env: SHOAL_RETRY_INTERVAL_MS)
    pub retry_interval: Duration,

    /// Cap on buffered messages, summed across shards, per region and per
    /// shard. Overflow drops to dead letters. (env: SHOAL_BUFFER_SIZE)
    pub buffer_size: usize,

    /// How long a rebalance worker waits for a handoff to complete before
    /// giving up. (env: SHOAL_HANDOFF_TIMEOUT_MS)
    pub hand_off_timeout: Duration,

    /// Delay before the coordinator re-sends `HostShard` when the region
    /// has not acknowledged with `ShardStarted`.
    pub shard_start_timeout: Duration,

    /// Delay before a shard retries a failed persistence operation.
    pub shard_failure_backoff: Duration,

    /// Delay before a remembered entry that stopped without passivating is
    /// restarted.
    pub entry_restart_backoff: Duration,

    /// Coordinator rebalance tick interval. (env: SHOAL_REBALANCE_INTERVAL_MS)
    pub rebalance_interval: Duration,

    /// Snapshot tick interval for coordinator and shards.
    pub snapshot_interval: Duration,

    /// Tuning for the default least-shard allocation strategy.
    pub least_shard: LeastShardConfig,
}

/// Tuning knobs for [`crate::strategy::LeastShardAllocation`].
#[derive(Debug, Clone)]
pub struct LeastShardConfig {
    /// Minimum difference between the most and least allocated region
    /// before a shard is rebalanced.
    pub rebalance_threshold: usize,

    /// Maximum number of shards rebalanced concurrently.
    pub max_simultaneous_rebalance: usize,
}

impl Default for LeastShardConfig {
    fn default() -> Self {
        Self {
            rebalance_threshold: 10,
            max_simultaneous_rebalance: 3,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            role: None,
            guardian_name: "sharding".to_string(),
            coordinator_failure_backoff: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            buffer_size: 100_000,
            hand_off_timeout: Duration::from_secs(60),
            shard_start_timeout: Duration::from_secs(10),
            shard_failure_backoff: Duration::from_secs(10),
            entry_restart_backoff: Duration::from_secs(10),
            rebalance_interval: Duration::from_secs(10),
            snapshot_interval: Duration::from_secs(3600),
            least_shard: LeastShardConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Create configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(role) = std::env::var("SHOAL_ROLE") {
            if !role.is_empty() {
                config.role = Some(role);
            }
        }

        if let Ok(name) = std::env::var("SHOAL_GUARDIAN_NAME") {
            if !name.is_empty() {
                config.guardian_name = name;
            }
        }

        if let Ok(size) = std::env::var("SHOAL_BUFFER_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                config.buffer_size = parsed;
            }
        }

        if let Ok(ms) = std::env::var("SHOAL_RETRY_INTERVAL_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.retry_interval = Duration::from_millis(parsed);
            }
        }

        if let Ok(ms) = std::env::var("SHOAL_HANDOFF_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.hand_off_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(ms) = std::env::var("SHOAL_REBALANCE_INTERVAL_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.rebalance_interval = Duration::from_millis(parsed);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShardingConfig::default();
        assert!(config.role.is_none());
        assert_eq!(config.guardian_name, "sharding");
        assert_eq!(config.retry_interval, Duration::from_secs(2));
        assert_eq!(config.buffer_size, 100_000);
        assert_eq!(config.least_shard.rebalance_threshold, 10);
        assert_eq!(config.least_shard.max_simultaneous_rebalance, 3);
    }
}
