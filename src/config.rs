use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Default entry TTL: 5 minutes in milliseconds
const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Default retention for completed sync tasks: 1 hour
const DEFAULT_SYNC_RETENTION_SECS: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for cache entries before they are considered expired
    pub ttl: Duration,
    /// How often the eviction sweep runs
    pub eviction_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of sync tasks attempted concurrently per tick
    pub max_concurrent_syncs: usize,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Upper bound for backoff delays
    pub max_delay: Duration,
    /// Default retry budget for enqueued tasks
    pub default_max_retries: u32,
    /// How long completed and permanently failed tasks are kept for status queries
    pub retention: Duration,
    /// How often the scheduler polls for due tasks
    pub poll_interval: Duration,
    /// Tasks at or above this priority trigger an immediate out-of-band tick
    pub high_priority_threshold: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig {
                ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
                eviction_sweep_interval: Duration::from_secs(30),
            },
            sync: SyncConfig {
                max_concurrent_syncs: 4,
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(30),
                default_max_retries: 3,
                retention: Duration::from_secs(DEFAULT_SYNC_RETENTION_SECS),
                poll_interval: Duration::from_millis(500),
                high_priority_threshold: 100,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = env::var("CACHE_TTL_MS") {
            let ms: u64 = v.parse().context("CACHE_TTL_MS must be an integer")?;
            config.cache.ttl = Duration::from_millis(ms);
        }

        if let Ok(v) = env::var("EVICTION_SWEEP_MS") {
            let ms: u64 = v.parse().context("EVICTION_SWEEP_MS must be an integer")?;
            config.cache.eviction_sweep_interval = Duration::from_millis(ms);
        }

        if let Ok(v) = env::var("SYNC_MAX_CONCURRENT") {
            config.sync.max_concurrent_syncs =
                v.parse().context("SYNC_MAX_CONCURRENT must be an integer")?;
        }

        if let Ok(v) = env::var("SYNC_BASE_DELAY_MS") {
            let ms: u64 = v.parse().context("SYNC_BASE_DELAY_MS must be an integer")?;
            config.sync.base_delay = Duration::from_millis(ms);
        }

        if let Ok(v) = env::var("SYNC_MAX_DELAY_MS") {
            let ms: u64 = v.parse().context("SYNC_MAX_DELAY_MS must be an integer")?;
            config.sync.max_delay = Duration::from_millis(ms);
        }

        if let Ok(v) = env::var("SYNC_MAX_RETRIES") {
            config.sync.default_max_retries =
                v.parse().context("SYNC_MAX_RETRIES must be an integer")?;
        }

        if let Ok(v) = env::var("SYNC_RETENTION_SECS") {
            let secs: u64 = v.parse().context("SYNC_RETENTION_SECS must be an integer")?;
            config.sync.retention = Duration::from_secs(secs);
        }

        if let Ok(v) = env::var("SYNC_HIGH_PRIORITY_THRESHOLD") {
            config.sync.high_priority_threshold = v
                .parse()
                .context("SYNC_HIGH_PRIORITY_THRESHOLD must be an integer")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.ttl, Duration::from_millis(DEFAULT_CACHE_TTL_MS));
        assert_eq!(config.sync.base_delay, Duration::from_millis(1000));
        assert_eq!(config.sync.retention, Duration::from_secs(3600));
    }
}
