//! Configuration Module
//!
//! Loads cache, worker pool and server settings from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Reads and parses an environment variable, falling back to `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(name, default_ms))
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// == Cache Config ==
/// Settings for the two-tier cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held in the memory tier
    pub memory_max_entries: usize,
    /// Maximum total stored bytes in the memory tier
    pub memory_max_bytes: usize,
    /// TTL applied when `set` does not specify one
    pub default_ttl: Duration,
    /// Serialized size at or above which values are gzip-compressed
    pub compression_threshold: usize,
    /// Directory of the persistent tier; `None` keeps the cache memory-only
    pub persistent_dir: Option<PathBuf>,
    /// Byte budget of the persistent tier, enforced by the cleanup sweep
    pub persistent_max_bytes: u64,
    /// Bound on concurrently running `set` operations
    pub max_concurrent_sets: usize,
    /// Interval of the background TTL sweep
    pub cleanup_interval: Duration,
}

impl CacheConfig {
    /// # Environment Variables
    /// - `CACHE_MAX_ENTRIES` (default: 1000)
    /// - `CACHE_MAX_MEMORY_BYTES` (default: 64 MiB)
    /// - `CACHE_DEFAULT_TTL_MS` (default: 300000)
    /// - `CACHE_COMPRESSION_THRESHOLD` (default: 1024)
    /// - `CACHE_PERSISTENT_DIR` (default: unset, memory only)
    /// - `CACHE_PERSISTENT_MAX_BYTES` (default: 256 MiB)
    /// - `CACHE_MAX_CONCURRENT_SETS` (default: 64)
    /// - `CACHE_CLEANUP_INTERVAL_MS` (default: 60000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_max_entries: env_or("CACHE_MAX_ENTRIES", defaults.memory_max_entries),
            memory_max_bytes: env_or("CACHE_MAX_MEMORY_BYTES", defaults.memory_max_bytes),
            default_ttl: env_ms("CACHE_DEFAULT_TTL_MS", 300_000),
            compression_threshold: env_or(
                "CACHE_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            ),
            persistent_dir: env::var("CACHE_PERSISTENT_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            persistent_max_bytes: env_or(
                "CACHE_PERSISTENT_MAX_BYTES",
                defaults.persistent_max_bytes,
            ),
            max_concurrent_sets: env_or("CACHE_MAX_CONCURRENT_SETS", defaults.max_concurrent_sets),
            cleanup_interval: env_ms("CACHE_CLEANUP_INTERVAL_MS", 60_000),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: 1000,
            memory_max_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_millis(300_000),
            compression_threshold: 1024,
            persistent_dir: None,
            persistent_max_bytes: 256 * 1024 * 1024,
            max_concurrent_sets: 64,
            cleanup_interval: Duration::from_millis(60_000),
        }
    }
}

// == Pool Config ==
/// Settings for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Maximum number of queued (not yet dispatched) tasks
    pub queue_size: usize,
    /// Timeout applied when a submission does not specify one
    pub task_timeout: Duration,
    /// Retry budget applied when a submission does not specify one
    pub max_retries: u32,
    /// Retry `n` becomes visible `backoff_base * n` after the failure
    pub backoff_base: Duration,
    /// Interval between worker heartbeats
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker is presumed wedged
    pub heartbeat_timeout: Duration,
    pub health_check_interval: Duration,
    /// Scheduling tick; also bounds how late a backed-off retry is picked up
    pub dispatch_interval: Duration,
    pub scale_interval: Duration,
    /// Scale up when queued tasks exceed `workers * scale_up_queue_ratio`
    pub scale_up_queue_ratio: usize,
    /// Consecutive deep-queue checks required before scaling up
    pub scale_up_ticks: u32,
    /// Idle time after which a surplus worker is retired
    pub idle_timeout: Duration,
    /// Hard bound on how long `destroy` waits for in-flight work
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    /// # Environment Variables
    /// - `POOL_MIN_WORKERS` (default: 1)
    /// - `POOL_MAX_WORKERS` (default: available parallelism)
    /// - `POOL_QUEUE_SIZE` (default: 1000)
    /// - `POOL_TASK_TIMEOUT_MS` (default: 30000)
    /// - `POOL_MAX_RETRIES` (default: 3)
    /// - `POOL_BACKOFF_BASE_MS` (default: 1000)
    /// - `POOL_HEARTBEAT_INTERVAL_MS` (default: 5000)
    /// - `POOL_HEARTBEAT_TIMEOUT_MS` (default: 30000)
    /// - `POOL_HEALTH_CHECK_INTERVAL_MS` (default: 10000)
    /// - `POOL_SCALE_INTERVAL_MS` (default: 5000)
    /// - `POOL_IDLE_TIMEOUT_MS` (default: 60000)
    /// - `POOL_SHUTDOWN_TIMEOUT_MS` (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let min_workers = env_or("POOL_MIN_WORKERS", defaults.min_workers).max(1);
        let max_workers = env_or("POOL_MAX_WORKERS", defaults.max_workers).max(min_workers);
        Self {
            min_workers,
            max_workers,
            queue_size: env_or("POOL_QUEUE_SIZE", defaults.queue_size),
            task_timeout: env_ms("POOL_TASK_TIMEOUT_MS", 30_000),
            max_retries: env_or("POOL_MAX_RETRIES", defaults.max_retries),
            backoff_base: env_ms("POOL_BACKOFF_BASE_MS", 1_000),
            heartbeat_interval: env_ms("POOL_HEARTBEAT_INTERVAL_MS", 5_000),
            heartbeat_timeout: env_ms("POOL_HEARTBEAT_TIMEOUT_MS", 30_000),
            health_check_interval: env_ms("POOL_HEALTH_CHECK_INTERVAL_MS", 10_000),
            scale_interval: env_ms("POOL_SCALE_INTERVAL_MS", 5_000),
            idle_timeout: env_ms("POOL_IDLE_TIMEOUT_MS", 60_000),
            shutdown_timeout: env_ms("POOL_SHUTDOWN_TIMEOUT_MS", 30_000),
            ..defaults
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: default_max_workers(),
            queue_size: 1000,
            task_timeout: Duration::from_millis(30_000),
            max_retries: 3,
            backoff_base: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_millis(5_000),
            heartbeat_timeout: Duration::from_millis(30_000),
            health_check_interval: Duration::from_millis(10_000),
            dispatch_interval: Duration::from_millis(50),
            scale_interval: Duration::from_millis(5_000),
            scale_up_queue_ratio: 2,
            scale_up_ticks: 2,
            idle_timeout: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Runtime configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    /// HTTP port of the admin API
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// `SERVER_PORT` selects the admin API port (default: 3000); see
    /// [`CacheConfig::from_env`] and [`PoolConfig::from_env`] for the rest.
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            pool: PoolConfig::from_env(),
            server_port: env_or("SERVER_PORT", 3000),
        }
    }
}
