//! Analysis Runtime - caching and parallel execution for PHP analysis
//!
//! Provides a two-tier (memory + disk) cache with TTL, LRU eviction and
//! dependency invalidation, a dynamic worker pool for CPU-bound analysis
//! tasks, and an HTTP admin API exposing both.

pub mod analysis;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheManager, SetOptions};
pub use config::{CacheConfig, Config, PoolConfig};
pub use error::{ApiError, CacheError, PoolError, TaskError};
pub use pool::{HandlerRegistry, TaskHandler, TaskOptions, TaskOutput, WorkerPool};
pub use tasks::spawn_cleanup_task;
