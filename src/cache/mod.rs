//! Cache Module
//!
//! Two-tier cache for analysis results: a bounded in-memory tier with TTL
//! and LRU eviction in front of an optional file-backed persistent tier.
//! Values are serialized to JSON, optionally gzip-compressed and guarded by a
//! SHA-256 checksum. Keys may declare dependencies so that invalidating a
//! source invalidates everything derived from it.

pub mod codec;
mod dependency;
mod entry;
mod lru;
mod manager;
mod memory;
mod persistent;
mod stats;


// Re-export public types
pub use codec::EncodedValue;
pub use dependency::DependencyGraph;
pub use entry::{current_timestamp_ms, CacheEntry};
pub use lru::LruTracker;
pub use manager::{CacheManager, SetOptions};
pub use memory::{InsertOutcome, Lookup, MemoryTier};
pub use persistent::{DiskTier, SweepReport};
pub use stats::CacheStats;
