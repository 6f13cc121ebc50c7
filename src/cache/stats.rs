//! Cache Statistics Module
//!
//! Tracks per-tier hits and misses, evictions, integrity failures and get latency.

use std::time::Duration;

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads served from the memory tier
    pub memory_hits: u64,
    /// Reads served from the persistent tier (and promoted)
    pub persistent_hits: u64,
    /// Reads that found no valid value in any tier
    pub misses: u64,
    /// Successful `set` calls
    pub sets: u64,
    /// `set` calls rejected by the concurrency bound
    pub rejected_sets: u64,
    /// `delete` calls that removed something
    pub deletes: u64,
    /// Entries evicted from the memory tier by capacity
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Reads rejected because the checksum did not verify
    pub checksum_failures: u64,
    /// Persistent tier I/O or decode failures
    pub persistent_errors: u64,
    /// Rolling mean of `get` latency in microseconds
    pub avg_get_latency_us: f64,
    /// Entries currently in the memory tier
    pub total_entries: usize,
    /// Bytes currently stored in the memory tier
    pub memory_bytes: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `get` calls observed.
    pub fn total_gets(&self) -> u64 {
        self.memory_hits + self.persistent_hits + self.misses
    }

    pub fn hits(&self) -> u64 {
        self.memory_hits + self.persistent_hits
    }

    // == Hit Rate ==
    /// Returns hits / gets, or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_gets();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn record_memory_hit(&mut self) {
        self.memory_hits += 1;
    }

    pub fn record_persistent_hit(&mut self) {
        self.persistent_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_set(&mut self) {
        self.sets += 1;
    }

    pub fn record_rejected_set(&mut self) {
        self.rejected_sets += 1;
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
    }

    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub fn record_checksum_failure(&mut self) {
        self.checksum_failures += 1;
    }

    pub fn record_persistent_error(&mut self) {
        self.persistent_errors += 1;
    }

    // == Latency ==
    /// Folds one `get` latency sample into the rolling mean.
    ///
    /// Must be called after the hit/miss counter for the same call.
    pub fn record_get_latency(&mut self, elapsed: Duration) {
        let n = self.total_gets().max(1) as f64;
        let sample = elapsed.as_secs_f64() * 1_000_000.0;
        self.avg_get_latency_us += (sample - self.avg_get_latency_us) / n;
    }
}
