//! Cache Entry Module
//!
//! Defines the unit of storage: checksummed, optionally compressed bytes with
//! TTL and access metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::codec::EncodedValue;

// == Cache Entry ==
/// A single stored value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Caller-constructed key, often a content hash
    pub key: String,
    /// Stored representation (gzip bytes when `compressed`)
    pub data: Vec<u8>,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Time to live in milliseconds
    pub ttl_ms: u64,
    /// Number of successful reads
    pub access_count: u64,
    /// Timestamp of the last successful read (Unix milliseconds)
    pub last_accessed_at: u64,
    /// Whether `data` is gzip-compressed
    pub compressed: bool,
    /// SHA-256 hex digest of the uncompressed serialized value
    pub checksum: String,
    /// Position in the memory tier's LRU order; meaningless outside that tier
    pub(crate) lru_tick: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry stamped with the current time.
    pub fn new(key: impl Into<String>, value: EncodedValue, ttl: Duration) -> Self {
        Self::with_created_at(key, value, ttl, current_timestamp_ms())
    }

    /// Creates a new entry with an explicit creation timestamp.
    pub fn with_created_at(
        key: impl Into<String>,
        value: EncodedValue,
        ttl: Duration,
        created_at: u64,
    ) -> Self {
        Self {
            key: key.into(),
            data: value.bytes,
            created_at,
            ttl_ms: ttl.as_millis() as u64,
            access_count: 0,
            last_accessed_at: created_at,
            compressed: value.compressed,
            checksum: value.checksum,
            lru_tick: 0,
        }
    }

    // == Validity ==
    /// An entry is valid iff `now - created_at < ttl`.
    pub fn is_valid_at(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) < self.ttl_ms
    }

    /// Checks validity against the wall clock.
    pub fn is_expired(&self) -> bool {
        !self.is_valid_at(current_timestamp_ms())
    }

    /// Unix millisecond timestamp at which the entry stops being valid.
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl_ms)
    }

    /// Returns remaining TTL in milliseconds, `0` once expired.
    pub fn ttl_remaining_ms(&self) -> u64 {
        self.expires_at().saturating_sub(current_timestamp_ms())
    }

    // == Access Tracking ==
    /// Records a successful read.
    pub fn record_access(&mut self, now: u64) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    /// Size of the stored (possibly compressed) representation.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
