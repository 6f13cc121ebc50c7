//! Cache Manager Module
//!
//! Two-tier cache front: memory first, persistent tier second, with
//! compression, checksums, TTL, LRU eviction and dependency cascades.
//! Failures inside either tier degrade to cache misses; only the two `set`
//! rejections ever reach callers.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::codec;
use crate::cache::dependency::DependencyGraph;
use crate::cache::entry::current_timestamp_ms;
use crate::cache::memory::{Lookup, MemoryTier};
use crate::cache::persistent::DiskTier;
use crate::cache::{CacheEntry, CacheStats};
use crate::config::CacheConfig;
use crate::error::CacheError;

// == Set Options ==
/// Per-call options for [`CacheManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
    /// Keys this value is derived from
    pub dependencies: Vec<String>,
    /// Compress regardless of the size threshold
    pub force_compression: bool,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn compressed(mut self) -> Self {
        self.force_compression = true;
        self
    }
}

// == Cache Manager ==
/// Two-tier cache shared by analyzers and workers.
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    memory: MemoryTier,
    disk: Option<DiskTier>,
    dependencies: RwLock<DependencyGraph>,
    stats: Mutex<CacheStats>,
    set_permits: Semaphore,
}

impl CacheManager {
    // == Constructor ==
    /// Builds a manager from configuration.
    ///
    /// If the persistent directory cannot be opened the cache runs memory-only.
    pub fn new(config: CacheConfig) -> Self {
        let disk = config.persistent_dir.as_ref().and_then(|dir| {
            match DiskTier::open(dir, config.persistent_max_bytes) {
                Ok(disk) => {
                    info!("Persistent cache tier at {}", dir.display());
                    Some(disk)
                }
                Err(e) => {
                    warn!("Persistent cache tier unavailable, running memory-only: {}", e);
                    None
                }
            }
        });

        Self {
            memory: MemoryTier::new(config.memory_max_entries, config.memory_max_bytes),
            disk,
            dependencies: RwLock::new(DependencyGraph::new()),
            stats: Mutex::new(CacheStats::new()),
            set_permits: Semaphore::new(config.max_concurrent_sets),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a persistent tier is attached.
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    // == Get ==
    /// Returns the value stored under `key`, or `None` on any kind of miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = Instant::now();
        let raw = self.lookup(key).await;
        self.stats.lock().record_get_latency(started.elapsed());

        let raw = raw?;
        match codec::deserialize(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("cached value for {} does not match requested type: {}", key, e);
                None
            }
        }
    }

    /// Returns verified, uncompressed serialized bytes and records tier stats.
    async fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let now = current_timestamp_ms();

        match self.memory.get(key, now) {
            Lookup::Hit(entry) => match codec::decode_entry(&entry) {
                Ok(raw) => {
                    self.stats.lock().record_memory_hit();
                    return Some(raw);
                }
                Err(e) => {
                    warn!("discarding corrupted memory entry: {}", e);
                    self.stats.lock().record_checksum_failure();
                    self.memory.remove(key);
                }
            },
            Lookup::Expired => {
                debug!("cache entry expired: {}", key);
                self.stats.lock().record_expirations(1);
                self.invalidate_expired(key).await;
                self.stats.lock().record_miss();
                return None;
            }
            Lookup::Miss => {}
        }

        let found = match &self.disk {
            Some(disk) => self.lookup_persistent(disk, key, now).await,
            None => None,
        };
        let mut stats = self.stats.lock();
        match found {
            Some(_) => stats.record_persistent_hit(),
            None => stats.record_miss(),
        }
        found
    }

    async fn lookup_persistent(&self, disk: &DiskTier, key: &str, now: u64) -> Option<Vec<u8>> {
        let mut entry = match disk.read(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(CacheError::CorruptRecord { path, reason }) => {
                warn!("purging corrupt cache record {}: {}", path.display(), reason);
                self.stats.lock().record_persistent_error();
                disk.purge(key).await;
                return None;
            }
            Err(e) => {
                warn!("persistent cache read failed: {}", e);
                self.stats.lock().record_persistent_error();
                return None;
            }
        };

        if !entry.is_valid_at(now) {
            self.stats.lock().record_expirations(1);
            disk.purge(key).await;
            return None;
        }

        let raw = match codec::decode_entry(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("purging persisted entry that failed verification: {}", e);
                self.stats.lock().record_checksum_failure();
                disk.purge(key).await;
                return None;
            }
        };

        entry.record_access(now);
        let outcome = self.memory.insert(entry);
        self.stats.lock().record_evictions(outcome.evicted.len());
        debug!("promoted {} into memory tier", key);
        Some(raw)
    }

    // == Set ==
    /// Stores `value` under `key`.
    ///
    /// Rejects immediately with [`CacheError::TooManyConcurrentOperations`]
    /// when `max_concurrent_sets` writes are already in flight. Persistent
    /// tier failures are logged and do not fail the call.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        let _permit = self.set_permits.try_acquire().map_err(|_| {
            self.stats.lock().record_rejected_set();
            CacheError::TooManyConcurrentOperations {
                limit: self.config.max_concurrent_sets,
            }
        })?;

        let key = key.into();
        let encoded = codec::encode(
            value,
            self.config.compression_threshold,
            options.force_compression,
        )?;
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry::new(key.clone(), encoded, ttl);
        let checksum = entry.checksum.clone();

        let outcome = self.memory.insert(entry.clone());
        {
            let mut stats = self.stats.lock();
            stats.record_set();
            stats.record_evictions(outcome.evicted.len());
        }
        for evicted in &outcome.evicted {
            debug!("evicted {} from memory tier", evicted);
        }

        // A changed value makes everything derived from the old one stale
        if matches!(&outcome.replaced_checksum, Some(old) if *old != checksum) {
            self.invalidate_dependents(&key).await;
        }
        self.dependencies.write().register(&key, options.dependencies);

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(&entry).await {
                warn!("persistent cache write failed for {}: {}", key, e);
                self.stats.lock().record_persistent_error();
            }
        }

        debug!(
            "cached {} ({} bytes, compressed={})",
            key,
            entry.size_bytes(),
            entry.compressed
        );
        Ok(())
    }

    // == Has ==
    /// Equivalent to `get(key).is_some()`.
    pub async fn has(&self, key: &str) -> bool {
        self.get::<serde_json::Value>(key).await.is_some()
    }

    // == Delete ==
    /// Removes `key` from both tiers together with every key derived from it.
    ///
    /// Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.invalidate(key).await;
        if removed > 0 {
            self.stats.lock().record_delete();
        }
        removed > 0
    }

    /// Removes `key` and its transitive dependents; returns how many keys
    /// were actually present in some tier.
    async fn invalidate(&self, key: &str) -> usize {
        let doomed: Vec<String> = {
            let mut graph = self.dependencies.write();
            let mut doomed = vec![key.to_string()];
            doomed.extend(graph.dependents_closure(key));
            for k in &doomed {
                graph.forget(k);
            }
            doomed
        };

        if doomed.len() > 1 {
            debug!("invalidating {} and {} dependent(s)", key, doomed.len() - 1);
        }

        let mut removed = 0;
        for k in &doomed {
            if self.remove_from_tiers(k).await {
                removed += 1;
            }
        }
        removed
    }

    /// Cascades the expiry of `key` unless it has been set again since it
    /// was found expired.
    async fn invalidate_expired(&self, key: &str) -> usize {
        if self.memory.is_live(key, current_timestamp_ms()) {
            debug!("{} was rewritten after expiring, keeping it", key);
            return 0;
        }
        self.invalidate(key).await
    }

    /// Removes everything derived from `key` but leaves `key` itself.
    async fn invalidate_dependents(&self, key: &str) {
        let dependents = self.dependencies.read().dependents_closure(key);
        for dependent in dependents {
            self.invalidate(&dependent).await;
        }
    }

    async fn remove_from_tiers(&self, key: &str) -> bool {
        let in_memory = self.memory.remove(key);
        let on_disk = match &self.disk {
            Some(disk) => disk.remove(key).await.unwrap_or_else(|e| {
                warn!("persistent cache delete failed for {}: {}", key, e);
                self.stats.lock().record_persistent_error();
                false
            }),
            None => false,
        };
        in_memory || on_disk
    }

    // == Clear ==
    /// Empties both tiers and all dependency records, and resets statistics.
    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear().await {
                warn!("failed to clear persistent cache tier: {}", e);
            }
        }
        self.dependencies.write().clear();
        *self.stats.lock() = CacheStats::new();
        info!("cache cleared");
    }

    // == Cleanup Expired ==
    /// Removes every expired entry from both tiers and cascades to their
    /// dependents. Returns the number of distinct expired keys.
    pub async fn cleanup_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let mut expired: HashSet<String> = self.memory.cleanup_expired(now).into_iter().collect();

        if let Some(disk) = &self.disk {
            match disk.sweep(now).await {
                Ok(report) => {
                    if report.trimmed > 0 || report.corrupt > 0 {
                        debug!(
                            "persistent sweep trimmed {} and dropped {} corrupt record(s)",
                            report.trimmed, report.corrupt
                        );
                    }
                    expired.extend(report.expired);
                }
                Err(e) => {
                    warn!("persistent cache sweep failed: {}", e);
                    self.stats.lock().record_persistent_error();
                }
            }
        }

        for key in &expired {
            if self.dependencies.read().is_tracked(key) {
                self.invalidate_expired(key).await;
            }
        }

        self.stats.lock().record_expirations(expired.len());
        expired.len()
    }

    // == Statistics ==
    /// Returns a snapshot of the cache statistics.
    pub fn statistics(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.total_entries = self.memory.len();
        stats.memory_bytes = self.memory.bytes();
        stats
    }

    /// Number of entries currently in the memory tier.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Keys registered as derived from `key`, transitively.
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        self.dependencies.read().dependents_closure(key)
    }
}
