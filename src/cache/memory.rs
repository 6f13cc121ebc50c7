//! Memory Tier Module
//!
//! Bounded in-memory store combining a sharded map with LRU tracking.
//! Capacity (entry count and stored bytes) and TTL are independent triggers:
//! capacity evicts least recently used entries on insert, TTL is checked on
//! every read and by the periodic sweep.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::{CacheEntry, LruTracker};

/// Result of a memory-tier lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Valid entry; access metadata already updated
    Hit(CacheEntry),
    /// Entry existed but its TTL had elapsed; it has been removed
    Expired,
    Miss,
}

/// Result of inserting into the memory tier.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Checksum of the entry that was overwritten, if any
    pub replaced_checksum: Option<String>,
    /// Keys evicted to get back under capacity
    pub evicted: Vec<String>,
}

// == Memory Tier ==
/// In-memory tier with LRU eviction and TTL support.
///
/// Per-key operations are atomic through the map's shard locks. The LRU
/// tracker is only ever locked while a shard lock is held or on its own,
/// never the other way round.
#[derive(Debug)]
pub struct MemoryTier {
    entries: DashMap<String, CacheEntry>,
    lru: Mutex<LruTracker>,
    bytes: AtomicUsize,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryTier {
    // == Constructor ==
    /// Creates a tier bounded by entry count and total stored bytes.
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            lru: Mutex::new(LruTracker::new()),
            bytes: AtomicUsize::new(0),
            max_entries,
            max_bytes,
        }
    }

    // == Get ==
    /// Looks up a key, updating access metadata and LRU order on a hit.
    ///
    /// Expired entries are removed and reported as [`Lookup::Expired`].
    pub fn get(&self, key: &str, now: u64) -> Lookup {
        match self.entries.get_mut(key) {
            None => return Lookup::Miss,
            Some(mut entry) => {
                if entry.is_valid_at(now) {
                    entry.record_access(now);
                    entry.lru_tick = self.lru.lock().touch(key);
                    return Lookup::Hit(entry.clone());
                }
            }
        }

        self.remove_where(key, |entry| !entry.is_valid_at(now));
        Lookup::Expired
    }

    // == Insert ==
    /// Stores an entry, overwriting any previous value for the key, then
    /// evicts least recently used entries until the tier is within capacity.
    pub fn insert(&self, mut entry: CacheEntry) -> InsertOutcome {
        let key = entry.key.clone();
        let size = entry.size_bytes();
        let mut outcome = InsertOutcome::default();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                entry.lru_tick = self.lru.lock().touch(&key);
                let old = slot.insert(entry);
                self.bytes.fetch_sub(old.size_bytes(), Ordering::SeqCst);
                outcome.replaced_checksum = Some(old.checksum);
            }
            Entry::Vacant(slot) => {
                entry.lru_tick = self.lru.lock().touch(&key);
                slot.insert(entry);
            }
        }
        self.bytes.fetch_add(size, Ordering::SeqCst);

        outcome.evicted = self.evict_to_capacity();
        outcome
    }

    // == Eviction ==
    fn over_capacity(&self) -> bool {
        self.entries.len() > self.max_entries || self.bytes.load(Ordering::SeqCst) > self.max_bytes
    }

    fn evict_to_capacity(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.over_capacity() {
            let oldest = self.lru.lock().evict_oldest();
            let Some((key, tick)) = oldest else {
                break;
            };
            // A key touched again after being popped carries a newer tick and survives
            if let Some((_, old)) = self.entries.remove_if(&key, |_, e| e.lru_tick == tick) {
                self.bytes.fetch_sub(old.size_bytes(), Ordering::SeqCst);
                evicted.push(key);
            }
        }
        evicted
    }

    // == Remove ==
    /// Removes an entry by key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.remove_where(key, |_| true)
    }

    fn remove_where(&self, key: &str, predicate: impl FnOnce(&CacheEntry) -> bool) -> bool {
        match self.entries.remove_if(key, |_, entry| predicate(entry)) {
            Some((_, old)) => {
                self.lru.lock().remove_if_tick(key, old.lru_tick);
                self.bytes.fetch_sub(old.size_bytes(), Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    // == Cleanup Expired ==
    /// Removes all expired entries and returns their keys.
    pub fn cleanup_expired(&self, now: u64) -> Vec<String> {
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|item| !item.value().is_valid_at(now))
            .map(|item| item.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| self.remove_where(key, |entry| !entry.is_valid_at(now)))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.lru.lock().clear();
        self.bytes.store(0, Ordering::SeqCst);
    }

    /// Whether `key` holds an entry that is still valid at `now`. Does not
    /// count as an access.
    pub fn is_live(&self, key: &str, now: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_valid_at(now))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total stored bytes across entries.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec;
    use crate::cache::entry::current_timestamp_ms;
    use std::time::Duration;

    fn entry(key: &str, value: &str) -> CacheEntry {
        let encoded = codec::encode(&value, usize::MAX, false).unwrap();
        CacheEntry::new(key, encoded, Duration::from_secs(300))
    }

    fn entry_with_ttl(key: &str, ttl_ms: u64, created_at: u64) -> CacheEntry {
        let encoded = codec::encode(&"v", usize::MAX, false).unwrap();
        CacheEntry::with_created_at(key, encoded, Duration::from_millis(ttl_ms), created_at)
    }

    fn is_hit(tier: &MemoryTier, key: &str) -> bool {
        matches!(tier.get(key, current_timestamp_ms()), Lookup::Hit(_))
    }

    #[test]
    fn test_tier_new() {
        let tier = MemoryTier::new(100, usize::MAX);
        assert_eq!(tier.len(), 0);
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let tier = MemoryTier::new(100, usize::MAX);
        tier.insert(entry("key1", "value1"));

        match tier.get("key1", current_timestamp_ms()) {
            Lookup::Hit(found) => {
                assert_eq!(found.access_count, 1);
                assert_eq!(found.key, "key1");
            }
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let tier = MemoryTier::new(100, usize::MAX);
        assert!(matches!(tier.get("nope", 0), Lookup::Miss));
    }

    #[test]
    fn test_overwrite_reports_previous_checksum() {
        let tier = MemoryTier::new(100, usize::MAX);
        let first = entry("key1", "value1");
        let first_checksum = first.checksum.clone();

        assert!(tier.insert(first).replaced_checksum.is_none());
        let outcome = tier.insert(entry("key1", "value2"));

        assert_eq!(outcome.replaced_checksum, Some(first_checksum));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), entry("key1", "value2").size_bytes());
    }

    #[test]
    fn test_expired_entry_removed_on_get() {
        let tier = MemoryTier::new(100, usize::MAX);
        tier.insert(entry_with_ttl("key1", 100, 1_000));

        assert!(matches!(tier.get("key1", 1_050), Lookup::Hit(_)));
        assert!(matches!(tier.get("key1", 1_100), Lookup::Expired));
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let tier = MemoryTier::new(3, usize::MAX);

        tier.insert(entry("key1", "value1"));
        tier.insert(entry("key2", "value2"));
        tier.insert(entry("key3", "value3"));
        let outcome = tier.insert(entry("key4", "value4"));

        assert_eq!(outcome.evicted, vec!["key1".to_string()]);
        assert_eq!(tier.len(), 3);
        assert!(!tier.contains_key("key1"));
    }

    #[test]
    fn test_lru_touch_on_get() {
        let tier = MemoryTier::new(3, usize::MAX);

        tier.insert(entry("key1", "value1"));
        tier.insert(entry("key2", "value2"));
        tier.insert(entry("key3", "value3"));
        assert!(is_hit(&tier, "key1"));

        tier.insert(entry("key4", "value4"));

        assert!(is_hit(&tier, "key1"));
        assert!(!tier.contains_key("key2"));
    }

    #[test]
    fn test_eviction_by_bytes() {
        let one = entry("a", "0123456789").size_bytes();
        let tier = MemoryTier::new(100, one * 2);

        tier.insert(entry("a", "0123456789"));
        tier.insert(entry("b", "0123456789"));
        let outcome = tier.insert(entry("c", "0123456789"));

        assert_eq!(outcome.evicted, vec!["a".to_string()]);
        assert!(tier.bytes() <= one * 2);
    }

    #[test]
    fn test_remove() {
        let tier = MemoryTier::new(100, usize::MAX);
        tier.insert(entry("key1", "value1"));

        assert!(tier.remove("key1"));
        assert!(!tier.remove("key1"));
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let tier = MemoryTier::new(100, usize::MAX);
        tier.insert(entry_with_ttl("short", 10, 1_000));
        tier.insert(entry_with_ttl("long", 10_000, 1_000));

        let removed = tier.cleanup_expired(1_500);

        assert_eq!(removed, vec!["short".to_string()]);
        assert_eq!(tier.len(), 1);
        assert!(tier.contains_key("long"));
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(100, usize::MAX);
        tier.insert(entry("a", "1"));
        tier.insert(entry("b", "2"));
        tier.clear();

        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }
}
