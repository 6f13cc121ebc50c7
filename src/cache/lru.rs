//! LRU Tracker Module
//!
//! Implements Least Recently Used tracking for memory-tier eviction.

use std::collections::{BTreeMap, HashMap};

// == LRU Tracker ==
/// Tracks access order for LRU eviction strategy.
///
/// Every touch stamps the key with a fresh, strictly increasing tick. The
/// smallest live tick is the least recently used key. Ticks are handed back to
/// callers so a removal can be made conditional on the key not having been
/// touched again in the meantime.
#[derive(Debug, Default)]
pub struct LruTracker {
    /// Keys ordered by tick, oldest first
    order: BTreeMap<u64, String>,
    /// Current tick of every tracked key
    ticks: HashMap<String, u64>,
    next_tick: u64,
}

impl LruTracker {
    // == Constructor ==
    /// Creates a new empty LRU tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as most recently used and returns its new tick.
    pub fn touch(&mut self, key: &str) -> u64 {
        self.next_tick += 1;
        let tick = self.next_tick;
        if let Some(old) = self.ticks.insert(key.to_string(), tick) {
            self.order.remove(&old);
        }
        self.order.insert(tick, key.to_string());
        tick
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    /// Removes a key only if it still carries `tick`.
    pub fn remove_if_tick(&mut self, key: &str, tick: u64) -> bool {
        if self.ticks.get(key) == Some(&tick) {
            self.ticks.remove(key);
            self.order.remove(&tick);
            true
        } else {
            false
        }
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently used key with its tick.
    ///
    /// Returns None if tracker is empty.
    pub fn evict_oldest(&mut self) -> Option<(String, u64)> {
        let (tick, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some((key, tick))
    }

    // == Peek Oldest ==
    /// Returns the least recently used key without removing it.
    pub fn peek_oldest(&self) -> Option<&str> {
        self.order.values().next().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ticks.clear();
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ticks.contains_key(key)
    }
}
