//! Priority queue with delayed visibility.
//!
//! Ready items are ordered by priority (higher first) and then by the order in
//! which they became ready. Delayed items are invisible to `pop_ready` until
//! their `ready_at` instant has passed; on becoming ready they take a fresh
//! FIFO position at their original priority.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

struct Ready<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> Ready<T> {
    fn rank(&self) -> (i32, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl<T> PartialEq for Ready<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl<T> Eq for Ready<T> {}

impl<T> PartialOrd for Ready<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ready<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

struct Delayed<T> {
    ready_at: Instant,
    priority: i32,
    item: T,
}

/// Scheduler queue holding ready and backed-off items.
pub struct TaskQueue<T> {
    ready: BinaryHeap<Ready<T>>,
    delayed: Vec<Delayed<T>>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: Vec::new(),
            next_seq: 0,
        }
    }

    /// Adds an item that is immediately eligible for dispatch.
    pub fn push(&mut self, priority: i32, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Ready {
            priority,
            seq,
            item,
        });
    }

    /// Adds an item that becomes eligible at `ready_at`.
    pub fn push_delayed(&mut self, priority: i32, item: T, ready_at: Instant) {
        self.delayed.push(Delayed {
            ready_at,
            priority,
            item,
        });
    }

    /// Moves every delayed item whose time has come into the ready heap,
    /// earliest deadline first.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.iter().all(|d| d.ready_at > now) {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|d| d.ready_at <= now);
        self.delayed = pending;
        due.sort_by_key(|d| d.ready_at);
        for d in due {
            self.push(d.priority, d.item);
        }
    }

    /// Removes and returns the highest-priority item eligible at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<T> {
        self.promote_due(now);
        self.ready.pop().map(|r| r.item)
    }

    /// Whether an item is eligible at `now`.
    pub fn has_ready(&mut self, now: Instant) -> bool {
        self.promote_due(now);
        !self.ready.is_empty()
    }

    /// Earliest instant at which a delayed item becomes eligible.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.ready_at).min()
    }

    /// Total items held, ready or delayed.
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    /// Removes and returns every item, ready items in dispatch order first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(r) = self.ready.pop() {
            out.push(r.item);
        }
        out.extend(self.delayed.drain(..).map(|d| d.item));
        out
    }
}
