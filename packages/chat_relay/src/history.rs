//! Bounded FIFO of recent chat lines.
//!
//! Newcomers are handed the whole buffer on admission, so it only ever holds
//! the most recent `capacity` entries; the oldest is evicted first.

use std::collections::VecDeque;

/// Capacity used by both variants unless configured otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct History<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry. Returns true if the oldest entry was evicted.
    pub fn push(&mut self, entry: T) -> bool {
        self.entries.push_back(entry);
        let mut evicted = false;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            evicted = true;
        }
        evicted
    }

    /// Replace the contents, keeping only the newest `capacity` entries.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = T>) {
        self.entries.clear();
        for entry in entries {
            self.push(entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> History<T> {
    /// Entries in arrival order.
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
