//! Round-robin selection over a fixed set of endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out items in turn. Lock-free; safe to share between tasks.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    counter: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            counter: AtomicUsize::new(0),
        }
    }

    /// The next item, or `None` if there are none.
    pub fn next(&self) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        self.items.get(idx % self.items.len())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
