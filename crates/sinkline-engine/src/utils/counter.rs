//! Thread-safe monotonic counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter shared across worker threads, used for payload id assignment.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Increment and return the value before the increment.
    pub fn get_and_increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
