//! Process-wide publish accounting.
//!
//! Each completed publish attempt bumps exactly one counter. Counters are plain
//! atomics so monitoring can read them without blocking publishers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Succeeded/failed publish counters.
#[derive(Debug, Default)]
pub struct PushStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl PushStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered publish.
    pub fn incr_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed publish.
    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes delivered so far.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Publishes failed so far.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Read both counters.
    #[must_use]
    pub fn snapshot(&self) -> PushStatsSnapshot {
        PushStatsSnapshot {
            succeeded: self.succeeded(),
            failed: self.failed(),
        }
    }
}

/// A point-in-time copy of [`PushStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PushStatsSnapshot {
    /// Publishes delivered.
    pub succeeded: u64,
    /// Publishes failed.
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = PushStats::new();
        stats.incr_succeeded();
        stats.incr_succeeded();
        stats.incr_failed();
        assert_eq!(
            stats.snapshot(),
            PushStatsSnapshot {
                succeeded: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(PushStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.incr_succeeded();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.succeeded(), 8000);
        assert_eq!(stats.failed(), 0);
    }
}
