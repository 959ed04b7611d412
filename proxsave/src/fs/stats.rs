//! Collection statistics shared by every collector.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-file outcome class counted by [`CollectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Processed,
    Failed,
    NotFound,
    Skipped,
}

/// Atomic counters mutated by collectors.
///
/// Every file considered lands in exactly one of the four file counters.
#[derive(Debug, Default)]
pub struct CollectionStats {
    files_processed: AtomicU64,
    files_failed: AtomicU64,
    files_not_found: AtomicU64,
    files_skipped: AtomicU64,
    dirs_created: AtomicU64,
    bytes_collected: AtomicU64,
}

/// Point-in-time copy of [`CollectionStats`], as written to the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_not_found: u64,
    pub files_skipped: u64,
    pub dirs_created: u64,
    pub bytes_collected: u64,
}

impl StatsSnapshot {
    /// Files that landed in one of the four outcome counters.
    pub fn files_considered(&self) -> u64 {
        self.files_processed + self.files_failed + self.files_not_found + self.files_skipped
    }
}

impl CollectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Processed => &self.files_processed,
            Counter::Failed => &self.files_failed,
            Counter::NotFound => &self.files_not_found,
            Counter::Skipped => &self.files_skipped,
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self, counter: Counter) {
        self.slot(counter).fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_collected.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_bytes(&self, bytes: u64) {
        self.bytes_collected.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn dir_created(&self) {
        self.dirs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_not_found: self.files_not_found.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            bytes_collected: self.bytes_collected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(CollectionStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.increment(Counter::Processed);
                        stats.add_bytes(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.files_processed, 8000);
        assert_eq!(snap.bytes_collected, 16000);
        assert_eq!(snap.files_considered(), 8000);
    }

    #[test]
    fn test_decrement_rebalances() {
        let stats = CollectionStats::new();
        stats.increment(Counter::Failed);
        stats.decrement(Counter::Failed);
        stats.increment(Counter::Skipped);
        let snap = stats.snapshot();
        assert_eq!(snap.files_failed, 0);
        assert_eq!(snap.files_skipped, 1);
    }
}
