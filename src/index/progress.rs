use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Indexing progress snapshot for monitoring
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexingProgressStatus {
    /// Documents the caller announced; 0 when unknown
    pub total_document_count: u64,
    pub indexed_count: u64,
    /// Estimated time until `total_document_count` is reached
    pub wait_time: Duration,
    pub time_elapsed: Duration,
}

impl IndexingProgressStatus {
    /// Completed fraction in `[0, 1]`; 0 while the total is unknown
    pub fn progress(&self) -> f64 {
        if self.total_document_count == 0 {
            return 0.0;
        }
        (self.indexed_count as f64 / self.total_document_count as f64).min(1.0)
    }
}

/// Lock-free counters behind `IndexingProgressStatus`
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicU64,
    indexed: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn record_indexed(&self, count: u64) {
        self.started.lock().get_or_insert_with(Instant::now);
        self.indexed.fetch_add(count, Ordering::Relaxed);
    }

    /// Start a new session: counters to zero, clock stopped
    pub fn reset(&self) {
        self.indexed.store(0, Ordering::Relaxed);
        *self.started.lock() = None;
    }

    pub fn status(&self) -> IndexingProgressStatus {
        let total = self.total.load(Ordering::Relaxed);
        let indexed = self.indexed.load(Ordering::Relaxed);
        let elapsed = self.started.lock().map_or(Duration::ZERO, |s| s.elapsed());
        let wait_time = if indexed == 0 || total <= indexed {
            Duration::ZERO
        } else {
            elapsed.mul_f64((total - indexed) as f64 / indexed as f64)
        };
        IndexingProgressStatus {
            total_document_count: total,
            indexed_count: indexed,
            wait_time,
            time_elapsed: elapsed,
        }
    }
}
