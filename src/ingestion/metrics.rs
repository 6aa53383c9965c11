//! In-process ingestion counters
//!
//! Complements the Prometheus series in [`crate::metrics`] with counters
//! that can be read back as an [`IngestionStats`] snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Ingestion counters
///
/// Thread-safe, lock-free. Shared between the `save` side and the consumer.
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    // === Queue ===
    /// Collect requests accepted into the queue
    requests_enqueued: AtomicU64,
    /// Buckets accepted into the queue
    buckets_enqueued: AtomicU64,
    /// Requests put back into the queue after a failed commit
    requests_requeued: AtomicU64,
    /// Malformed buckets left out of their request
    buckets_rejected: AtomicU64,

    // === Commits ===
    /// Committed batches
    batches_saved: AtomicU64,
    /// Batches that failed to commit
    batches_failed: AtomicU64,
    /// Buckets written by committed batches
    buckets_saved: AtomicU64,
    /// Buckets lost with failed batches
    buckets_dropped: AtomicU64,

    // === Latency (simple average) ===
    commit_latency_sum_us: AtomicU64,
    commit_latency_count: AtomicU64,
}

impl IngestionMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request accepted into the queue
    #[inline]
    pub fn record_enqueued(&self, buckets: u64) {
        self.requests_enqueued.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .buckets_enqueued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(buckets))
            });
    }

    /// Record malformed buckets left out of a request
    #[inline]
    pub fn record_rejected(&self, buckets: u64) {
        self.buckets_rejected.fetch_add(buckets, Ordering::Relaxed);
    }

    /// Record one request put back into the queue
    #[inline]
    pub fn record_requeued(&self) {
        self.requests_requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed batch
    #[inline]
    pub fn record_saved(&self, buckets: u64, latency: Duration) {
        self.batches_saved.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .buckets_saved
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(buckets))
            });
        self.record_latency(latency);
    }

    /// Record a failed batch
    #[inline]
    pub fn record_failed(&self, latency: Duration) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record buckets that will never be written
    #[inline]
    pub fn record_dropped(&self, buckets: u64) {
        self.buckets_dropped.fetch_add(buckets, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let latency_us = latency.as_micros() as u64;
        let _ = self.commit_latency_sum_us.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |current| Some(current.saturating_add(latency_us)),
        );
        self.commit_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Average commit latency in microseconds
    pub fn avg_commit_latency_us(&self) -> u64 {
        let sum = self.commit_latency_sum_us.load(Ordering::Relaxed);
        let count = self.commit_latency_count.load(Ordering::Relaxed);
        if count > 0 {
            sum / count
        } else {
            0
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> IngestionStats {
        IngestionStats {
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            buckets_enqueued: self.buckets_enqueued.load(Ordering::Relaxed),
            requests_requeued: self.requests_requeued.load(Ordering::Relaxed),
            buckets_rejected: self.buckets_rejected.load(Ordering::Relaxed),
            batches_saved: self.batches_saved.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            buckets_saved: self.buckets_saved.load(Ordering::Relaxed),
            buckets_dropped: self.buckets_dropped.load(Ordering::Relaxed),
            avg_commit_latency_us: self.avg_commit_latency_us(),
        }
    }
}

/// Ingestion statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    /// Collect requests accepted into the queue
    pub requests_enqueued: u64,
    /// Buckets accepted into the queue
    pub buckets_enqueued: u64,
    /// Requests put back after a failed commit
    pub requests_requeued: u64,
    /// Malformed buckets never enqueued
    pub buckets_rejected: u64,
    /// Committed batches
    pub batches_saved: u64,
    /// Batches that failed to commit
    pub batches_failed: u64,
    /// Buckets written
    pub buckets_saved: u64,
    /// Buckets lost
    pub buckets_dropped: u64,
    /// Average commit latency in microseconds
    pub avg_commit_latency_us: u64,
}

impl IngestionStats {
    /// Share of enqueued buckets that reached the store (0.0 - 1.0)
    ///
    /// Returns 1.0 if nothing has been enqueued.
    #[must_use]
    pub fn save_rate(&self) -> f64 {
        if self.buckets_enqueued > 0 {
            self.buckets_saved as f64 / self.buckets_enqueued as f64
        } else {
            1.0
        }
    }
}

impl fmt::Display for IngestionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} buckets={} saved={} dropped={} rejected={} batches_ok={} batches_failed={} requeued={}",
            self.requests_enqueued,
            self.buckets_enqueued,
            self.buckets_saved,
            self.buckets_dropped,
            self.buckets_rejected,
            self.batches_saved,
            self.batches_failed,
            self.requests_requeued
        )
    }
}
