//! Counters for the collector
//!
//! Shared through `Arc` so the host can read a snapshot from any thread
//! while the core thread updates them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for the Collector subsystem
#[derive(Default, Debug)]
pub struct CollectorMetrics {
    /// Filters announced by remote devices
    pub filters_received: AtomicU64,
    /// Download requests accepted by the download engine
    pub downloads_requested: AtomicU64,
    /// Download requests refused for lack of a token
    pub downloads_throttled: AtomicU64,
    /// Downloads that completed
    pub downloads_succeeded: AtomicU64,
    /// Downloads that failed (general or per-device)
    pub downloads_failed: AtomicU64,
    /// Items skipped because no device could have them
    pub items_without_candidates: AtomicU64,
    /// Backoff timers armed
    pub backoffs_scheduled: AtomicU64,
    /// Iterations over the fetch queue started
    pub iterations_started: AtomicU64,
    /// Persisted collector filters removed by cleanup
    pub filters_cleaned: AtomicU64,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            filters_received: self.filters_received.load(Ordering::Relaxed),
            downloads_requested: self.downloads_requested.load(Ordering::Relaxed),
            downloads_throttled: self.downloads_throttled.load(Ordering::Relaxed),
            downloads_succeeded: self.downloads_succeeded.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            items_without_candidates: self.items_without_candidates.load(Ordering::Relaxed),
            backoffs_scheduled: self.backoffs_scheduled.load(Ordering::Relaxed),
            iterations_started: self.iterations_started.load(Ordering::Relaxed),
            filters_cleaned: self.filters_cleaned.load(Ordering::Relaxed),
        }
    }

    /// Fraction of accepted downloads that failed
    pub fn failure_rate(&self) -> f64 {
        let failed = self.downloads_failed.load(Ordering::Relaxed);
        let done = failed + self.downloads_succeeded.load(Ordering::Relaxed);
        if done > 0 {
            failed as f64 / done as f64
        } else {
            0.0
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub filters_received: u64,
    pub downloads_requested: u64,
    pub downloads_throttled: u64,
    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub items_without_candidates: u64,
    pub backoffs_scheduled: u64,
    pub iterations_started: u64,
    pub filters_cleaned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let snapshot = CollectorMetrics::new().snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
    }

    #[test]
    fn test_failure_rate() {
        let metrics = CollectorMetrics::new();
        assert_eq!(metrics.failure_rate(), 0.0);

        CollectorMetrics::add(&metrics.downloads_succeeded, 3);
        CollectorMetrics::inc(&metrics.downloads_failed);

        assert!((metrics.failure_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.snapshot().downloads_succeeded, 3);
    }
}
