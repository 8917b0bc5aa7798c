//! Cache counters
//!
//! Counters are process-lifetime and reset on restart; the filesystem stays
//! the source of truth for what is actually cached.

#![allow(clippy::cast_precision_loss)] // Ratios accept precision loss

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by every cache component
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    passthrough: AtomicU64,
    downloads: AtomicU64,
    downloaded_bytes: AtomicU64,
    download_failures: AtomicU64,
    retries: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    repairs: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests served from an existing file
    pub hits: u64,
    /// Requests that needed a download
    pub misses: u64,
    /// Requests answered with the remote URL because storage is not durable
    pub passthrough: u64,
    /// Successful, size-validated downloads
    pub downloads: u64,
    /// Bytes written by successful downloads
    pub downloaded_bytes: u64,
    /// Download attempts that failed or produced an undersized file
    pub download_failures: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Files deleted by budget enforcement
    pub evictions: u64,
    /// Bytes freed by budget enforcement
    pub evicted_bytes: u64,
    /// Entries restored by the integrity verifier
    pub repairs: u64,
}

impl CacheStats {
    /// Fraction of durable requests served from cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl CacheMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_download_failure(&self) {
        self.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_repair(&self) {
        self.repairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            download_failures: self.download_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot().hit_rate(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_download(2048);
        metrics.record_eviction(512);

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.downloaded_bytes, 2048);
        assert_eq!(stats.evicted_bytes, 512);
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
