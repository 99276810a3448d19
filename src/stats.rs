//! Fetch interception statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time copy of [`FetchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FetchStatsSnapshot {
    /// Responses served from cache.
    pub cache_hits: u64,
    /// Responses served from the network.
    pub network_responses: u64,
    /// Responses written to cache (counted per key).
    pub stored: u64,
    /// Network failures answered with the cached entry document.
    pub fallbacks: u64,
    /// Requests answered with the network-error result.
    pub network_errors: u64,
    /// Requests left to the host untouched.
    pub passthroughs: u64,
    /// Seconds since the counters were created.
    pub uptime_secs: u64,
}

impl FetchStatsSnapshot {
    /// Total requests that were intercepted or passed through.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.cache_hits + self.network_responses + self.fallbacks + self.network_errors + self.passthroughs
    }

    /// Share of intercepted requests answered from cache, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let served = self.cache_hits + self.network_responses + self.fallbacks + self.network_errors;
        if served > 0 {
            self.cache_hits as f64 / served as f64
        } else {
            0.0
        }
    }
}

/// Lock-free counters shared between the interceptor and its background refreshes.
#[derive(Debug)]
pub struct FetchStats {
    started: Instant,
    cache_hits: AtomicU64,
    network_responses: AtomicU64,
    stored: AtomicU64,
    fallbacks: AtomicU64,
    network_errors: AtomicU64,
    passthroughs: AtomicU64,
}

impl Default for FetchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cache_hits: AtomicU64::new(0),
            network_responses: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            passthroughs: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_network(&self) {
        self.network_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stored(&self, entries: u64) {
        self.stored.fetch_add(entries, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_passthrough(&self) {
        self.passthroughs.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the counters were created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_responses: self.network_responses.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            passthroughs: self.passthroughs.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zero() {
        let snap = FetchStats::default().snapshot();
        assert_eq!(snap.total(), 0);
        assert_eq!(snap.stored, 0);
        assert!(snap.hit_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn counters_accumulate() {
        let stats = FetchStats::new();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_network();
        stats.record_stored(2);
        stats.record_passthrough();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.network_responses, 1);
        assert_eq!(snap.stored, 2);
        assert_eq!(snap.total(), 5);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let stats = FetchStats::new();
        stats.record_fallback();
        stats.record_network_error();
        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(value["fallbacks"], 1);
        assert_eq!(value["network_errors"], 1);
        assert_eq!(value["cache_hits"], 0);
    }
}
