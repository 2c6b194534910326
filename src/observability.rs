//! Metrics hooks and operation counters.
//!
//! Every repository keeps a set of atomic counters (reads, writes, cache
//! hits and misses, errors) exposed through `get_stats()` / `reset_stats()`.
//! For an external monitoring system, implement [`RepositoryMetrics`]:
//!
//! ```ignore
//! use repo_kit::observability::RepositoryMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl RepositoryMetrics for PrometheusMetrics {
//!     fn record_read(&self, collection: &str, _duration: Duration) {
//!         // counter!("repo_reads", "collection" => collection).inc();
//!     }
//!     // ... implement other methods
//! }
//!
//! // let repo = Repository::builder(store, config)
//! //     .with_metrics(Box::new(PrometheusMetrics))
//! //     .build()?;
//! ```
//!
//! Default methods log through the `log` crate; [`NoOpMetrics`] discards
//! everything.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for repository metrics collection.
pub trait RepositoryMetrics: Send + Sync {
    /// A store read (point read, query or count) completed.
    fn record_read(&self, collection: &str, duration: Duration) {
        debug!("Repository READ on {} took {:?}", collection, duration);
    }

    /// A store write (single or batch) completed.
    fn record_write(&self, collection: &str, duration: Duration) {
        debug!("Repository WRITE on {} took {:?}", collection, duration);
    }

    fn record_cache_hit(&self, key: &str) {
        debug!("Cache HIT: {}", key);
    }

    fn record_cache_miss(&self, key: &str) {
        debug!("Cache MISS: {}", key);
    }

    /// An operation failed.
    fn record_error(&self, collection: &str, error: &str) {
        warn!("Repository ERROR on {}: {}", collection, error);
    }
}

/// Metrics implementation that discards everything.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl RepositoryMetrics for NoOpMetrics {
    fn record_read(&self, _collection: &str, _duration: Duration) {}
    fn record_write(&self, _collection: &str, _duration: Duration) {}
    fn record_cache_hit(&self, _key: &str) {}
    fn record_cache_miss(&self, _key: &str) {}
    fn record_error(&self, _collection: &str, _error: &str) {}
}

/// Point-in-time copy of a repository's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
}

impl RepositoryStats {
    /// Fraction of cache lookups that hit, `0.0` when none happened.
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Live counters behind [`RepositoryStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn writes(&self, n: u64) {
        self.writes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RepositoryStats {
        RepositoryStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_read("products", Duration::from_millis(1));
        metrics.record_cache_miss("products:w1");
    }

    #[test]
    fn test_counters_snapshot_and_reset() {
        let counters = StatsCounters::default();
        counters.read();
        counters.read();
        counters.writes(3);
        counters.cache_hit();
        counters.cache_miss();
        counters.error();

        let stats = counters.snapshot();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 3);
        assert_eq!(stats.cache_hit_ratio(), 0.5);

        counters.reset();
        assert_eq!(counters.snapshot(), RepositoryStats::default());
    }
}
