//! Request metrics.
//!
//! Counters are keyed by closed enums only (protocol × cache source × hit
//! flag), so label cardinality is bounded by construction. Values are plain
//! atomics; the registry is cheap enough to update on every request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::cache::CacheSource;
use crate::tenant::EcosystemType;

/// Upper bounds (milliseconds) of the duration histogram buckets; the last
/// bucket is the overflow.
const BUCKET_BOUNDS_MS: [u64; 9] = [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

/// Label set for one counter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub protocol: EcosystemType,
    pub source: CacheSource,
    pub cache_hit: bool,
}

#[derive(Default)]
struct RequestCounters {
    count: AtomicU64,
    bytes: AtomicU64,
    duration_ms_sum: AtomicU64,
    duration_buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
}

/// Central metrics registry, shared via `Arc`.
#[derive(Default)]
pub struct MetricsRegistry {
    requests: DashMap<RequestKey, Arc<RequestCounters>>,
    upstream_fetches: AtomicU64,
    upstream_failures: AtomicU64,
    scan_enqueued: AtomicU64,
    scan_dropped: AtomicU64,
}

/// One exported counter row.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub protocol: &'static str,
    pub cache_source: &'static str,
    pub cache_hit: bool,
    pub count: u64,
    pub bytes: u64,
    pub duration_ms_sum: u64,
    pub duration_buckets: Vec<u64>,
}

/// Snapshot served by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: Vec<RequestMetric>,
    pub upstream_fetches: u64,
    pub upstream_failures: u64,
    pub scan_enqueued: u64,
    pub scan_dropped: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one served request.
    pub fn record_request(
        &self,
        protocol: EcosystemType,
        source: CacheSource,
        bytes: u64,
        duration: Duration,
    ) {
        let key = RequestKey {
            protocol,
            source,
            cache_hit: source.is_cache_hit(),
        };
        let counters = self
            .requests
            .entry(key)
            .or_insert_with(|| Arc::new(RequestCounters::default()))
            .clone();

        let ms = duration.as_millis() as u64;
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        counters.duration_ms_sum.fetch_add(ms, Ordering::Relaxed);
        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        counters.duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_fetch(&self) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_enqueued(&self) {
        self.scan_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_dropped(&self) {
        self.scan_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut requests: Vec<RequestMetric> = self
            .requests
            .iter()
            .map(|item| {
                let key = item.key();
                let counters = item.value();
                RequestMetric {
                    protocol: key.protocol.as_str(),
                    cache_source: key.source.as_str(),
                    cache_hit: key.cache_hit,
                    count: counters.count.load(Ordering::Relaxed),
                    bytes: counters.bytes.load(Ordering::Relaxed),
                    duration_ms_sum: counters.duration_ms_sum.load(Ordering::Relaxed),
                    duration_buckets: counters
                        .duration_buckets
                        .iter()
                        .map(|b| b.load(Ordering::Relaxed))
                        .collect(),
                }
            })
            .collect();
        requests.sort_by(|a, b| {
            (a.protocol, a.cache_source, a.cache_hit).cmp(&(b.protocol, b.cache_source, b.cache_hit))
        });

        MetricsSnapshot {
            requests,
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            scan_enqueued: self.scan_enqueued.load(Ordering::Relaxed),
            scan_dropped: self.scan_dropped.load(Ordering::Relaxed),
        }
    }

    /// Counter value for one label set, used by tests and dashboards.
    pub fn request_count(&self, protocol: EcosystemType, source: CacheSource) -> u64 {
        let key = RequestKey {
            protocol,
            source,
            cache_hit: source.is_cache_hit(),
        };
        self.requests
            .get(&key)
            .map(|c| c.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_by_label_set() {
        let metrics = MetricsRegistry::new();
        metrics.record_request(
            EcosystemType::Maven,
            CacheSource::L1,
            100,
            Duration::from_millis(5),
        );
        metrics.record_request(
            EcosystemType::Maven,
            CacheSource::L1,
            50,
            Duration::from_millis(7),
        );
        metrics.record_request(
            EcosystemType::Npm,
            CacheSource::Origin,
            10,
            Duration::from_millis(900),
        );

        assert_eq!(metrics.request_count(EcosystemType::Maven, CacheSource::L1), 2);
        assert_eq!(metrics.request_count(EcosystemType::Npm, CacheSource::Origin), 1);
        assert_eq!(metrics.request_count(EcosystemType::Pypi, CacheSource::L2), 0);

        let snapshot = metrics.snapshot();
        let maven = snapshot
            .requests
            .iter()
            .find(|r| r.protocol == "maven")
            .unwrap();
        assert!(maven.cache_hit);
        assert_eq!(maven.bytes, 150);
        // Both requests fall into the first (<=10ms) bucket.
        assert_eq!(maven.duration_buckets[0], 2);
    }
}
