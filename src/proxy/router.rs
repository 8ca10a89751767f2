//! Proxy request router.
//!
//! Resolution order for `{repo, path}`: locally hosted artifact → cache
//! tiers → upstream with retry → fallbacks. Concurrent misses on one cache
//! key coalesce into a single upstream fetch whose outcome every waiter
//! observes. A successful origin fetch fans out to three sinks: the
//! response, the cache writer, and the scan queue; the cache writer only
//! admits payloads whose upstream body completed cleanly, which the
//! buffered fetch guarantees by construction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use super::fallback::FallbackStrategy;
use super::health::HealthMonitor;
use super::retry::RetryPolicy;
use super::singleflight::{Flight, FlightGroup};
use super::upstream::{fetch_with_retry, AdapterRegistry};
use super::ProxyOutcome;
use crate::cache::{CacheSource, TieredCache};
use crate::error::{DepotError, Result};
use crate::metrics::MetricsRegistry;
use crate::scan::{ScanQueue, ScanRequest};
use crate::tenant::{RepositoryBinding, RepositoryMode};

/// Lookup into locally hosted artifacts, implemented by the artifact
/// service so the router stays decoupled from the storage layer.
#[async_trait]
pub trait LocalArtifactSource: Send + Sync {
    /// Payload and content type for a hosted artifact at `path`, if any.
    async fn lookup(
        &self,
        binding: &RepositoryBinding,
        path: &str,
    ) -> Result<Option<(Bytes, Option<String>)>>;
}

pub struct ProxyRouter {
    cache: Arc<TieredCache>,
    adapters: Arc<AdapterRegistry>,
    health: Arc<HealthMonitor>,
    client: reqwest::Client,
    retry: RetryPolicy,
    scan: ScanQueue,
    metrics: Arc<MetricsRegistry>,
    flights: FlightGroup<ProxyOutcome>,
    fallbacks: Vec<Arc<dyn FallbackStrategy>>,
    local: Arc<dyn LocalArtifactSource>,
    default_ttl: Duration,
}

impl ProxyRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<TieredCache>,
        adapters: Arc<AdapterRegistry>,
        health: Arc<HealthMonitor>,
        retry: RetryPolicy,
        scan: ScanQueue,
        metrics: Arc<MetricsRegistry>,
        fallbacks: Vec<Arc<dyn FallbackStrategy>>,
        local: Arc<dyn LocalArtifactSource>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            adapters,
            health,
            client: reqwest::Client::new(),
            retry,
            scan,
            metrics,
            flights: FlightGroup::new(),
            fallbacks,
            local,
            default_ttl,
        }
    }

    pub fn cache_key(binding: &RepositoryBinding, path: &str) -> String {
        format!("{}:{}", binding.composite_id(), path)
    }

    /// Route one download request.
    pub async fn fetch(
        &self,
        binding: &Arc<RepositoryBinding>,
        path: &str,
    ) -> Result<ProxyOutcome> {
        let started = Instant::now();
        let outcome = self.resolve(binding, path).await;
        if let Ok(outcome) = &outcome {
            self.metrics.record_request(
                binding.ecosystem,
                outcome.source,
                outcome.bytes.len() as u64,
                started.elapsed(),
            );
        }
        outcome
    }

    async fn resolve(
        &self,
        binding: &Arc<RepositoryBinding>,
        path: &str,
    ) -> Result<ProxyOutcome> {
        if binding.mode == RepositoryMode::Hosted {
            return match self.local.lookup(binding, path).await? {
                Some((bytes, content_type)) => Ok(ProxyOutcome {
                    bytes,
                    source: CacheSource::Local,
                    content_type,
                    stale: false,
                }),
                None => Err(DepotError::NotFound(format!(
                    "{} has no {path}",
                    binding.composite_id()
                ))),
            };
        }

        let key = Self::cache_key(binding, path);
        if let Some((entry, source)) = self.cache.get(&key).await {
            return Ok(ProxyOutcome {
                bytes: entry.bytes,
                source,
                content_type: None,
                stale: false,
            });
        }

        match self.flights.join(&key) {
            Flight::Follower(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(DepotError::Cancelled),
            },
            Flight::Leader(guard) => {
                let result = self.fetch_origin(binding, path, &key).await;
                guard.complete(result.clone());
                result
            }
        }
    }

    async fn fetch_origin(
        &self,
        binding: &Arc<RepositoryBinding>,
        path: &str,
        key: &str,
    ) -> Result<ProxyOutcome> {
        let upstream = binding.upstream.as_ref().ok_or_else(|| {
            DepotError::Invalid(format!(
                "{} is a proxy repository without an upstream",
                binding.composite_id()
            ))
        })?;
        let adapter = self.adapters.get(binding.ecosystem)?;
        self.metrics.record_upstream_fetch();

        let primary = if self.health.is_available(&upstream.id) {
            fetch_with_retry(&self.client, adapter.as_ref(), upstream, path, &self.retry).await
        } else {
            Err(DepotError::UpstreamFailure(format!(
                "upstream {} is offline",
                upstream.id
            )))
        };

        match primary {
            Ok(response) => {
                self.admit(binding, key, response.bytes.clone()).await;
                Ok(ProxyOutcome {
                    bytes: response.bytes,
                    source: CacheSource::Origin,
                    content_type: response.content_type,
                    stale: false,
                })
            }
            Err(err) => {
                self.metrics.record_upstream_failure();
                tracing::warn!(
                    repo = %binding.composite_id(),
                    path,
                    error = %err,
                    "upstream fetch failed, trying fallbacks"
                );
                for fallback in &self.fallbacks {
                    if let Some(outcome) = fallback.attempt(binding, path, key).await {
                        tracing::info!(strategy = fallback.name(), path, "fallback succeeded");
                        if outcome.source == CacheSource::Origin && !outcome.stale {
                            self.admit(binding, key, outcome.bytes.clone()).await;
                        }
                        return Ok(outcome);
                    }
                }
                Err(err)
            }
        }
    }

    /// Admit a completed origin payload: cache write plus scan enqueue.
    /// Neither may fail the request.
    async fn admit(&self, binding: &Arc<RepositoryBinding>, key: &str, bytes: Bytes) {
        let size = bytes.len() as u64;
        let ttl = binding.cache_ttl(self.default_ttl);
        if let Err(err) = self.cache.set(key, bytes, ttl).await {
            tracing::warn!(key, error = %err, "cache admission failed");
        }
        self.scan.enqueue(ScanRequest {
            tenant: binding.tenant.clone(),
            repo: binding.repo.clone(),
            subject: key.to_string(),
            size,
            requested_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, ProxySettings};
    use crate::proxy::fallback::StaleCacheFallback;
    use crate::tenant::{EcosystemType, RepoId, TenantId, UpstreamAuth, UpstreamConfig};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory hosted source for router tests.
    #[derive(Default)]
    struct MapSource {
        entries: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl LocalArtifactSource for MapSource {
        async fn lookup(
            &self,
            _binding: &RepositoryBinding,
            path: &str,
        ) -> Result<Option<(Bytes, Option<String>)>> {
            Ok(self
                .entries
                .lock()
                .get(path)
                .cloned()
                .map(|b| (b, None)))
        }
    }

    fn router_with(
        dir: &std::path::Path,
        local: Arc<dyn LocalArtifactSource>,
    ) -> (ProxyRouter, Arc<TieredCache>, Arc<MetricsRegistry>) {
        let settings = CacheSettings {
            l2_path: dir.join("l2"),
            l3_path: None,
            ..CacheSettings::default()
        };
        let cache = Arc::new(TieredCache::new(&settings).unwrap());
        let metrics = Arc::new(MetricsRegistry::new());
        let scan = ScanQueue::spawn(16, metrics.clone());
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(1)));
        let fallbacks: Vec<Arc<dyn FallbackStrategy>> =
            vec![Arc::new(StaleCacheFallback::new(cache.clone()))];
        let router = ProxyRouter::new(
            cache.clone(),
            Arc::new(AdapterRegistry::new()),
            health,
            RetryPolicy::from_settings(&ProxySettings {
                retry_attempts: 1,
                retry_base_delay: Duration::from_millis(1),
                ..ProxySettings::default()
            }),
            scan,
            metrics.clone(),
            fallbacks,
            local,
            Duration::from_secs(60),
        );
        (router, cache, metrics)
    }

    fn hosted_binding() -> Arc<RepositoryBinding> {
        Arc::new(RepositoryBinding {
            tenant: TenantId::new("acme").unwrap(),
            repo: RepoId::new("releases").unwrap(),
            ecosystem: EcosystemType::Maven,
            mode: RepositoryMode::Hosted,
            upstream: None,
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        })
    }

    fn proxy_binding(url: &str) -> Arc<RepositoryBinding> {
        Arc::new(RepositoryBinding {
            tenant: TenantId::new("acme").unwrap(),
            repo: RepoId::new("central").unwrap(),
            ecosystem: EcosystemType::Maven,
            mode: RepositoryMode::Proxy,
            upstream: Some(UpstreamConfig {
                id: "central".into(),
                url: url.to_string(),
                auth: UpstreamAuth::None,
                timeout: Duration::from_millis(200),
                max_connections: 4,
                retry_attempts: 1,
            }),
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        })
    }

    #[tokio::test]
    async fn hosted_repository_serves_local_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(MapSource::default());
        source
            .entries
            .lock()
            .insert("a/b.jar".into(), Bytes::from_static(b"local bytes"));
        let (router, _cache, metrics) = router_with(tmp.path(), source);

        let outcome = router.fetch(&hosted_binding(), "a/b.jar").await.unwrap();
        assert_eq!(outcome.source, CacheSource::Local);
        assert_eq!(outcome.bytes.as_ref(), b"local bytes");
        assert_eq!(
            metrics.request_count(EcosystemType::Maven, CacheSource::Local),
            1
        );

        let missing = router.fetch(&hosted_binding(), "nope.jar").await;
        assert!(matches!(missing, Err(DepotError::NotFound(_))));
    }

    #[tokio::test]
    async fn proxy_repository_serves_cached_entries_without_upstream() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, cache, metrics) = router_with(tmp.path(), Arc::new(MapSource::default()));

        let binding = proxy_binding("http://127.0.0.1:9/unreachable");
        let key = ProxyRouter::cache_key(&binding, "org/x/a.jar");
        cache
            .set(&key, Bytes::from_static(b"cached"), Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = router.fetch(&binding, "org/x/a.jar").await.unwrap();
        assert_eq!(outcome.source, CacheSource::L1);
        assert_eq!(outcome.bytes.as_ref(), b"cached");
        assert_eq!(
            metrics.request_count(EcosystemType::Maven, CacheSource::L1),
            1
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_falls_back_to_stale_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, cache, _metrics) = router_with(tmp.path(), Arc::new(MapSource::default()));

        let binding = proxy_binding("http://127.0.0.1:9/unreachable");
        let key = ProxyRouter::cache_key(&binding, "org/x/a.jar");
        cache
            .set(&key, Bytes::from_static(b"stale bytes"), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = router.fetch(&binding, "org/x/a.jar").await.unwrap();
        assert!(outcome.stale);
        assert_eq!(outcome.bytes.as_ref(), b"stale bytes");
    }

    #[tokio::test]
    async fn unreachable_upstream_with_cold_cache_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _cache, metrics) = router_with(tmp.path(), Arc::new(MapSource::default()));

        let binding = proxy_binding("http://127.0.0.1:9/unreachable");
        let result = router.fetch(&binding, "org/x/a.jar").await;
        assert!(matches!(result, Err(DepotError::UpstreamFailure(_))));
        assert_eq!(metrics.snapshot().upstream_failures, 1);
    }
}
