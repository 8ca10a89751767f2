//! Fallback strategies, run in order after upstream retries are exhausted.

use std::sync::Arc;

use async_trait::async_trait;

use super::health::HealthMonitor;
use super::upstream::{fetch_once, AdapterRegistry};
use super::ProxyOutcome;
use crate::cache::TieredCache;
use crate::tenant::RepositoryBinding;

/// One recovery strategy for a failed upstream fetch.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some` when the strategy produced a servable payload.
    async fn attempt(
        &self,
        binding: &RepositoryBinding,
        path: &str,
        cache_key: &str,
    ) -> Option<ProxyOutcome>;
}

/// Serve an expired cache entry rather than failing outright.
pub struct StaleCacheFallback {
    cache: Arc<TieredCache>,
}

impl StaleCacheFallback {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl FallbackStrategy for StaleCacheFallback {
    fn name(&self) -> &'static str {
        "stale-cache"
    }

    async fn attempt(
        &self,
        _binding: &RepositoryBinding,
        _path: &str,
        cache_key: &str,
    ) -> Option<ProxyOutcome> {
        let (entry, source) = self.cache.get_stale(cache_key).await?;
        tracing::info!(key = cache_key, "serving stale cache entry after upstream failure");
        Some(ProxyOutcome {
            bytes: entry.bytes,
            source,
            content_type: None,
            stale: true,
        })
    }
}

/// Try the binding's backup upstreams in priority order, skipping any the
/// health engine has marked offline. Each backup gets a single attempt;
/// the primary already consumed the retry budget.
pub struct BackupUpstreamFallback {
    adapters: Arc<AdapterRegistry>,
    health: Arc<HealthMonitor>,
    client: reqwest::Client,
}

impl BackupUpstreamFallback {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        health: Arc<HealthMonitor>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            adapters,
            health,
            client,
        }
    }
}

#[async_trait]
impl FallbackStrategy for BackupUpstreamFallback {
    fn name(&self) -> &'static str {
        "backup-upstream"
    }

    async fn attempt(
        &self,
        binding: &RepositoryBinding,
        path: &str,
        _cache_key: &str,
    ) -> Option<ProxyOutcome> {
        let adapter = self.adapters.get(binding.ecosystem).ok()?;
        for upstream in &binding.backup_upstreams {
            if !self.health.is_available(&upstream.id) {
                tracing::debug!(upstream = %upstream.id, "skipping offline backup upstream");
                continue;
            }
            match fetch_once(&self.client, adapter.as_ref(), upstream, path).await {
                Ok(response) => {
                    tracing::info!(upstream = %upstream.id, path, "served from backup upstream");
                    self.health
                        .record_success(&upstream.id, std::time::Duration::ZERO);
                    return Some(ProxyOutcome {
                        bytes: response.bytes,
                        source: crate::cache::CacheSource::Origin,
                        content_type: response.content_type,
                        stale: false,
                    });
                }
                Err(failure) => {
                    tracing::debug!(
                        upstream = %upstream.id,
                        error = %failure.error,
                        "backup upstream failed"
                    );
                    self.health.record_failure(&upstream.id);
                }
            }
        }
        None
    }
}
