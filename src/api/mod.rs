//! HTTP surface: application state, middleware, routes, and handlers.

pub mod handlers;
pub mod middleware;
pub mod routes;

pub use routes::create_router;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TieredCache;
use crate::config::DepotConfig;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::policy::PolicyClient;
use crate::protocols::{
    ArtifactService, HandlerRegistry, HelmHandler, IndexStore, LocalStore, MavenHandler,
    NpmHandler, OciHandler, PypiHandler,
};
use crate::proxy::{
    AdapterRegistry, BackupUpstreamFallback, FallbackStrategy, HealthMonitor, ProxyRouter,
    RetryPolicy, StaleCacheFallback,
};
use crate::replication::{NoopReplication, ReplicationSink};
use crate::scan::ScanQueue;
use crate::storage::{BlobStore, MetadataStore, SledMetadataStore};
use crate::tenant::RepositoryRegistry;
use crate::upload::ChunkedUploadManager;

/// Everything the handlers need, composed once at startup.
pub struct AppState {
    pub config: DepotConfig,
    pub repos: Arc<RepositoryRegistry>,
    pub service: Arc<ArtifactService>,
    pub maven: MavenHandler,
    pub npm: NpmHandler,
    pub pypi: PypiHandler,
    pub helm: HelmHandler,
    pub oci: OciHandler,
    pub uploads: Arc<ChunkedUploadManager>,
    pub router: Arc<ProxyRouter>,
    pub cache: Arc<TieredCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub policy: PolicyClient,
    pub health: Arc<HealthMonitor>,
}

impl AppState {
    /// Compose the platform with a no-op replication sink.
    pub fn build(config: DepotConfig) -> Result<Arc<Self>> {
        Self::build_with_replication(config, Arc::new(NoopReplication))
    }

    /// Composition root. All collaborators are constructor-injected here;
    /// nothing lives in process-level globals.
    pub fn build_with_replication(
        config: DepotConfig,
        replication: Arc<dyn ReplicationSink>,
    ) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsRegistry::new());
        let scan = ScanQueue::spawn(1024, metrics.clone());

        let blob = Arc::new(BlobStore::new(
            &config.storage.base_path,
            config.storage.data_shards,
            config.storage.parity_shards,
            replication,
        )?);
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SledMetadataStore::open(&config.storage.metadata_path)?);
        let service = Arc::new(ArtifactService::new(
            blob,
            metadata,
            scan.clone(),
            config.storage.max_file_size,
        ));

        let state_root = config
            .storage
            .base_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| config.storage.base_path.clone());
        let index = Arc::new(IndexStore::new(state_root.join("indexes"))?);

        let cache = Arc::new(TieredCache::new(&config.cache)?);
        let registry = Arc::new(HandlerRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let health = Arc::new(HealthMonitor::new(config.proxy.health_timeout));
        let local = Arc::new(LocalStore::new(service.clone(), registry));

        let fallbacks: Vec<Arc<dyn FallbackStrategy>> = vec![
            Arc::new(StaleCacheFallback::new(cache.clone())),
            Arc::new(BackupUpstreamFallback::new(
                adapters.clone(),
                health.clone(),
                reqwest::Client::new(),
            )),
        ];
        let router = Arc::new(ProxyRouter::new(
            cache.clone(),
            adapters,
            health.clone(),
            RetryPolicy::from_settings(&config.proxy),
            scan,
            metrics.clone(),
            fallbacks,
            local,
            config.cache.default_ttl,
        ));

        let uploads = Arc::new(ChunkedUploadManager::new(
            state_root.join("uploads"),
            service.clone(),
        )?);

        let policy = PolicyClient::new(&config.policy);

        Ok(Arc::new(Self {
            repos: Arc::new(RepositoryRegistry::new()),
            maven: MavenHandler::new(service.clone(), index.clone()),
            npm: NpmHandler::new(service.clone(), index.clone()),
            pypi: PypiHandler::new(service.clone(), index.clone()),
            helm: HelmHandler::new(service.clone(), index.clone()),
            oci: OciHandler::new(service.clone(), index),
            service,
            uploads,
            router,
            cache,
            metrics,
            policy,
            health,
            config,
        }))
    }

    /// Start the long-lived background loops: cache TTL sweeps, upstream
    /// health probes, and upload-session expiry.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.cache.spawn_sweeper(self.config.cache.cleanup_interval),
            self.health
                .spawn(self.repos.clone(), self.config.proxy.health_interval),
            self.uploads.spawn_expiry_sweep(Duration::from_secs(3600)),
        ]
    }
}
