//! Shared fixtures for the integration tests: a fully composed platform
//! on temp directories plus helpers for driving the router.

// Each integration test binary compiles its own copy; not every test uses
// every helper.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use depot::api::{create_router, AppState};
use depot::config::DepotConfig;
use depot::tenant::{
    EcosystemType, RepoId, RepositoryBinding, RepositoryMode, TenantId, UpstreamConfig,
};
use tower::ServiceExt;

pub struct TestPlatform {
    pub state: Arc<AppState>,
    pub app: Router,
    _tmp: tempfile::TempDir,
}

/// Platform on temp storage with thresholds scaled down so kilobyte-sized
/// test payloads still exercise all three cache tiers.
pub fn platform() -> TestPlatform {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = DepotConfig::default();
    config.storage.base_path = tmp.path().join("blobs");
    config.storage.metadata_path = tmp.path().join("metadata");
    config.storage.max_file_size = 256 * 1024 * 1024;
    config.cache.l2_path = tmp.path().join("cache");
    config.cache.l3_path = Some(tmp.path().join("objects"));
    config.cache.small_threshold = 1024;
    config.cache.medium_threshold = 64 * 1024;
    config.proxy.retry_attempts = 2;
    config.proxy.retry_base_delay = std::time::Duration::from_millis(5);

    let state = AppState::build(config).unwrap();
    let app = create_router(state.clone());
    TestPlatform {
        state,
        app,
        _tmp: tmp,
    }
}

pub fn tenant() -> TenantId {
    TenantId::new("default").unwrap()
}

/// Register a hosted repository for the default tenant.
pub fn hosted_repo(platform: &TestPlatform, repo: &str, ecosystem: EcosystemType) {
    platform
        .state
        .repos
        .create(RepositoryBinding {
            tenant: tenant(),
            repo: RepoId::new(repo).unwrap(),
            ecosystem,
            mode: RepositoryMode::Hosted,
            upstream: None,
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        })
        .unwrap();
}

/// Register a proxy repository pointing at `upstream_url`.
pub fn proxy_repo(
    platform: &TestPlatform,
    repo: &str,
    ecosystem: EcosystemType,
    upstream_url: &str,
) {
    platform
        .state
        .repos
        .create(RepositoryBinding {
            tenant: tenant(),
            repo: RepoId::new(repo).unwrap(),
            ecosystem,
            mode: RepositoryMode::Proxy,
            upstream: Some(UpstreamConfig {
                id: format!("{repo}-upstream"),
                url: upstream_url.to_string(),
                auth: depot::tenant::UpstreamAuth::None,
                timeout: std::time::Duration::from_secs(5),
                max_connections: 4,
                retry_attempts: 2,
            }),
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        })
        .unwrap();
}

pub async fn send(platform: &TestPlatform, request: Request<Body>) -> Response<Body> {
    platform.app.clone().oneshot(request).await.unwrap()
}

pub async fn get(platform: &TestPlatform, uri: &str) -> Response<Body> {
    send(
        platform,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await
}

pub async fn put(platform: &TestPlatform, uri: &str, body: Vec<u8>) -> Response<Body> {
    send(
        platform,
        Request::builder()
            .method("PUT")
            .uri(uri)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Deterministic pseudo-random payload.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
