//! Upstream registry adapters.
//!
//! One adapter per ecosystem maps a repository-relative path onto the
//! upstream's URL space and sets protocol-specific request headers. The
//! actual fetch is shared: status codes are classified for the retry engine
//! (5xx and transport errors transient, other 4xx permanent, 404 a plain
//! not-found).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::retry::{FetchFailure, RetryPolicy};
use crate::error::{DepotError, Result};
use crate::tenant::{EcosystemType, UpstreamAuth, UpstreamConfig};

/// A complete upstream payload.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Per-ecosystem request shaping.
pub trait UpstreamAdapter: Send + Sync {
    fn protocol(&self) -> EcosystemType;

    /// Absolute URL for a repository-relative path.
    fn request_url(&self, base: &str, path: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Value for the `Accept` header, when the protocol needs one.
    fn accept_header(&self) -> Option<&'static str> {
        None
    }
}

pub struct MavenUpstream;

impl UpstreamAdapter for MavenUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Maven
    }
}

pub struct NpmUpstream;

impl UpstreamAdapter for NpmUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Npm
    }

    fn accept_header(&self) -> Option<&'static str> {
        Some("application/json, */*")
    }
}

pub struct PypiUpstream;

impl UpstreamAdapter for PypiUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Pypi
    }
}

pub struct HelmUpstream;

impl UpstreamAdapter for HelmUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Helm
    }
}

pub struct OciUpstream;

impl UpstreamAdapter for OciUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Oci
    }

    fn accept_header(&self) -> Option<&'static str> {
        Some(
            "application/vnd.docker.distribution.manifest.v2+json, \
             application/vnd.docker.distribution.manifest.list.v2+json, \
             application/vnd.oci.image.manifest.v1+json, \
             application/vnd.oci.image.index.v1+json, */*",
        )
    }
}

/// Generic pass-through adapter for repositories without protocol shaping.
pub struct GenericUpstream;

impl UpstreamAdapter for GenericUpstream {
    fn protocol(&self) -> EcosystemType {
        EcosystemType::Generic
    }
}

/// Adapter lookup by ecosystem tag.
pub struct AdapterRegistry {
    adapters: HashMap<EcosystemType, Arc<dyn UpstreamAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let mut adapters: HashMap<EcosystemType, Arc<dyn UpstreamAdapter>> = HashMap::new();
        adapters.insert(EcosystemType::Maven, Arc::new(MavenUpstream));
        adapters.insert(EcosystemType::Npm, Arc::new(NpmUpstream));
        adapters.insert(EcosystemType::Pypi, Arc::new(PypiUpstream));
        adapters.insert(EcosystemType::Helm, Arc::new(HelmUpstream));
        adapters.insert(EcosystemType::Oci, Arc::new(OciUpstream));
        adapters.insert(EcosystemType::Generic, Arc::new(GenericUpstream));
        Self { adapters }
    }

    pub fn get(&self, ecosystem: EcosystemType) -> Result<Arc<dyn UpstreamAdapter>> {
        self.adapters
            .get(&ecosystem)
            .cloned()
            .ok_or_else(|| DepotError::Invalid(format!("no upstream adapter for {ecosystem}")))
    }
}

/// One fetch attempt against one upstream.
pub async fn fetch_once(
    client: &reqwest::Client,
    adapter: &dyn UpstreamAdapter,
    upstream: &UpstreamConfig,
    path: &str,
) -> std::result::Result<UpstreamResponse, FetchFailure> {
    let url = adapter.request_url(&upstream.url, path);
    let mut request = client.get(&url).timeout(upstream.timeout);
    if let Some(accept) = adapter.accept_header() {
        request = request.header(reqwest::header::ACCEPT, accept);
    }
    request = match &upstream.auth {
        UpstreamAuth::None => request,
        UpstreamAuth::Basic { username, password } => {
            request.basic_auth(username, Some(password))
        }
        UpstreamAuth::Bearer { token } => request.bearer_auth(token),
    };

    let response = request.send().await.map_err(|err| {
        FetchFailure::transient(DepotError::UpstreamFailure(format!(
            "{url}: {err}"
        )))
    })?;

    let status = response.status();
    if status.is_success() {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response.bytes().await.map_err(|err| {
            FetchFailure::transient(DepotError::UpstreamFailure(format!(
                "{url}: body read: {err}"
            )))
        })?;
        return Ok(UpstreamResponse {
            bytes,
            content_type,
        });
    }

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchFailure::permanent(DepotError::NotFound(format!(
            "upstream has no {path}"
        ))));
    }
    let error = DepotError::UpstreamFailure(format!("{url}: status {status}"));
    if status.is_server_error() {
        Err(FetchFailure::transient(error))
    } else {
        Err(FetchFailure::permanent(error))
    }
}

/// Fetch with the router's retry policy.
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    adapter: &dyn UpstreamAdapter,
    upstream: &UpstreamConfig,
    path: &str,
    policy: &RetryPolicy,
) -> Result<UpstreamResponse> {
    let policy = RetryPolicy {
        max_attempts: policy.max_attempts.min(upstream.retry_attempts.max(1)),
        ..policy.clone()
    };
    policy
        .run(|_attempt| fetch_once(client, adapter, upstream, path))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_joins_cleanly() {
        let adapter = MavenUpstream;
        assert_eq!(
            adapter.request_url("https://repo1.maven.org/maven2/", "/org/x/a.jar"),
            "https://repo1.maven.org/maven2/org/x/a.jar"
        );
        assert_eq!(
            adapter.request_url("https://repo1.maven.org/maven2", "org/x/a.jar"),
            "https://repo1.maven.org/maven2/org/x/a.jar"
        );
    }

    #[test]
    fn registry_covers_every_ecosystem() {
        let registry = AdapterRegistry::new();
        for eco in [
            EcosystemType::Maven,
            EcosystemType::Npm,
            EcosystemType::Pypi,
            EcosystemType::Helm,
            EcosystemType::Oci,
            EcosystemType::Generic,
        ] {
            assert_eq!(registry.get(eco).unwrap().protocol(), eco);
        }
    }
}
