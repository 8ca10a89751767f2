//! Endpoint handlers.
//!
//! Handlers stay thin: resolve the tenant's repository binding for the
//! ecosystem, then delegate to the protocol handler (hosted repositories)
//! or the proxy router (proxy repositories). Download responses carry an
//! `X-Cache-Status` header naming the serving source.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::cache::{CacheSource, Level3};
use crate::error::{DepotError, Result};
use crate::protocols::oci::{API_VERSION, API_VERSION_HEADER, CONTENT_DIGEST_HEADER};
use crate::protocols::pypi::PypiUpload;
use crate::proxy::ProxyOutcome;
use crate::tenant::{
    EcosystemType, RepoId, RepositoryBinding, RepositoryMode, TenantContext, UpstreamConfig,
};
use crate::upload::InitiateRequest;

pub const CACHE_STATUS_HEADER: &str = "X-Cache-Status";

fn binding_for(
    state: &AppState,
    ctx: &TenantContext,
    ecosystem: EcosystemType,
) -> Result<Arc<RepositoryBinding>> {
    state.repos.find_for(&ctx.tenant, ecosystem)
}

fn cache_status(source: CacheSource, stale: bool) -> String {
    if stale {
        format!("stale; source={}", source.as_str())
    } else {
        source.as_str().to_string()
    }
}

fn payload_response(bytes: Bytes, content_type: &str, source: CacheSource, stale: bool) -> Response {
    (
        [
            (header::CONTENT_TYPE.to_string(), content_type.to_string()),
            (CACHE_STATUS_HEADER.to_string(), cache_status(source, stale)),
        ],
        bytes,
    )
        .into_response()
}

fn proxy_response(outcome: ProxyOutcome, default_content_type: &'static str) -> Response {
    let content_type = outcome
        .content_type
        .unwrap_or_else(|| default_content_type.to_string());
    payload_response(outcome.bytes, &content_type, outcome.source, outcome.stale)
}

// ============================================================================
// Maven
// ============================================================================

pub async fn maven_get(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(path): Path<String>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Maven)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let started = Instant::now();
            let (bytes, content_type) = state.maven.retrieve(&binding, &path).await?;
            state.metrics.record_request(
                EcosystemType::Maven,
                CacheSource::Local,
                bytes.len() as u64,
                started.elapsed(),
            );
            Ok(payload_response(bytes, content_type, CacheSource::Local, false))
        }
        RepositoryMode::Proxy => {
            let outcome = state.router.fetch(&binding, &path).await?;
            Ok(proxy_response(outcome, "application/octet-stream"))
        }
    }
}

pub async fn maven_put(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let binding = binding_for(&state, &ctx, EcosystemType::Maven)?;
    if binding.mode != RepositoryMode::Hosted {
        return Err(DepotError::Invalid(
            "cannot deploy to a proxy repository".into(),
        ));
    }
    state
        .maven
        .deploy(&binding, &path, body, ctx.subject.clone())
        .await?;
    Ok(StatusCode::CREATED)
}

// ============================================================================
// npm
// ============================================================================

fn npm_base_url(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| "http://localhost".to_string())
}

/// `GET /npm/{package}` and `GET /npm/{package}/-/{filename}`. The wildcard
/// keeps scoped package names (`@scope/name`) routable.
pub async fn npm_get(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(rest): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Npm)?;
    let rest = rest.trim_start_matches('/');

    match binding.mode {
        RepositoryMode::Hosted => {
            let started = Instant::now();
            let response = match rest.split_once("/-/") {
                Some((package, filename)) => {
                    let bytes = state.npm.get_tarball(&binding, package, filename).await?;
                    payload_response(
                        bytes,
                        "application/octet-stream",
                        CacheSource::Local,
                        false,
                    )
                }
                None => {
                    let doc = state
                        .npm
                        .get_metadata(&binding, rest, &npm_base_url(&headers))
                        .await?;
                    payload_response(
                        Bytes::from(serde_json::to_vec(&doc).map_err(|e| {
                            DepotError::InternalIO(format!("encode package document: {e}"))
                        })?),
                        "application/json",
                        CacheSource::Local,
                        false,
                    )
                }
            };
            state.metrics.record_request(
                EcosystemType::Npm,
                CacheSource::Local,
                0,
                started.elapsed(),
            );
            Ok(response)
        }
        RepositoryMode::Proxy => {
            let outcome = state.router.fetch(&binding, rest).await?;
            let default = if rest.contains("/-/") {
                "application/octet-stream"
            } else {
                "application/json"
            };
            Ok(proxy_response(outcome, default))
        }
    }
}

pub async fn npm_put(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(package): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let binding = binding_for(&state, &ctx, EcosystemType::Npm)?;
    if binding.mode != RepositoryMode::Hosted {
        return Err(DepotError::Invalid(
            "cannot publish to a proxy repository".into(),
        ));
    }
    let package = package.trim_start_matches('/');
    state
        .npm
        .publish(&binding, package, &body, ctx.subject.clone())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true }))))
}

// ============================================================================
// PyPI
// ============================================================================

pub async fn pypi_simple_root(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Pypi)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let page = state.pypi.simple_index(&binding).await?;
            Ok(payload_response(
                page,
                "text/html; charset=utf-8",
                CacheSource::Local,
                false,
            ))
        }
        RepositoryMode::Proxy => {
            let outcome = state.router.fetch(&binding, "simple/").await?;
            Ok(proxy_response(outcome, "text/html; charset=utf-8"))
        }
    }
}

pub async fn pypi_simple_project(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(project): Path<String>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Pypi)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let page = state.pypi.project_index(&binding, &project).await?;
            Ok(payload_response(
                page,
                "text/html; charset=utf-8",
                CacheSource::Local,
                false,
            ))
        }
        RepositoryMode::Proxy => {
            let outcome = state
                .router
                .fetch(&binding, &format!("simple/{project}/"))
                .await?;
            Ok(proxy_response(outcome, "text/html; charset=utf-8"))
        }
    }
}

/// `POST /pypi/` — the legacy upload API (multipart form).
pub async fn pypi_upload(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let binding = binding_for(&state, &ctx, EcosystemType::Pypi)?;
    if binding.mode != RepositoryMode::Hosted {
        return Err(DepotError::Invalid(
            "cannot upload to a proxy repository".into(),
        ));
    }

    let mut name = None;
    let mut version = None;
    let mut requires_python = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DepotError::Invalid(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("name") => name = Some(read_text_field(field).await?),
            Some("version") => version = Some(read_text_field(field).await?),
            Some("requires_python") => requires_python = Some(read_text_field(field).await?),
            Some("content") => {
                let filename = field
                    .file_name()
                    .ok_or_else(|| DepotError::Invalid("content field needs a filename".into()))?
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    DepotError::Invalid(format!("unreadable content field: {e}"))
                })?;
                file = Some((filename, bytes));
            }
            _ => {}
        }
    }

    let (filename, content) =
        file.ok_or_else(|| DepotError::Invalid("upload carries no content field".into()))?;
    state
        .pypi
        .upload(
            &binding,
            PypiUpload {
                name,
                version,
                filename,
                content,
                requires_python,
            },
            ctx.subject.clone(),
        )
        .await?;
    Ok(StatusCode::CREATED)
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| DepotError::Invalid(format!("unreadable form field: {e}")))
}

pub async fn pypi_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path((project, filename)): Path<(String, String)>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Pypi)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let bytes = state.pypi.get_file(&binding, &project, &filename).await?;
            Ok(payload_response(
                bytes,
                "application/octet-stream",
                CacheSource::Local,
                false,
            ))
        }
        RepositoryMode::Proxy => {
            let outcome = state
                .router
                .fetch(&binding, &format!("packages/{project}/{filename}"))
                .await?;
            Ok(proxy_response(outcome, "application/octet-stream"))
        }
    }
}

// ============================================================================
// Helm
// ============================================================================

pub async fn helm_index(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Helm)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let index = state.helm.get_index(&binding).await?;
            Ok(payload_response(
                index,
                "application/x-yaml",
                CacheSource::Local,
                false,
            ))
        }
        RepositoryMode::Proxy => {
            let outcome = state.router.fetch(&binding, "index.yaml").await?;
            Ok(proxy_response(outcome, "application/x-yaml"))
        }
    }
}

/// `POST /helm/api/charts` accepts the chart tarball either raw or as the
/// `chart` field of a multipart form.
pub async fn helm_upload(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    request: Request,
) -> Result<impl IntoResponse> {
    let binding = binding_for(&state, &ctx, EcosystemType::Helm)?;
    if binding.mode != RepositoryMode::Hosted {
        return Err(DepotError::Invalid(
            "cannot upload to a proxy repository".into(),
        ));
    }

    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let tarball = if is_multipart {
        use axum::extract::FromRequest;
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| DepotError::Invalid(format!("malformed multipart body: {e}")))?;
        let mut chart = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| DepotError::Invalid(format!("malformed multipart body: {e}")))?
        {
            if field.name() == Some("chart") {
                chart = Some(field.bytes().await.map_err(|e| {
                    DepotError::Invalid(format!("unreadable chart field: {e}"))
                })?);
            }
        }
        chart.ok_or_else(|| DepotError::Invalid("multipart body has no chart field".into()))?
    } else {
        let limit = state.config.storage.max_file_size as usize;
        axum::body::to_bytes(request.into_body(), limit)
            .await
            .map_err(|e| DepotError::Invalid(format!("unreadable body: {e}")))?
    };

    let manifest = state
        .helm
        .upload_chart(&binding, tarball, ctx.subject.clone())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "saved": true, "name": manifest.name, "version": manifest.version })),
    ))
}

pub async fn helm_chart(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(filename): Path<String>,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Helm)?;
    match binding.mode {
        RepositoryMode::Hosted => {
            let bytes = state.helm.get_chart(&binding, &filename).await?;
            Ok(payload_response(
                bytes,
                "application/gzip",
                CacheSource::Local,
                false,
            ))
        }
        RepositoryMode::Proxy => {
            let outcome = state
                .router
                .fetch(&binding, &format!("charts/{filename}"))
                .await?;
            Ok(proxy_response(outcome, "application/gzip"))
        }
    }
}

pub async fn helm_delete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let binding = binding_for(&state, &ctx, EcosystemType::Helm)?;
    state.helm.delete_chart(&binding, &name, &version).await?;
    Ok(Json(json!({ "deleted": true })))
}

// ============================================================================
// OCI / Docker Registry v2
// ============================================================================

/// `GET /v2/` version probe.
pub async fn oci_probe() -> impl IntoResponse {
    ([(API_VERSION_HEADER, API_VERSION)], Json(json!({})))
}

/// Dispatcher for `/v2/{name}/...`: image names contain slashes, so the
/// operation marker (`blobs`, `manifests`, `tags`) is located from the
/// right.
pub async fn oci_dispatch(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    request: Request,
) -> Result<Response> {
    let binding = binding_for(&state, &ctx, EcosystemType::Oci)?;
    let method = request.method().clone();
    let path = request
        .uri()
        .path()
        .trim_start_matches("/v2/")
        .trim_end_matches('/')
        .to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let limit = state.config.storage.max_file_size as usize;
    let body = axum::body::to_bytes(request.into_body(), limit)
        .await
        .map_err(|e| DepotError::Invalid(format!("unreadable body: {e}")))?;

    let segments: Vec<&str> = path.split('/').collect();

    // POST {name}/blobs/uploads/
    if method == Method::POST && path.ends_with("blobs/uploads") {
        let name = path.trim_end_matches("/blobs/uploads");
        let id = state.oci.start_blob_upload(name)?;
        return Ok((
            StatusCode::ACCEPTED,
            [
                (header::LOCATION.as_str(), format!("/v2/{name}/blobs/uploads/{id}")),
                ("Docker-Upload-UUID", id),
                (API_VERSION_HEADER, API_VERSION.to_string()),
            ],
        )
            .into_response());
    }

    // {name}/blobs/uploads/{id}
    if let Some(idx) = find_marker(&segments, &["blobs", "uploads"]) {
        let name = segments[..idx].join("/");
        let id = segments[idx + 2..].join("/");
        match method {
            Method::PATCH => {
                let progress = state.oci.append_blob_chunk(&name, &id, &body)?;
                let end = progress.received.saturating_sub(1);
                return Ok((
                    StatusCode::ACCEPTED,
                    [
                        (header::LOCATION.as_str(), format!("/v2/{name}/blobs/uploads/{id}")),
                        (header::RANGE.as_str(), format!("0-{end}")),
                        ("Docker-Upload-UUID", id),
                    ],
                )
                    .into_response());
            }
            Method::PUT => {
                let digest = query_param(query.as_deref(), "digest").ok_or_else(|| {
                    DepotError::Invalid("blob upload completion needs ?digest=".into())
                })?;
                let digest = state
                    .oci
                    .complete_blob_upload(&binding, &name, &id, &digest, &body)
                    .await?;
                return Ok((
                    StatusCode::CREATED,
                    [
                        (header::LOCATION.as_str(), format!("/v2/{name}/blobs/{digest}")),
                        (CONTENT_DIGEST_HEADER, digest.as_str().to_string()),
                    ],
                )
                    .into_response());
            }
            _ => return Err(DepotError::Invalid(format!("unsupported method {method}"))),
        }
    }

    // {name}/blobs/{digest}
    if let Some(idx) = find_single_marker(&segments, "blobs") {
        let name = segments[..idx].join("/");
        let digest = segments[idx + 1..].join("/");
        match method {
            Method::GET | Method::HEAD => {
                let (bytes, digest) = state.oci.get_blob(&binding, &name, &digest).await?;
                return Ok((
                    [
                        (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
                        (CONTENT_DIGEST_HEADER, digest.as_str().to_string()),
                    ],
                    bytes,
                )
                    .into_response());
            }
            _ => return Err(DepotError::Invalid(format!("unsupported method {method}"))),
        }
    }

    // {name}/manifests/{reference}
    if let Some(idx) = find_single_marker(&segments, "manifests") {
        let name = segments[..idx].join("/");
        let reference = segments[idx + 1..].join("/");
        match method {
            Method::GET | Method::HEAD => {
                let (bytes, digest, media_type) =
                    state.oci.get_manifest(&binding, &name, &reference).await?;
                return Ok((
                    [
                        (header::CONTENT_TYPE.as_str(), media_type),
                        (CONTENT_DIGEST_HEADER, digest.as_str().to_string()),
                    ],
                    bytes,
                )
                    .into_response());
            }
            Method::PUT => {
                let digest = state
                    .oci
                    .put_manifest(&binding, &name, &reference, body, content_type.as_deref())
                    .await?;
                return Ok((
                    StatusCode::CREATED,
                    [
                        (header::LOCATION.as_str(), format!("/v2/{name}/manifests/{digest}")),
                        (CONTENT_DIGEST_HEADER, digest.as_str().to_string()),
                    ],
                )
                    .into_response());
            }
            Method::DELETE => {
                state
                    .oci
                    .delete_manifest(&binding, &name, &reference)
                    .await?;
                return Ok(StatusCode::ACCEPTED.into_response());
            }
            _ => return Err(DepotError::Invalid(format!("unsupported method {method}"))),
        }
    }

    // {name}/tags/list
    if method == Method::GET && path.ends_with("/tags/list") {
        let name = path.trim_end_matches("/tags/list");
        let tags = state.oci.list_tags(&binding, name).await?;
        return Ok(Json(json!({ "name": name, "tags": tags })).into_response());
    }

    Err(DepotError::NotFound(format!("no registry route for {path}")))
}

/// Index of `marker[0]` when followed by `marker[1]` and at least one more
/// segment.
fn find_marker(segments: &[&str], marker: &[&str; 2]) -> Option<usize> {
    (1..segments.len().saturating_sub(2))
        .rev()
        .find(|&i| segments[i] == marker[0] && segments[i + 1] == marker[1])
}

fn find_single_marker(segments: &[&str], marker: &str) -> Option<usize> {
    (1..segments.len().saturating_sub(1))
        .rev()
        .find(|&i| segments[i] == marker && segments[i + 1] != "uploads")
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(value.replace("%3A", ":").replace("%3a", ":"))
        } else {
            None
        }
    })
}

// ============================================================================
// Chunked upload
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PartQuery {
    pub chunk: u64,
}

pub async fn upload_initiate(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<InitiateRequest>,
) -> Result<impl IntoResponse> {
    let response = state.uploads.initiate(&ctx.tenant, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn upload_part(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(id): Path<String>,
    Query(query): Query<PartQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let progress = state
        .uploads
        .upload_part(&ctx.tenant, &id, query.chunk, body)
        .await?;
    Ok(Json(progress))
}

pub async fn upload_complete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state.uploads.complete(&ctx.tenant, &id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "artifact_id": record.id,
            "name": record.name,
            "version": record.version,
            "size": record.size,
            "checksum": record.checksum,
        })),
    ))
}

pub async fn upload_progress(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let progress = state.uploads.progress(&ctx.tenant, &id).await?;
    Ok(Json(progress))
}

// ============================================================================
// Repository management, cache, metrics, health
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRepoRequest {
    pub repo: String,
    pub ecosystem: EcosystemType,
    pub mode: RepositoryMode,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub backup_upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

/// Binding view with credentials stripped.
#[derive(Debug, Serialize)]
pub struct RepoView {
    pub repo: String,
    pub ecosystem: EcosystemType,
    pub mode: RepositoryMode,
    pub upstream_url: Option<String>,
    pub backup_upstream_count: usize,
    pub cache_ttl_secs: Option<u64>,
}

impl From<&RepositoryBinding> for RepoView {
    fn from(binding: &RepositoryBinding) -> Self {
        Self {
            repo: binding.repo.to_string(),
            ecosystem: binding.ecosystem,
            mode: binding.mode,
            upstream_url: binding.upstream.as_ref().map(|u| u.url.clone()),
            backup_upstream_count: binding.backup_upstreams.len(),
            cache_ttl_secs: binding.cache_ttl_secs,
        }
    }
}

pub async fn repos_create(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<CreateRepoRequest>,
) -> Result<impl IntoResponse> {
    let binding = state.repos.create(RepositoryBinding {
        tenant: ctx.tenant.clone(),
        repo: RepoId::new(&request.repo)?,
        ecosystem: request.ecosystem,
        mode: request.mode,
        upstream: request.upstream,
        backup_upstreams: request.backup_upstreams,
        cache_ttl_secs: request.cache_ttl_secs,
    })?;
    Ok((StatusCode::CREATED, Json(RepoView::from(binding.as_ref()))))
}

pub async fn repos_list(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<impl IntoResponse> {
    let repos: Vec<RepoView> = state
        .repos
        .list(&ctx.tenant)
        .iter()
        .map(|b| RepoView::from(b.as_ref()))
        .collect();
    Ok(Json(repos))
}

#[derive(Debug, Deserialize)]
pub struct FlushQuery {
    #[serde(default)]
    pub tier: Option<String>,
}

pub async fn cache_flush(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FlushQuery>,
) -> Result<impl IntoResponse> {
    let level = match query.tier.as_deref() {
        Some(raw) => Some(raw.parse::<Level3>()?),
        None => None,
    };
    state.cache.flush(level).await;
    Ok(Json(json!({ "flushed": true })))
}

pub async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache: serde_json::Map<String, serde_json::Value> = state
        .cache
        .stats()
        .into_iter()
        .map(|(name, stats)| (name.to_string(), json!(stats)))
        .collect();
    Json(json!({
        "requests": state.metrics.snapshot(),
        "cache": cache,
    }))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let upstreams: serde_json::Map<String, serde_json::Value> = state
        .health
        .snapshot()
        .into_iter()
        .map(|(id, health)| (id, json!(health)))
        .collect();
    Json(json!({ "status": "ok", "upstreams": upstreams }))
}

/// Catch-all 404 in the platform's error shape.
pub async fn not_found(request: Request<Body>) -> Response {
    DepotError::NotFound(format!("no route for {}", request.uri().path())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oci_markers_respect_slashed_names() {
        let segments: Vec<&str> = "library/nginx/blobs/sha256:abc".split('/').collect();
        assert_eq!(find_single_marker(&segments, "blobs"), Some(2));

        let segments: Vec<&str> = "a/b/c/manifests/v1".split('/').collect();
        assert_eq!(find_single_marker(&segments, "manifests"), Some(3));

        let segments: Vec<&str> = "img/blobs/uploads/1234".split('/').collect();
        assert_eq!(find_marker(&segments, &["blobs", "uploads"]), Some(1));
        assert_eq!(find_single_marker(&segments, "blobs"), None);
    }

    #[test]
    fn query_param_decodes_digest_colon() {
        assert_eq!(
            query_param(Some("digest=sha256%3Aabc"), "digest"),
            Some("sha256:abc".to_string())
        );
        assert_eq!(
            query_param(Some("digest=sha256:abc&x=1"), "digest"),
            Some("sha256:abc".to_string())
        );
        assert_eq!(query_param(None, "digest"), None);
    }
}
