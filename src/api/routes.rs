//! Route table for the whole wire surface.
//!
//! Ecosystem endpoints sit at their conventional roots (`/maven2`, `/npm`,
//! `/simple`, `/helm`, `/v2`); platform endpoints live under `/api/v1`.
//! The context middleware resolves tenant and auth before any handler
//! runs.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::middleware::context_middleware;
use super::AppState;

/// Build the complete application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.storage.max_file_size as usize;

    Router::new()
        // Maven
        .route("/maven2/*path", get(maven_get).put(maven_put))
        // npm (wildcard keeps scoped names routable)
        .route("/npm/*rest", get(npm_get).put(npm_put))
        // PyPI
        .route("/simple/", get(pypi_simple_root))
        .route("/simple/:project/", get(pypi_simple_project))
        .route("/pypi/", post(pypi_upload))
        .route("/pypi/packages/:project/:filename", get(pypi_file))
        // Helm
        .route("/helm/index.yaml", get(helm_index))
        .route("/helm/api/charts", post(helm_upload))
        .route("/helm/charts/:filename", get(helm_chart))
        .route("/helm/api/charts/:name/:version", delete(helm_delete))
        // OCI / Docker Registry v2
        .route("/v2/", get(oci_probe))
        .route("/v2/*rest", any(oci_dispatch))
        // Chunked uploads
        .route("/api/v1/artifacts/upload/initiate", post(upload_initiate))
        .route("/api/v1/artifacts/upload/:id/parts", post(upload_part))
        .route("/api/v1/artifacts/upload/:id/complete", post(upload_complete))
        .route("/api/v1/artifacts/upload/:id/progress", get(upload_progress))
        // Platform
        .route("/api/v1/repositories", post(repos_create).get(repos_list))
        .route("/api/v1/cache/flush", post(cache_flush))
        .route("/api/v1/metrics", get(metrics_snapshot))
        .route("/api/v1/health", get(health_check))
        .fallback(not_found)
        .layer(from_fn_with_state(state.clone(), context_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
