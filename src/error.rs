//! Error taxonomy shared across the platform.
//!
//! Every fallible operation below the HTTP layer returns [`DepotError`];
//! handlers convert it to a JSON error response with the matching status
//! code. Cache-tier failures are deliberately absent from most request
//! paths: a tier that fails is logged and skipped, never surfaced, as long
//! as the request can be served from another source.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Platform-wide error type. `Clone` so coalesced in-flight requests can
/// all observe the same outcome.
#[derive(Error, Debug, Clone)]
pub enum DepotError {
    /// Artifact, blob, session, repository, or cache key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request: bad path, invalid name/version, invalid manifest,
    /// chunk index out of range, filename rule violations.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Tenant mismatch, policy denial, or locked artifact.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Duplicate create where uniqueness matters.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Declared digest does not match the computed digest.
    #[error("digest invalid: {0}")]
    DigestInvalid(String),

    /// Whole-object checksum mismatch after reconstruction.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// A shard that is present on disk fails its recorded checksum.
    #[error("shard {index} corrupted: checksum mismatch")]
    ShardCorruption { index: usize },

    /// Fewer shards recoverable than the coder needs.
    #[error("insufficient shards: {available} available, {required} required")]
    InsufficientShards { available: usize, required: usize },

    /// Upstream registry unreachable or errored after retries.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// The request context was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,

    /// Local filesystem, cache, or metadata store I/O failure.
    #[error("storage I/O error: {0}")]
    InternalIO(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DepotError>;

impl DepotError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DepotError::NotFound(_) => StatusCode::NOT_FOUND,
            DepotError::Invalid(_) | DepotError::DigestInvalid(_) => StatusCode::BAD_REQUEST,
            DepotError::Forbidden(_) => StatusCode::FORBIDDEN,
            DepotError::Conflict(_) => StatusCode::CONFLICT,
            DepotError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            // 499 is the de-facto "client closed request" code.
            DepotError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            DepotError::IntegrityFailure(_)
            | DepotError::ShardCorruption { .. }
            | DepotError::InsufficientShards { .. }
            | DepotError::InternalIO(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DepotError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<std::io::Error> for DepotError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DepotError::NotFound(err.to_string()),
            _ => DepotError::InternalIO(err.to_string()),
        }
    }
}

impl From<sled::Error> for DepotError {
    fn from(err: sled::Error) -> Self {
        DepotError::InternalIO(format!("metadata store: {err}"))
    }
}
