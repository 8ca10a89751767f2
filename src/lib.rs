//! # DEPOT - Multi-Tenant Artifact Repository Platform
//!
//! A repository manager that stores, proxies, and secures software packages
//! across Maven, npm, PyPI, Helm, and OCI/Docker ecosystems.
//!
//! ## Architecture
//!
//! - `storage`: erasure-coded blob store and artifact metadata
//! - `cache`: three-tier read-through cache (memory / disk / object store)
//! - `proxy`: request router, upstream adapters, retries, health, fallbacks
//! - `protocols`: per-ecosystem wire-format translation
//! - `upload`: resumable chunked uploads
//! - `api`: the axum HTTP surface
//! - `scan`, `replication`, `policy`: injected collaborators for the
//!   external scanner, replicator, and policy service

#![warn(clippy::all)]

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod protocols;
pub mod proxy;
pub mod replication;
pub mod scan;
pub mod storage;
pub mod tenant;
pub mod upload;

pub use api::AppState;
pub use config::DepotConfig;
pub use error::{DepotError, Result};

/// Crate version, surfaced at startup and in diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
