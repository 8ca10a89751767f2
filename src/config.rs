//! Environment-driven configuration.
//!
//! All tunables come from the process environment with sensible defaults so
//! a bare `depot` starts against a local directory. Invalid numeric values
//! fail startup instead of being silently replaced.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors, reported once at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Blob store and erasure coding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Base directory for shard files and temporary upload chunks.
    pub base_path: PathBuf,
    /// Location of the embedded metadata store.
    pub metadata_path: PathBuf,
    /// Number of data shards (k).
    pub data_shards: usize,
    /// Number of parity shards (m).
    pub parity_shards: usize,
    /// Hard cap on a single artifact's size in bytes.
    pub max_file_size: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data/blobs"),
            metadata_path: PathBuf::from("./data/metadata"),
            data_shards: 4,
            parity_shards: 2,
            max_file_size: 5 * 1024 * 1024 * 1024,
        }
    }
}

/// Cache tier sizing and TTL settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// L1 capacity in bytes.
    pub l1_max_bytes: u64,
    /// L2 capacity in bytes.
    pub l2_max_bytes: u64,
    /// L2 directory.
    pub l2_path: PathBuf,
    /// L3 object-store root; `None` disables the tier.
    pub l3_path: Option<PathBuf>,
    /// Default TTL applied when a repository binding does not override it.
    pub default_ttl: Duration,
    /// Entries below this size are admitted to L1 only.
    pub small_threshold: u64,
    /// Entries below this size are admitted to L1+L2; larger ones also to L3.
    pub medium_threshold: u64,
    /// Interval between TTL sweeps.
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_max_bytes: 256 * 1024 * 1024,
            l2_max_bytes: 10 * 1024 * 1024 * 1024,
            l2_path: PathBuf::from("./data/cache"),
            l3_path: None,
            default_ttl: Duration::from_secs(3600),
            small_threshold: 10 * 1024 * 1024,
            medium_threshold: 1024 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Proxy retry and health-probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Retry attempts for transient upstream failures.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff.
    pub retry_base_delay: Duration,
    /// Ceiling for the backoff delay.
    pub retry_max_delay: Duration,
    /// Per-attempt upstream fetch timeout.
    pub fetch_timeout: Duration,
    /// Minimum interval between health probes of one upstream.
    pub health_interval: Duration,
    /// Health probe timeout.
    pub health_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(60),
            health_interval: Duration::from_secs(300),
            health_timeout: Duration::from_secs(10),
        }
    }
}

/// External policy-decision service (OPA) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    pub enabled: bool,
    pub url: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotConfig {
    pub listen_addr: SocketAddr,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub proxy: ProxySettings,
    pub policy: PolicySettings,
    /// HS256 secret for bearer tokens; `None` runs the API unauthenticated.
    pub auth_secret: Option<String>,
    /// Accepted for deployments that front L1 with an external KV store.
    pub redis_url: Option<String>,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("static addr"),
            storage: StorageSettings::default(),
            cache: CacheSettings::default(),
            proxy: ProxySettings::default(),
            policy: PolicySettings::default(),
            auth_secret: None,
            redis_url: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name,
                value: raw,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl DepotConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STORAGE_PATH") {
            let base = PathBuf::from(&path);
            config.storage.metadata_path = base.join("metadata");
            config.cache.l2_path = base.join("cache");
            config.storage.base_path = base.join("blobs");
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            // The embedded store treats the URL as a filesystem path.
            config.storage.metadata_path =
                PathBuf::from(url.trim_start_matches("sled://").to_string());
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = Some(url);
        }

        if let Some(k) = parse_var::<usize>("ERASURE_DATA_SHARDS")? {
            if k == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "ERASURE_DATA_SHARDS",
                    value: k.to_string(),
                    reason: "must be at least 1".into(),
                });
            }
            config.storage.data_shards = k;
        }
        if let Some(m) = parse_var::<usize>("ERASURE_PARITY_SHARDS")? {
            config.storage.parity_shards = m;
        }
        if let Some(max) = parse_var::<u64>("MAX_FILE_SIZE")? {
            config.storage.max_file_size = max;
        }

        if let Some(bytes) = parse_var::<u64>("DEPOT_L1_MAX_BYTES")? {
            config.cache.l1_max_bytes = bytes;
        }
        if let Some(gb) = parse_var::<u64>("DEPOT_L2_MAX_GB")? {
            config.cache.l2_max_bytes = gb * 1024 * 1024 * 1024;
        }
        if let Ok(path) = std::env::var("DEPOT_L3_PATH") {
            config.cache.l3_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64>("DEPOT_CACHE_TTL_SECS")? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }

        if let Some(enabled) = parse_var::<bool>("OPA_ENABLED")? {
            config.policy.enabled = enabled;
        }
        if let Ok(url) = std::env::var("OPA_URL") {
            config.policy.url = Some(url);
        }

        if let Some(addr) = parse_var::<SocketAddr>("DEPOT_LISTEN_ADDR")? {
            config.listen_addr = addr;
        }
        if let Ok(secret) = std::env::var("DEPOT_AUTH_SECRET") {
            if !secret.is_empty() {
                config.auth_secret = Some(secret);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DepotConfig::default();
        assert_eq!(config.storage.data_shards, 4);
        assert_eq!(config.storage.parity_shards, 2);
        assert_eq!(config.cache.small_threshold, 10 * 1024 * 1024);
        assert_eq!(config.cache.medium_threshold, 1024 * 1024 * 1024);
        assert!(config.auth_secret.is_none());
        assert!(!config.policy.enabled);
    }
}
