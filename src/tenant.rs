//! Tenant and repository model.
//!
//! Tenants are the isolation boundary; each owns named repositories bound to
//! a single package ecosystem. Bindings are id-referenced everywhere (never
//! shared mutable state) and live in an in-process registry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DepotError, Result};

/// Characters are restricted so ids can be embedded in filesystem paths and
/// cache keys without escaping.
fn validate_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 128 {
        return Err(DepotError::Invalid(format!(
            "{kind} must be 1-128 characters"
        )));
    }
    if value == "." || value == ".." {
        return Err(DepotError::Invalid(format!("{kind} {value:?} is reserved")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(DepotError::Invalid(format!(
            "{kind} {value:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_component("tenant id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repository identifier, unique within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_component("repository id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Package ecosystem a repository speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemType {
    Maven,
    Npm,
    Pypi,
    Helm,
    Oci,
    Generic,
}

impl EcosystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EcosystemType::Maven => "maven",
            EcosystemType::Npm => "npm",
            EcosystemType::Pypi => "pypi",
            EcosystemType::Helm => "helm",
            EcosystemType::Oci => "oci",
            EcosystemType::Generic => "generic",
        }
    }
}

impl fmt::Display for EcosystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for an upstream registry. Opaque to everything except the
/// adapter that attaches them to outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum UpstreamAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Default for UpstreamAuth {
    fn default() -> Self {
        UpstreamAuth::None
    }
}

/// One upstream registry an ecosystem proxy may fetch from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Stable identifier used by the health engine.
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub auth: UpstreamAuth,
    /// Per-attempt fetch timeout.
    #[serde(default = "default_upstream_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connections() -> usize {
    16
}

fn default_retry_attempts() -> u32 {
    3
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Whether a repository serves locally uploaded artifacts or proxies an
/// upstream registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryMode {
    Hosted,
    Proxy,
}

/// Binding of a repository id to its ecosystem, mode, and upstreams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryBinding {
    pub tenant: TenantId,
    pub repo: RepoId,
    pub ecosystem: EcosystemType,
    pub mode: RepositoryMode,
    /// Primary upstream for proxy repositories.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    /// Additional upstreams tried in priority order when the primary fails.
    #[serde(default)]
    pub backup_upstreams: Vec<UpstreamConfig>,
    /// Cache TTL override in seconds; the global default applies when unset.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

impl RepositoryBinding {
    /// Key used for registry lookups and cache-key prefixes.
    pub fn composite_id(&self) -> String {
        format!("{}/{}", self.tenant, self.repo)
    }

    pub fn cache_ttl(&self, default: Duration) -> Duration {
        self.cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// In-process registry of repository bindings.
#[derive(Default)]
pub struct RepositoryRegistry {
    bindings: DashMap<String, Arc<RepositoryBinding>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding; duplicate (tenant, repo) pairs conflict.
    pub fn create(&self, binding: RepositoryBinding) -> Result<Arc<RepositoryBinding>> {
        if binding.mode == RepositoryMode::Proxy && binding.upstream.is_none() {
            return Err(DepotError::Invalid(
                "proxy repository requires an upstream".into(),
            ));
        }
        let key = binding.composite_id();
        let binding = Arc::new(binding);
        match self.bindings.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DepotError::Conflict(format!(
                "repository {} already exists",
                binding.composite_id()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(binding.clone());
                Ok(binding)
            }
        }
    }

    pub fn get(&self, tenant: &TenantId, repo: &RepoId) -> Result<Arc<RepositoryBinding>> {
        self.bindings
            .get(&format!("{tenant}/{repo}"))
            .map(|e| e.value().clone())
            .ok_or_else(|| DepotError::NotFound(format!("repository {tenant}/{repo}")))
    }

    /// First repository of the tenant speaking `ecosystem`. The wire
    /// endpoints carry no repository segment, so each ecosystem resolves to
    /// the tenant's binding for it.
    pub fn find_for(
        &self,
        tenant: &TenantId,
        ecosystem: EcosystemType,
    ) -> Result<Arc<RepositoryBinding>> {
        let prefix = format!("{tenant}/");
        let mut found: Option<Arc<RepositoryBinding>> = None;
        for entry in self.bindings.iter() {
            if entry.key().starts_with(&prefix) && entry.value().ecosystem == ecosystem {
                let candidate = entry.value().clone();
                match &found {
                    Some(current) if current.repo.as_str() <= candidate.repo.as_str() => {}
                    _ => found = Some(candidate),
                }
            }
        }
        found.ok_or_else(|| {
            DepotError::NotFound(format!("no {ecosystem} repository for tenant {tenant}"))
        })
    }

    pub fn list(&self, tenant: &TenantId) -> Vec<Arc<RepositoryBinding>> {
        let prefix = format!("{tenant}/");
        let mut out: Vec<_> = self
            .bindings
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.repo.as_str().cmp(b.repo.as_str()));
        out
    }

    /// All distinct upstreams across every binding, for the health engine.
    pub fn all_upstreams(&self) -> Vec<UpstreamConfig> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for entry in self.bindings.iter() {
            let binding = entry.value();
            for upstream in binding.upstream.iter().chain(&binding.backup_upstreams) {
                if seen.insert(upstream.id.clone()) {
                    out.push(upstream.clone());
                }
            }
        }
        out
    }
}

/// Per-request tenant context, resolved by middleware from the subdomain or
/// `X-Tenant-*` headers (first recognized value wins).
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: TenantId,
    /// Authenticated subject, if a bearer token was presented.
    pub subject: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(tenant: &str, repo: &str, eco: EcosystemType) -> RepositoryBinding {
        RepositoryBinding {
            tenant: TenantId::new(tenant).unwrap(),
            repo: RepoId::new(repo).unwrap(),
            ecosystem: eco,
            mode: RepositoryMode::Hosted,
            upstream: None,
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        }
    }

    #[test]
    fn rejects_path_traversal_components() {
        assert!(TenantId::new("..").is_err());
        assert!(TenantId::new("a/b").is_err());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("acme-corp").is_ok());
    }

    #[test]
    fn duplicate_repository_conflicts() {
        let registry = RepositoryRegistry::new();
        registry
            .create(binding("acme", "releases", EcosystemType::Maven))
            .unwrap();
        let err = registry
            .create(binding("acme", "releases", EcosystemType::Maven))
            .unwrap_err();
        assert!(matches!(err, DepotError::Conflict(_)));
    }

    #[test]
    fn find_for_resolves_by_ecosystem() {
        let registry = RepositoryRegistry::new();
        registry
            .create(binding("acme", "maven-releases", EcosystemType::Maven))
            .unwrap();
        registry
            .create(binding("acme", "npm-local", EcosystemType::Npm))
            .unwrap();

        let found = registry
            .find_for(&TenantId::new("acme").unwrap(), EcosystemType::Npm)
            .unwrap();
        assert_eq!(found.repo.as_str(), "npm-local");

        let missing = registry.find_for(&TenantId::new("acme").unwrap(), EcosystemType::Helm);
        assert!(matches!(missing, Err(DepotError::NotFound(_))));
    }

    #[test]
    fn proxy_binding_requires_upstream() {
        let registry = RepositoryRegistry::new();
        let mut b = binding("acme", "central", EcosystemType::Maven);
        b.mode = RepositoryMode::Proxy;
        assert!(matches!(registry.create(b), Err(DepotError::Invalid(_))));
    }
}
