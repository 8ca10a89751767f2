//! Helm chart repository protocol.
//!
//! Chart uploads are gzipped tarballs; name and version come from the
//! `Chart.yaml` inside, never from the filename. The repository `index.yaml`
//! is regenerated from the artifact list on every change. Chart digests are
//! the SHA-256 of the tarball bytes.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ArtifactService, IndexStore, ProtocolCapabilities, StoreArtifact};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;
use crate::tenant::{EcosystemType, RepositoryBinding};

/// The fields of `Chart.yaml` the repository cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "appVersion")]
    pub app_version: Option<String>,
}

fn valid_chart_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Pull `Chart.yaml` out of a chart tarball (`{chart}/Chart.yaml`).
pub fn extract_manifest(tarball: &[u8]) -> Result<ChartManifest> {
    let mut archive = tar::Archive::new(GzDecoder::new(tarball));
    let entries = archive
        .entries()
        .map_err(|e| DepotError::Invalid(format!("not a chart tarball: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DepotError::Invalid(format!("corrupt tarball: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| DepotError::Invalid(format!("corrupt tarball path: {e}")))?;
        let mut components = path.components();
        let is_chart_yaml = components.next().is_some()
            && components.as_path().to_str() == Some("Chart.yaml");
        if !is_chart_yaml {
            continue;
        }
        let mut raw = String::new();
        entry
            .read_to_string(&mut raw)
            .map_err(|e| DepotError::Invalid(format!("unreadable Chart.yaml: {e}")))?;
        let manifest: ChartManifest = serde_yaml::from_str(&raw)
            .map_err(|e| DepotError::Invalid(format!("malformed Chart.yaml: {e}")))?;
        if !valid_chart_name(&manifest.name) {
            return Err(DepotError::Invalid(format!(
                "invalid chart name {:?}",
                manifest.name
            )));
        }
        if manifest.version.is_empty() {
            return Err(DepotError::Invalid("chart version is empty".into()));
        }
        return Ok(manifest);
    }
    Err(DepotError::Invalid("tarball contains no Chart.yaml".into()))
}

// ============================================================================
// index.yaml
// ============================================================================

#[derive(Debug, Serialize)]
struct HelmIndex {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    generated: DateTime<Utc>,
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Serialize)]
struct IndexEntry {
    name: String,
    version: String,
    urls: Vec<String>,
    created: DateTime<Utc>,
    digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "appVersion", skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,
}

// ============================================================================
// Capabilities
// ============================================================================

pub struct HelmProtocol;

impl ProtocolCapabilities for HelmProtocol {
    fn ecosystem(&self) -> EcosystemType {
        EcosystemType::Helm
    }

    fn validate(&self, path: &str) -> Result<()> {
        if path == "index.yaml" || path.ends_with("/index.yaml") || path.ends_with(".tgz") {
            Ok(())
        } else {
            Err(DepotError::Invalid(format!("unexpected helm path {path:?}")))
        }
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        self.validate(path)?;
        let filename = path.rsplit('/').next().unwrap_or(path);
        Ok(format!("charts/{filename}"))
    }

    fn content_type(&self, path: &str) -> &'static str {
        if path.ends_with(".yaml") {
            "application/x-yaml"
        } else {
            "application/gzip"
        }
    }

    fn requires_manifest(&self) -> bool {
        false
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn extract_metadata(&self, _path: &str, payload: &[u8]) -> Result<serde_json::Value> {
        let manifest = extract_manifest(payload)?;
        Ok(json!({
            "name": manifest.name,
            "version": manifest.version,
            "description": manifest.description,
            "app_version": manifest.app_version,
            "digest": sha256_hex(payload),
        }))
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct HelmHandler {
    service: Arc<ArtifactService>,
    index: Arc<IndexStore>,
}

impl HelmHandler {
    pub fn new(service: Arc<ArtifactService>, index: Arc<IndexStore>) -> Self {
        Self { service, index }
    }

    fn index_path(binding: &RepositoryBinding) -> String {
        format!("helm/{}/{}/index.yaml", binding.tenant, binding.repo)
    }

    /// `POST /helm/api/charts`.
    pub async fn upload_chart(
        &self,
        binding: &RepositoryBinding,
        tarball: Bytes,
        uploader: Option<String>,
    ) -> Result<ChartManifest> {
        let manifest = extract_manifest(&tarball)?;
        let filename = format!("{}-{}.tgz", manifest.name, manifest.version);
        let metadata = json!({
            "filename": filename,
            "description": manifest.description,
            "app_version": manifest.app_version,
            "digest": sha256_hex(&tarball),
        });

        self.service
            .store(StoreArtifact {
                tenant: binding.tenant.clone(),
                repo: binding.repo.clone(),
                ecosystem: EcosystemType::Helm,
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                storage_key: format!("charts/{filename}"),
                payload: tarball,
                ecosystem_metadata: metadata,
                uploader,
            })
            .await?;

        self.refresh_index(binding).await?;
        Ok(manifest)
    }

    /// `GET /helm/index.yaml`. An empty repository serves a valid empty
    /// index.
    pub async fn get_index(&self, binding: &RepositoryBinding) -> Result<Bytes> {
        match self.index.read(&Self::index_path(binding)).await? {
            Some(doc) => Ok(doc),
            None => {
                let empty = HelmIndex {
                    api_version: "v1",
                    generated: Utc::now(),
                    entries: BTreeMap::new(),
                };
                let rendered = serde_yaml::to_string(&empty)
                    .map_err(|e| DepotError::InternalIO(format!("render index.yaml: {e}")))?;
                Ok(Bytes::from(rendered))
            }
        }
    }

    /// `GET /helm/charts/{filename}`.
    pub async fn get_chart(&self, binding: &RepositoryBinding, filename: &str) -> Result<Bytes> {
        match self
            .service
            .load_by_storage_key(&binding.tenant, &binding.repo, &format!("charts/{filename}"))
            .await?
        {
            Some((_, bytes)) => Ok(bytes),
            None => Err(DepotError::NotFound(format!("chart {filename}"))),
        }
    }

    /// `DELETE /helm/api/charts/{name}/{version}`.
    pub async fn delete_chart(
        &self,
        binding: &RepositoryBinding,
        name: &str,
        version: &str,
    ) -> Result<()> {
        let record = self
            .service
            .metadata()
            .find(&binding.tenant, &binding.repo, name, version)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("chart {name}-{version}")))?;
        self.service.delete(&record).await?;
        self.refresh_index(binding).await
    }

    async fn refresh_index(&self, binding: &RepositoryBinding) -> Result<()> {
        let records = self
            .service
            .metadata()
            .list_repo(&binding.tenant, &binding.repo)
            .await?;

        let mut entries: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
        for record in records
            .into_iter()
            .filter(|r| r.ecosystem == EcosystemType::Helm)
        {
            let meta = &record.ecosystem_metadata;
            let filename = meta
                .get("filename")
                .and_then(|f| f.as_str())
                .map(|f| f.to_string())
                .unwrap_or_else(|| format!("{}-{}.tgz", record.name, record.version));
            entries.entry(record.name.clone()).or_default().push(IndexEntry {
                name: record.name.clone(),
                version: record.version.clone(),
                urls: vec![format!("charts/{filename}")],
                created: record.uploaded_at,
                digest: meta
                    .get("digest")
                    .and_then(|d| d.as_str())
                    .unwrap_or(&record.checksum)
                    .to_string(),
                description: meta
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.to_string()),
                app_version: meta
                    .get("app_version")
                    .and_then(|a| a.as_str())
                    .map(|a| a.to_string()),
            });
        }

        let index = HelmIndex {
            api_version: "v1",
            generated: Utc::now(),
            entries,
        };
        let rendered = serde_yaml::to_string(&index)
            .map_err(|e| DepotError::InternalIO(format!("render index.yaml: {e}")))?;
        self.index
            .write_atomic(&Self::index_path(binding), rendered.as_bytes())
            .await
    }
}
