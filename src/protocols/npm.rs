//! npm registry protocol.
//!
//! Publishes arrive as one JSON document carrying version manifests plus
//! base64 tarballs under `_attachments`; each version becomes one stored
//! artifact. The per-package registry document (`_id`, `name`, `dist-tags`,
//! `versions`, `time`) is maintained as an index artifact. Tarball URLs are
//! stored host-relative and rewritten against the requesting host when the
//! document is served.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::Digest as _;

use super::{ArtifactService, IndexStore, ProtocolCapabilities, StoreArtifact};
use crate::error::{DepotError, Result};
use crate::tenant::{EcosystemType, RepositoryBinding};

/// npm package-name rules: lowercase, URL-safe, optionally `@scope/name`.
pub fn validate_package_name(name: &str) -> Result<()> {
    let bare = match name.strip_prefix('@') {
        Some(rest) => {
            let (scope, bare) = rest.split_once('/').ok_or_else(|| {
                DepotError::Invalid(format!("scoped package {name:?} needs a /"))
            })?;
            if scope.is_empty() || !valid_name_part(scope) {
                return Err(DepotError::Invalid(format!("invalid scope in {name:?}")));
            }
            bare
        }
        None => name,
    };
    if name.len() > 214 || bare.is_empty() || !valid_name_part(bare) {
        return Err(DepotError::Invalid(format!("invalid package name {name:?}")));
    }
    Ok(())
}

fn valid_name_part(part: &str) -> bool {
    !part.starts_with('.')
        && !part.starts_with('_')
        && part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.' | '~'))
}

/// Name without its scope, used in tarball filenames.
fn bare_name(name: &str) -> &str {
    name.rsplit_once('/').map(|(_, b)| b).unwrap_or(name)
}

#[derive(Debug, Deserialize)]
struct PublishDoc {
    name: String,
    #[serde(default)]
    versions: HashMap<String, Value>,
    #[serde(default, rename = "dist-tags")]
    dist_tags: HashMap<String, String>,
    #[serde(default, rename = "_attachments")]
    attachments: HashMap<String, Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    data: String,
}

/// Greatest non-prerelease version wins `latest`; prereleases only count
/// when nothing else exists.
fn compute_latest<'a>(versions: impl Iterator<Item = &'a str>) -> Option<String> {
    let parsed: Vec<semver::Version> = versions
        .filter_map(|v| semver::Version::parse(v).ok())
        .collect();
    parsed
        .iter()
        .filter(|v| v.pre.is_empty())
        .max()
        .or_else(|| parsed.iter().max())
        .map(|v| v.to_string())
}

// ============================================================================
// Capabilities
// ============================================================================

pub struct NpmProtocol;

impl ProtocolCapabilities for NpmProtocol {
    fn ecosystem(&self) -> EcosystemType {
        EcosystemType::Npm
    }

    fn validate(&self, path: &str) -> Result<()> {
        match path.split_once("/-/") {
            Some((package, file)) => {
                validate_package_name(package)?;
                if file.is_empty() || !file.ends_with(".tgz") {
                    return Err(DepotError::Invalid(format!("invalid tarball name {file:?}")));
                }
                Ok(())
            }
            None => validate_package_name(path),
        }
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        self.validate(path)?;
        Ok(path.trim_matches('/').to_string())
    }

    fn content_type(&self, path: &str) -> &'static str {
        if path.contains("/-/") {
            "application/octet-stream"
        } else {
            "application/json"
        }
    }

    fn requires_manifest(&self) -> bool {
        false
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn extract_metadata(&self, _path: &str, payload: &[u8]) -> Result<serde_json::Value> {
        Ok(json!({
            "dist": {
                "shasum": hex::encode(sha1::Sha1::digest(payload)),
                "integrity": format!("sha512-{}", BASE64.encode(sha2::Sha512::digest(payload))),
            },
        }))
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct NpmHandler {
    service: Arc<ArtifactService>,
    index: Arc<IndexStore>,
}

impl NpmHandler {
    pub fn new(service: Arc<ArtifactService>, index: Arc<IndexStore>) -> Self {
        Self { service, index }
    }

    fn doc_path(binding: &RepositoryBinding, package: &str) -> String {
        format!(
            "npm/{}/{}/{}/package.json",
            binding.tenant, binding.repo, package
        )
    }

    /// `PUT /npm/{package}`: store every attached version, then refresh the
    /// registry document.
    pub async fn publish(
        &self,
        binding: &RepositoryBinding,
        package: &str,
        body: &[u8],
        uploader: Option<String>,
    ) -> Result<()> {
        validate_package_name(package)?;
        let doc: PublishDoc = serde_json::from_slice(body)
            .map_err(|e| DepotError::Invalid(format!("malformed publish document: {e}")))?;
        if doc.name != package {
            return Err(DepotError::Invalid(format!(
                "document name {:?} does not match path {package:?}",
                doc.name
            )));
        }
        if doc.versions.is_empty() {
            return Err(DepotError::Invalid("publish carries no versions".into()));
        }

        for (version, manifest) in &doc.versions {
            let filename = format!("{}-{version}.tgz", bare_name(package));
            let attachment = doc.attachments.get(&filename).ok_or_else(|| {
                DepotError::Invalid(format!("missing attachment {filename:?}"))
            })?;
            let compact: String = attachment
                .data
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            let tarball = BASE64.decode(compact.as_bytes()).map_err(|e| {
                DepotError::Invalid(format!("attachment {filename:?} is not base64: {e}"))
            })?;

            let mut metadata = NpmProtocol.extract_metadata("", &tarball)?;
            metadata["filename"] = json!(filename);
            metadata["manifest"] = manifest.clone();

            self.service
                .store(StoreArtifact {
                    tenant: binding.tenant.clone(),
                    repo: binding.repo.clone(),
                    ecosystem: EcosystemType::Npm,
                    name: package.to_string(),
                    version: version.clone(),
                    storage_key: format!("{package}/-/{filename}"),
                    payload: Bytes::from(tarball),
                    ecosystem_metadata: metadata,
                    uploader: uploader.clone(),
                })
                .await?;
        }

        self.refresh_document(binding, package, &doc).await
    }

    async fn refresh_document(
        &self,
        binding: &RepositoryBinding,
        package: &str,
        publish: &PublishDoc,
    ) -> Result<()> {
        let records = self
            .service
            .metadata()
            .list_versions(&binding.tenant, &binding.repo, package)
            .await?;

        let path = Self::doc_path(binding, package);
        let mut doc: Value = match self.index.read(&path).await? {
            Some(existing) => serde_json::from_slice(&existing)
                .unwrap_or_else(|_| json!({ "_id": package, "name": package })),
            None => json!({ "_id": package, "name": package }),
        };

        let now = Utc::now().to_rfc3339();
        if doc.get("time").and_then(|t| t.get("created")).is_none() {
            doc["time"] = json!({ "created": now });
        }
        doc["time"]["modified"] = json!(now);

        let mut versions = serde_json::Map::new();
        for record in &records {
            let meta = &record.ecosystem_metadata;
            let filename = meta
                .get("filename")
                .and_then(|f| f.as_str())
                .map(|f| f.to_string())
                .unwrap_or_else(|| format!("{}-{}.tgz", bare_name(package), record.version));
            let mut manifest = meta
                .get("manifest")
                .cloned()
                .unwrap_or_else(|| json!({ "name": package, "version": record.version }));
            manifest["dist"] = json!({
                "shasum": meta.get("dist").and_then(|d| d.get("shasum")).cloned(),
                "integrity": meta.get("dist").and_then(|d| d.get("integrity")).cloned(),
                "tarball": format!("/npm/{package}/-/{filename}"),
            });
            if doc["time"].get(&record.version).is_none() {
                doc["time"][&record.version] = json!(now);
            }
            versions.insert(record.version.clone(), manifest);
        }

        let mut dist_tags = serde_json::Map::new();
        for (tag, version) in &publish.dist_tags {
            if versions.contains_key(version) {
                dist_tags.insert(tag.clone(), json!(version));
            }
        }
        if !dist_tags.contains_key("latest") {
            if let Some(latest) = compute_latest(versions.keys().map(String::as_str)) {
                dist_tags.insert("latest".into(), json!(latest));
            }
        }

        doc["versions"] = Value::Object(versions);
        doc["dist-tags"] = Value::Object(dist_tags);

        let rendered = serde_json::to_vec_pretty(&doc)
            .map_err(|e| DepotError::InternalIO(format!("render package document: {e}")))?;
        self.index.write_atomic(&path, &rendered).await
    }

    /// `GET /npm/{package}`: the registry document with tarball URLs
    /// rewritten against `base_url`.
    pub async fn get_metadata(
        &self,
        binding: &RepositoryBinding,
        package: &str,
        base_url: &str,
    ) -> Result<Value> {
        validate_package_name(package)?;
        let raw = self
            .index
            .read(&Self::doc_path(binding, package))
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("package {package}")))?;
        let mut doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| DepotError::InternalIO(format!("decode package document: {e}")))?;

        let base = base_url.trim_end_matches('/');
        if let Some(versions) = doc.get_mut("versions").and_then(|v| v.as_object_mut()) {
            for manifest in versions.values_mut() {
                if let Some(tarball) = manifest
                    .get_mut("dist")
                    .and_then(|d| d.get_mut("tarball"))
                {
                    if let Some(path) = tarball.as_str() {
                        if path.starts_with('/') {
                            *tarball = json!(format!("{base}{path}"));
                        }
                    }
                }
            }
        }
        Ok(doc)
    }

    /// `GET /npm/{package}/-/{filename}`.
    pub async fn get_tarball(
        &self,
        binding: &RepositoryBinding,
        package: &str,
        filename: &str,
    ) -> Result<Bytes> {
        validate_package_name(package)?;
        let key = format!("{package}/-/{filename}");
        match self
            .service
            .load_by_storage_key(&binding.tenant, &binding.repo, &key)
            .await?
        {
            Some((_, bytes)) => Ok(bytes),
            None => Err(DepotError::NotFound(format!("tarball {filename}"))),
        }
    }
}
