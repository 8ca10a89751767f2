//! PyPI protocol: PEP 503 simple index plus the legacy upload API.
//!
//! Project names are normalized (lowercase, runs of `-_.` collapse to `-`)
//! before storage, so any spelling of a name resolves to one index page.
//! File links carry `#sha256=` fragments taken from stored checksums and a
//! `data-requires-python` attribute when the upload declared one.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use super::{ArtifactService, IndexStore, ProtocolCapabilities, StoreArtifact};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;
use crate::tenant::{EcosystemType, RepositoryBinding};

/// PEP 503 name normalization.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            in_separator = true;
        } else {
            if in_separator && !out.is_empty() {
                out.push('-');
            }
            in_separator = false;
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

/// Distribution coordinates parsed from a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    /// Normalized project name.
    pub name: String,
    pub version: String,
    pub filename: String,
}

/// Parse wheel (`name-version-python-abi-platform.whl`) and sdist
/// (`name-version.tar.gz` / `.zip`) filenames.
pub fn parse_filename(filename: &str) -> Result<Distribution> {
    if let Some(stem) = filename.strip_suffix(".whl") {
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 5 {
            return Err(DepotError::Invalid(format!(
                "wheel {filename:?} needs name-version-python-abi-platform"
            )));
        }
        return Ok(Distribution {
            name: normalize_name(parts[0]),
            version: parts[1].to_string(),
            filename: filename.to_string(),
        });
    }

    let stem = filename
        .strip_suffix(".tar.gz")
        .or_else(|| filename.strip_suffix(".zip"))
        .ok_or_else(|| {
            DepotError::Invalid(format!("unsupported distribution file {filename:?}"))
        })?;
    let (name, version) = stem.rsplit_once('-').ok_or_else(|| {
        DepotError::Invalid(format!("sdist {filename:?} needs name-version"))
    })?;
    if !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(DepotError::Invalid(format!(
            "sdist {filename:?} has no parseable version"
        )));
    }
    Ok(Distribution {
        name: normalize_name(name),
        version: version.to_string(),
        filename: filename.to_string(),
    })
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// Capabilities
// ============================================================================

pub struct PypiProtocol;

impl ProtocolCapabilities for PypiProtocol {
    fn ecosystem(&self) -> EcosystemType {
        EcosystemType::Pypi
    }

    fn validate(&self, path: &str) -> Result<()> {
        let filename = path.rsplit('/').next().unwrap_or(path);
        parse_filename(filename).map(|_| ())
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        let filename = path.rsplit('/').next().unwrap_or(path);
        let dist = parse_filename(filename)?;
        Ok(format!("packages/{}/{}", dist.name, dist.filename))
    }

    fn content_type(&self, path: &str) -> &'static str {
        if path.ends_with('/') || path.ends_with(".html") {
            "text/html; charset=utf-8"
        } else {
            "application/octet-stream"
        }
    }

    fn requires_manifest(&self) -> bool {
        false
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn extract_metadata(&self, path: &str, payload: &[u8]) -> Result<serde_json::Value> {
        let filename = path.rsplit('/').next().unwrap_or(path);
        let dist = parse_filename(filename)?;
        Ok(json!({
            "filename": dist.filename,
            "version": dist.version,
            "sha256": sha256_hex(payload),
        }))
    }
}

// ============================================================================
// Handler
// ============================================================================

/// One upload through the legacy API.
pub struct PypiUpload {
    /// Declared project name; derived from the filename when absent.
    pub name: Option<String>,
    pub version: Option<String>,
    pub filename: String,
    pub content: Bytes,
    pub requires_python: Option<String>,
}

pub struct PypiHandler {
    service: Arc<ArtifactService>,
    index: Arc<IndexStore>,
}

impl PypiHandler {
    pub fn new(service: Arc<ArtifactService>, index: Arc<IndexStore>) -> Self {
        Self { service, index }
    }

    fn root_page_path(binding: &RepositoryBinding) -> String {
        format!("pypi/{}/{}/simple.html", binding.tenant, binding.repo)
    }

    fn project_page_path(binding: &RepositoryBinding, name: &str) -> String {
        format!("pypi/{}/{}/{}/index.html", binding.tenant, binding.repo, name)
    }

    /// `POST /pypi/` (legacy upload API).
    pub async fn upload(
        &self,
        binding: &RepositoryBinding,
        upload: PypiUpload,
        uploader: Option<String>,
    ) -> Result<()> {
        let dist = parse_filename(&upload.filename)?;
        if let Some(declared) = &upload.name {
            if normalize_name(declared) != dist.name {
                return Err(DepotError::Invalid(format!(
                    "declared name {declared:?} does not match filename {:?}",
                    upload.filename
                )));
            }
        }
        let version = upload.version.clone().unwrap_or_else(|| dist.version.clone());
        if version != dist.version {
            return Err(DepotError::Invalid(format!(
                "declared version {version:?} does not match filename {:?}",
                upload.filename
            )));
        }

        let mut metadata = PypiProtocol.extract_metadata(&upload.filename, &upload.content)?;
        if let Some(requires) = &upload.requires_python {
            metadata["requires_python"] = json!(requires);
        }

        self.service
            .store(StoreArtifact {
                tenant: binding.tenant.clone(),
                repo: binding.repo.clone(),
                ecosystem: EcosystemType::Pypi,
                // One artifact per file: sdist and wheel of a version coexist.
                name: dist.name.clone(),
                version: format!("{}+{}", dist.version, dist.filename),
                storage_key: format!("packages/{}/{}", dist.name, dist.filename),
                payload: upload.content,
                ecosystem_metadata: metadata,
                uploader,
            })
            .await?;

        self.refresh_project_page(binding, &dist.name).await?;
        self.refresh_root_page(binding).await
    }

    async fn refresh_project_page(
        &self,
        binding: &RepositoryBinding,
        name: &str,
    ) -> Result<()> {
        let records = self
            .service
            .metadata()
            .list_versions(&binding.tenant, &binding.repo, name)
            .await?;

        let mut links = String::new();
        for record in &records {
            let meta = &record.ecosystem_metadata;
            let filename = meta
                .get("filename")
                .and_then(|f| f.as_str())
                .unwrap_or(&record.version);
            let sha256 = meta
                .get("sha256")
                .and_then(|s| s.as_str())
                .unwrap_or(&record.checksum);
            let requires = meta
                .get("requires_python")
                .and_then(|r| r.as_str())
                .map(|r| format!(" data-requires-python=\"{}\"", html_escape(r)))
                .unwrap_or_default();
            links.push_str(&format!(
                "    <a href=\"/pypi/packages/{name}/{filename}#sha256={sha256}\"{requires}>{filename}</a><br/>\n"
            ));
        }

        let page = format!(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <meta name=\"pypi:repository-version\" content=\"1.0\">\n    <title>Links for {name}</title>\n  </head>\n  <body>\n    <h1>Links for {name}</h1>\n{links}  </body>\n</html>\n"
        );
        self.index
            .write_atomic(&Self::project_page_path(binding, name), page.as_bytes())
            .await
    }

    async fn refresh_root_page(&self, binding: &RepositoryBinding) -> Result<()> {
        let records = self
            .service
            .metadata()
            .list_repo(&binding.tenant, &binding.repo)
            .await?;
        let names: BTreeSet<String> = records
            .into_iter()
            .filter(|r| r.ecosystem == EcosystemType::Pypi)
            .map(|r| r.name)
            .collect();

        let mut links = String::new();
        for name in &names {
            links.push_str(&format!("    <a href=\"/simple/{name}/\">{name}</a><br/>\n"));
        }
        let page = format!(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <meta name=\"pypi:repository-version\" content=\"1.0\">\n    <title>Simple index</title>\n  </head>\n  <body>\n{links}  </body>\n</html>\n"
        );
        self.index
            .write_atomic(&Self::root_page_path(binding), page.as_bytes())
            .await
    }

    /// `GET /simple/`.
    pub async fn simple_index(&self, binding: &RepositoryBinding) -> Result<Bytes> {
        match self.index.read(&Self::root_page_path(binding)).await? {
            Some(page) => Ok(page),
            None => Ok(Bytes::from_static(
                b"<!DOCTYPE html>\n<html>\n  <head>\n    <meta name=\"pypi:repository-version\" content=\"1.0\">\n  </head>\n  <body>\n  </body>\n</html>\n",
            )),
        }
    }

    /// `GET /simple/{project}/` with any spelling of the name.
    pub async fn project_index(
        &self,
        binding: &RepositoryBinding,
        project: &str,
    ) -> Result<Bytes> {
        let name = normalize_name(project);
        self.index
            .read(&Self::project_page_path(binding, &name))
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("project {name}")))
    }

    /// `GET /pypi/packages/{project}/{filename}`.
    pub async fn get_file(
        &self,
        binding: &RepositoryBinding,
        project: &str,
        filename: &str,
    ) -> Result<Bytes> {
        let key = format!("packages/{}/{}", normalize_name(project), filename);
        match self
            .service
            .load_by_storage_key(&binding.tenant, &binding.repo, &key)
            .await?
        {
            Some((_, bytes)) => Ok(bytes),
            None => Err(DepotError::NotFound(format!("file {filename}"))),
        }
    }
}
