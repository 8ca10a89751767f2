//! Protocol handlers: per-ecosystem translation between wire formats and
//! the artifact model.
//!
//! Each ecosystem contributes two pieces: a lightweight
//! [`ProtocolCapabilities`] implementation (pure path/payload functions,
//! selected by the ecosystem tag on a repository binding) and a handler
//! service owning the wire-level operations. The shared
//! [`ArtifactService`] sits underneath all of them: it pairs the blob
//! store with the metadata store and fans completed uploads out to the
//! scan queue.

pub mod helm;
pub mod maven;
pub mod npm;
pub mod oci;
pub mod pypi;

pub use helm::HelmHandler;
pub use maven::MavenHandler;
pub use npm::NpmHandler;
pub use oci::OciHandler;
pub use pypi::PypiHandler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::error::{DepotError, Result};
use crate::proxy::LocalArtifactSource;
use crate::scan::{ScanQueue, ScanRequest};
use crate::storage::{ArtifactRecord, BlobStore, MetadataStore};
use crate::tenant::{EcosystemType, RepositoryBinding, TenantId};
use crate::tenant::RepoId;

/// The capability set every ecosystem implements; the repository binding's
/// ecosystem tag selects the implementation.
pub trait ProtocolCapabilities: Send + Sync {
    fn ecosystem(&self) -> EcosystemType;

    /// Reject paths that violate the ecosystem's naming rules.
    fn validate(&self, path: &str) -> Result<()>;

    /// Wire path → storage key (the artifact's identity within the repo).
    fn storage_key(&self, path: &str) -> Result<String>;

    fn content_type(&self, path: &str) -> &'static str;

    /// Whether uploads must present a manifest document (OCI).
    fn requires_manifest(&self) -> bool;

    /// Whether the ecosystem maintains a per-package version index.
    fn supports_versioning(&self) -> bool;

    /// Derive ecosystem metadata from an uploaded payload.
    fn extract_metadata(&self, path: &str, payload: &[u8]) -> Result<serde_json::Value>;
}

/// Capability lookup by ecosystem tag.
pub struct HandlerRegistry {
    capabilities: HashMap<EcosystemType, Arc<dyn ProtocolCapabilities>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut capabilities: HashMap<EcosystemType, Arc<dyn ProtocolCapabilities>> =
            HashMap::new();
        capabilities.insert(EcosystemType::Maven, Arc::new(maven::MavenProtocol));
        capabilities.insert(EcosystemType::Npm, Arc::new(npm::NpmProtocol));
        capabilities.insert(EcosystemType::Pypi, Arc::new(pypi::PypiProtocol));
        capabilities.insert(EcosystemType::Helm, Arc::new(helm::HelmProtocol));
        capabilities.insert(EcosystemType::Oci, Arc::new(oci::OciProtocol));
        Self { capabilities }
    }

    pub fn get(&self, ecosystem: EcosystemType) -> Result<Arc<dyn ProtocolCapabilities>> {
        self.capabilities
            .get(&ecosystem)
            .cloned()
            .ok_or_else(|| DepotError::Invalid(format!("no protocol handler for {ecosystem}")))
    }
}

/// Atomic writer for index documents (`maven-metadata.xml`, npm package
/// documents, PyPI simple pages, Helm `index.yaml`, OCI tag maps).
/// Documents are written to a temp file and renamed into place so readers
/// never observe a partial index.
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        if rel.is_empty()
            || rel
                .split('/')
                .any(|c| c.is_empty() || c == "." || c == ".." || c.contains('\\'))
        {
            return Err(DepotError::Invalid(format!("invalid index path {rel:?}")));
        }
        Ok(self.root.join(rel))
    }

    pub async fn read(&self, rel: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.resolve(rel)?).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_atomic(&self, rel: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp-index");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(rel)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parameters for storing one artifact.
pub struct StoreArtifact {
    pub tenant: TenantId,
    pub repo: RepoId,
    pub ecosystem: EcosystemType,
    pub name: String,
    pub version: String,
    pub storage_key: String,
    pub payload: Bytes,
    pub ecosystem_metadata: serde_json::Value,
    pub uploader: Option<String>,
}

/// Shared upload/download/delete core every handler builds on.
pub struct ArtifactService {
    blob: Arc<BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    scan: ScanQueue,
    max_file_size: u64,
}

impl ArtifactService {
    pub fn new(
        blob: Arc<BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        scan: ScanQueue,
        max_file_size: u64,
    ) -> Self {
        Self {
            blob,
            metadata,
            scan,
            max_file_size,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn blob(&self) -> &Arc<BlobStore> {
        &self.blob
    }

    /// Store payload bytes and create the artifact record. The blob commit
    /// happens first; a metadata conflict rolls the blob back.
    pub async fn store(&self, request: StoreArtifact) -> Result<ArtifactRecord> {
        if request.payload.len() as u64 > self.max_file_size {
            return Err(DepotError::Invalid(format!(
                "payload of {} bytes exceeds the {} byte limit",
                request.payload.len(),
                self.max_file_size
            )));
        }
        if let Some(existing) = self
            .metadata
            .find(&request.tenant, &request.repo, &request.name, &request.version)
            .await?
        {
            return Err(DepotError::Conflict(format!(
                "{}:{} already stored as {}",
                request.name, request.version, existing.id
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let size = request.payload.len() as u64;
        let blob_meta = self
            .blob
            .upload(&request.tenant, &request.repo, &id, request.payload)
            .await?;

        let record = ArtifactRecord {
            id: id.clone(),
            tenant: request.tenant.clone(),
            repo: request.repo.clone(),
            ecosystem: request.ecosystem,
            name: request.name,
            version: request.version,
            size,
            checksum: blob_meta.checksum,
            storage_key: request.storage_key,
            ecosystem_metadata: request.ecosystem_metadata,
            uploaded_at: blob_meta.uploaded_at,
            uploader: request.uploader,
            storage_id: id.clone(),
        };

        if let Err(err) = self.metadata.create(record.clone()).await {
            let _ = self
                .blob
                .delete(&request.tenant, &request.repo, &id)
                .await;
            return Err(err);
        }

        self.scan.enqueue(ScanRequest {
            tenant: record.tenant.clone(),
            repo: record.repo.clone(),
            subject: record.id.clone(),
            size: record.size,
            requested_at: Utc::now(),
        });

        Ok(record)
    }

    /// Reconstructed payload for a record.
    pub async fn load(&self, record: &ArtifactRecord) -> Result<Bytes> {
        self.blob
            .download(&record.tenant, &record.repo, &record.storage_id)
            .await
    }

    pub async fn load_by_storage_key(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        storage_key: &str,
    ) -> Result<Option<(ArtifactRecord, Bytes)>> {
        match self
            .metadata
            .find_by_storage_key(tenant, repo, storage_key)
            .await?
        {
            Some(record) => {
                let bytes = self.load(&record).await?;
                Ok(Some((record, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Remove record and blob. Handlers update their index afterwards.
    pub async fn delete(&self, record: &ArtifactRecord) -> Result<()> {
        self.metadata
            .delete(&record.tenant, &record.repo, &record.id)
            .await?;
        self.blob
            .delete(&record.tenant, &record.repo, &record.storage_id)
            .await
    }
}

/// Hosted-repository lookup for the proxy router: storage-key match first,
/// content type from the ecosystem's capabilities.
pub struct LocalStore {
    service: Arc<ArtifactService>,
    registry: Arc<HandlerRegistry>,
}

impl LocalStore {
    pub fn new(service: Arc<ArtifactService>, registry: Arc<HandlerRegistry>) -> Self {
        Self { service, registry }
    }
}

#[async_trait]
impl LocalArtifactSource for LocalStore {
    async fn lookup(
        &self,
        binding: &RepositoryBinding,
        path: &str,
    ) -> Result<Option<(Bytes, Option<String>)>> {
        let key = path.trim_start_matches('/');
        match self
            .service
            .load_by_storage_key(&binding.tenant, &binding.repo, key)
            .await?
        {
            Some((_, bytes)) => {
                let content_type = self
                    .registry
                    .get(binding.ecosystem)
                    .ok()
                    .map(|c| c.content_type(key).to_string());
                Ok(Some((bytes, content_type)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures for handler tests.

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::replication::NoopReplication;
    use crate::storage::SledMetadataStore;

    pub struct Fixture {
        pub service: Arc<ArtifactService>,
        pub index: Arc<IndexStore>,
        pub tenant: TenantId,
        pub repo: RepoId,
        _tmp: tempfile::TempDir,
    }

    pub fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let blob = Arc::new(
            BlobStore::new(tmp.path().join("blobs"), 4, 2, Arc::new(NoopReplication)).unwrap(),
        );
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SledMetadataStore::open(tmp.path().join("meta")).unwrap());
        let scan = ScanQueue::spawn(64, Arc::new(MetricsRegistry::new()));
        let service = Arc::new(ArtifactService::new(
            blob,
            metadata,
            scan,
            64 * 1024 * 1024,
        ));
        let index = Arc::new(IndexStore::new(tmp.path().join("indexes")).unwrap());
        Fixture {
            service,
            index,
            tenant: TenantId::new("acme").unwrap(),
            repo: RepoId::new("main").unwrap(),
            _tmp: tmp,
        }
    }
}
