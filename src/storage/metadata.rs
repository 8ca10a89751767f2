//! Artifact records.
//!
//! The metadata store owns the canonical record for every stored package
//! version: coordinates, checksum, ecosystem-specific metadata, and the
//! reference into the blob store. Backed by the embedded sled KV with three
//! trees: records by id, a coordinate index enforcing (tenant, repo, name,
//! version) uniqueness, and a storage-key index for path-addressed lookups.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DepotError, Result};
use crate::tenant::{EcosystemType, RepoId, TenantId};

/// Separator for composite keys; not producible by validated id components
/// and outside the printable range package names use.
const SEP: char = '\u{1f}';

/// Canonical record for a stored package version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub tenant: TenantId,
    pub repo: RepoId,
    pub ecosystem: EcosystemType,
    pub name: String,
    pub version: String,
    pub size: u64,
    /// Whole-object SHA-256 of the original bytes.
    pub checksum: String,
    /// Wire-level identity within the repository, e.g. a Maven path or an
    /// OCI digest path. Unique per repository.
    pub storage_key: String,
    pub ecosystem_metadata: serde_json::Value,
    pub uploaded_at: DateTime<Utc>,
    /// `None` for proxy-admitted artifacts.
    pub uploader: Option<String>,
    /// Blob store reference.
    pub storage_id: String,
}

/// Store of artifact records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a record. Fails with `Conflict` when (tenant, repo, name,
    /// version) already exists.
    async fn create(&self, record: ArtifactRecord) -> Result<()>;

    async fn get(&self, tenant: &TenantId, repo: &RepoId, id: &str) -> Result<ArtifactRecord>;

    async fn find(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        name: &str,
        version: &str,
    ) -> Result<Option<ArtifactRecord>>;

    async fn find_by_storage_key(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        storage_key: &str,
    ) -> Result<Option<ArtifactRecord>>;

    async fn list_repo(&self, tenant: &TenantId, repo: &RepoId) -> Result<Vec<ArtifactRecord>>;

    async fn list_versions(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        name: &str,
    ) -> Result<Vec<ArtifactRecord>>;

    async fn delete(&self, tenant: &TenantId, repo: &RepoId, id: &str) -> Result<()>;
}

/// Sled-backed implementation.
pub struct SledMetadataStore {
    records: sled::Tree,
    coordinates: sled::Tree,
    storage_keys: sled::Tree,
    _db: sled::Db,
}

fn record_key(tenant: &TenantId, repo: &RepoId, id: &str) -> String {
    format!("{tenant}{SEP}{repo}{SEP}{id}")
}

fn coordinate_key(tenant: &TenantId, repo: &RepoId, name: &str, version: &str) -> String {
    format!("{tenant}{SEP}{repo}{SEP}{name}{SEP}{version}")
}

fn storage_key_key(tenant: &TenantId, repo: &RepoId, storage_key: &str) -> String {
    format!("{tenant}{SEP}{repo}{SEP}{storage_key}")
}

impl SledMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Ok(Self {
            records: db.open_tree("artifacts")?,
            coordinates: db.open_tree("coordinates")?,
            storage_keys: db.open_tree("storage_keys")?,
            _db: db,
        })
    }

    fn decode(&self, raw: &[u8]) -> Result<ArtifactRecord> {
        serde_json::from_slice(raw)
            .map_err(|e| DepotError::InternalIO(format!("decode artifact record: {e}")))
    }

    fn load_by_id_key(&self, key: &str) -> Result<Option<ArtifactRecord>> {
        match self.records.get(key)? {
            Some(raw) => Ok(Some(self.decode(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MetadataStore for SledMetadataStore {
    async fn create(&self, record: ArtifactRecord) -> Result<()> {
        let coord = coordinate_key(&record.tenant, &record.repo, &record.name, &record.version);
        let id_key = record_key(&record.tenant, &record.repo, &record.id);
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| DepotError::InternalIO(format!("encode artifact record: {e}")))?;

        // The coordinate index is the uniqueness gate.
        let swap = self.coordinates.compare_and_swap(
            coord.as_bytes(),
            None as Option<&[u8]>,
            Some(record.id.as_bytes()),
        )?;
        if swap.is_err() {
            return Err(DepotError::Conflict(format!(
                "artifact {}:{} already exists in {}/{}",
                record.name, record.version, record.tenant, record.repo
            )));
        }

        self.records.insert(id_key.as_bytes(), encoded)?;
        self.storage_keys.insert(
            storage_key_key(&record.tenant, &record.repo, &record.storage_key).as_bytes(),
            record.id.as_bytes(),
        )?;
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, repo: &RepoId, id: &str) -> Result<ArtifactRecord> {
        self.load_by_id_key(&record_key(tenant, repo, id))?
            .ok_or_else(|| DepotError::NotFound(format!("artifact {id} in {tenant}/{repo}")))
    }

    async fn find(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        name: &str,
        version: &str,
    ) -> Result<Option<ArtifactRecord>> {
        match self
            .coordinates
            .get(coordinate_key(tenant, repo, name, version).as_bytes())?
        {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).to_string();
                self.load_by_id_key(&record_key(tenant, repo, &id))
            }
            None => Ok(None),
        }
    }

    async fn find_by_storage_key(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        storage_key: &str,
    ) -> Result<Option<ArtifactRecord>> {
        match self
            .storage_keys
            .get(storage_key_key(tenant, repo, storage_key).as_bytes())?
        {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).to_string();
                self.load_by_id_key(&record_key(tenant, repo, &id))
            }
            None => Ok(None),
        }
    }

    async fn list_repo(&self, tenant: &TenantId, repo: &RepoId) -> Result<Vec<ArtifactRecord>> {
        let prefix = format!("{tenant}{SEP}{repo}{SEP}");
        let mut out = Vec::new();
        for item in self.records.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            out.push(self.decode(&raw)?);
        }
        out.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(out)
    }

    async fn list_versions(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        name: &str,
    ) -> Result<Vec<ArtifactRecord>> {
        let prefix = format!("{tenant}{SEP}{repo}{SEP}{name}{SEP}");
        let mut out = Vec::new();
        for item in self.coordinates.scan_prefix(prefix.as_bytes()) {
            let (_, id) = item?;
            let id = String::from_utf8_lossy(&id).to_string();
            if let Some(record) = self.load_by_id_key(&record_key(tenant, repo, &id))? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }

    async fn delete(&self, tenant: &TenantId, repo: &RepoId, id: &str) -> Result<()> {
        let record = self.get(tenant, repo, id).await?;
        self.coordinates.remove(
            coordinate_key(tenant, repo, &record.name, &record.version).as_bytes(),
        )?;
        self.storage_keys
            .remove(storage_key_key(tenant, repo, &record.storage_key).as_bytes())?;
        self.records.remove(record_key(tenant, repo, id).as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, storage_key: &str) -> ArtifactRecord {
        ArtifactRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: TenantId::new("acme").unwrap(),
            repo: RepoId::new("releases").unwrap(),
            ecosystem: EcosystemType::Maven,
            name: name.to_string(),
            version: version.to_string(),
            size: 100,
            checksum: "c".repeat(64),
            storage_key: storage_key.to_string(),
            ecosystem_metadata: serde_json::json!({}),
            uploaded_at: Utc::now(),
            uploader: Some("tester".into()),
            storage_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn open_store() -> (tempfile::TempDir, SledMetadataStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledMetadataStore::open(tmp.path().join("meta")).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let (_tmp, store) = open_store();
        let r = record("org.example:foo", "1.0.0", "org/example/foo/1.0.0/foo-1.0.0.jar");
        let id = r.id.clone();
        store.create(r).await.unwrap();

        let tenant = TenantId::new("acme").unwrap();
        let repo = RepoId::new("releases").unwrap();
        let by_id = store.get(&tenant, &repo, &id).await.unwrap();
        assert_eq!(by_id.name, "org.example:foo");

        let by_coord = store
            .find(&tenant, &repo, "org.example:foo", "1.0.0")
            .await
            .unwrap();
        assert!(by_coord.is_some());

        let by_path = store
            .find_by_storage_key(&tenant, &repo, "org/example/foo/1.0.0/foo-1.0.0.jar")
            .await
            .unwrap();
        assert_eq!(by_path.unwrap().id, id);
    }

    #[tokio::test]
    async fn duplicate_coordinates_conflict() {
        let (_tmp, store) = open_store();
        store
            .create(record("org.example:foo", "1.0.0", "p1"))
            .await
            .unwrap();
        let err = store
            .create(record("org.example:foo", "1.0.0", "p2"))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_versions_is_scoped_to_name() {
        let (_tmp, store) = open_store();
        store.create(record("lib-a", "1.0", "a1")).await.unwrap();
        store.create(record("lib-a", "2.0", "a2")).await.unwrap();
        store.create(record("lib-b", "9.0", "b1")).await.unwrap();

        let tenant = TenantId::new("acme").unwrap();
        let repo = RepoId::new("releases").unwrap();
        let versions = store.list_versions(&tenant, &repo, "lib-a").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|r| r.name == "lib-a"));
    }

    #[tokio::test]
    async fn delete_removes_all_indexes() {
        let (_tmp, store) = open_store();
        let r = record("lib-a", "1.0", "a1");
        let id = r.id.clone();
        store.create(r).await.unwrap();

        let tenant = TenantId::new("acme").unwrap();
        let repo = RepoId::new("releases").unwrap();
        store.delete(&tenant, &repo, &id).await.unwrap();

        assert!(store.find(&tenant, &repo, "lib-a", "1.0").await.unwrap().is_none());
        assert!(store
            .find_by_storage_key(&tenant, &repo, "a1")
            .await
            .unwrap()
            .is_none());
        // A new upload of the same coordinates is allowed again.
        store.create(record("lib-a", "1.0", "a1")).await.unwrap();
    }
}
