//! Erasure-coded content blob store.
//!
//! Each artifact lives in its own directory as k+m shard files plus a
//! `metadata.json` describing sizes and checksums. The metadata file is
//! written last via temp-file + rename: its presence is the commit marker,
//! so a crash mid-upload leaves a directory that downloads treat as absent
//! and a retry can overwrite.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::erasure::ErasureCoder;
use super::sha256_hex;
use crate::error::{DepotError, Result};
use crate::replication::{ReplicationRequest, ReplicationSink};
use crate::tenant::{RepoId, TenantId};

const METADATA_FILE: &str = "metadata.json";

/// On-disk blob descriptor, serialized as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub artifact_id: String,
    pub original_size: u64,
    pub total_shards: usize,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Whole-object SHA-256 of the original bytes, lowercase hex.
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
    /// Shard index (as a string key) to SHA-256 of the shard bytes.
    pub shard_checksums: BTreeMap<String, String>,
}

/// Result of a non-reconstructing integrity sweep.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub corrupted_shards: Vec<usize>,
    pub missing_shards: Vec<usize>,
}

/// Content-addressed blob store splitting artifacts into Reed–Solomon
/// shards under a base directory.
pub struct BlobStore {
    base: PathBuf,
    coder: ErasureCoder,
    /// Writers exclusive, readers shared. Coarse by design; striping by
    /// artifact id is an allowed refinement.
    lock: RwLock<()>,
    replication: Arc<dyn ReplicationSink>,
}

fn validate_id(kind: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(DepotError::Invalid(format!("invalid {kind}: {value:?}")));
    }
    Ok(())
}

impl BlobStore {
    pub fn new(
        base: impl Into<PathBuf>,
        data_shards: usize,
        parity_shards: usize,
        replication: Arc<dyn ReplicationSink>,
    ) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            coder: ErasureCoder::new(data_shards, parity_shards)?,
            lock: RwLock::new(()),
            replication,
        })
    }

    pub fn coder(&self) -> &ErasureCoder {
        &self.coder
    }

    fn artifact_dir(&self, tenant: &TenantId, repo: &RepoId, artifact_id: &str) -> Result<PathBuf> {
        validate_id("artifact id", artifact_id)?;
        Ok(self
            .base
            .join(tenant.as_str())
            .join(repo.as_str())
            .join(artifact_id))
    }

    fn shard_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("shard-{index}.bin"))
    }

    /// Encode and persist `data` as the blob for `artifact_id`. All shards
    /// are written before `metadata.json`; any write failure removes the
    /// partial directory. On success the replication sink is notified on a
    /// detached task.
    pub async fn upload(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        artifact_id: &str,
        data: Bytes,
    ) -> Result<BlobMetadata> {
        let dir = self.artifact_dir(tenant, repo, artifact_id)?;
        let checksum = sha256_hex(&data);
        let shards = self.coder.encode(&data)?;

        let mut shard_checksums = BTreeMap::new();
        for (i, shard) in shards.iter().enumerate() {
            shard_checksums.insert(i.to_string(), sha256_hex(shard));
        }

        let metadata = BlobMetadata {
            artifact_id: artifact_id.to_string(),
            original_size: data.len() as u64,
            total_shards: self.coder.total_shards(),
            data_shards: self.coder.data_shards(),
            parity_shards: self.coder.parity_shards(),
            checksum: checksum.clone(),
            uploaded_at: Utc::now(),
            shard_checksums,
        };

        {
            let _guard = self.lock.write().await;
            if let Err(err) = self.write_all(&dir, &shards, &metadata).await {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(err);
            }
        }

        let sink = self.replication.clone();
        let request = ReplicationRequest {
            tenant: tenant.clone(),
            repo: repo.clone(),
            artifact_id: artifact_id.to_string(),
            size: data.len() as u64,
            checksum,
            payload: data,
        };
        tokio::spawn(async move {
            if let Err(err) = sink.replicate(request).await {
                tracing::warn!(error = %err, "replication callback failed");
            }
        });

        Ok(metadata)
    }

    async fn write_all(
        &self,
        dir: &Path,
        shards: &[Vec<u8>],
        metadata: &BlobMetadata,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DepotError::InternalIO(format!("create {}: {e}", dir.display())))?;
        for (i, shard) in shards.iter().enumerate() {
            let path = Self::shard_path(dir, i);
            tokio::fs::write(&path, shard)
                .await
                .map_err(|e| DepotError::InternalIO(format!("write shard {i}: {e}")))?;
        }

        let encoded = serde_json::to_vec_pretty(metadata)
            .map_err(|e| DepotError::InternalIO(format!("encode metadata: {e}")))?;
        let tmp = dir.join(".metadata.json.tmp");
        tokio::fs::write(&tmp, &encoded)
            .await
            .map_err(|e| DepotError::InternalIO(format!("write metadata: {e}")))?;
        tokio::fs::rename(&tmp, dir.join(METADATA_FILE))
            .await
            .map_err(|e| DepotError::InternalIO(format!("commit metadata: {e}")))?;
        Ok(())
    }

    async fn read_metadata(&self, dir: &Path) -> Result<BlobMetadata> {
        let raw = match tokio::fs::read(dir.join(METADATA_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DepotError::NotFound(format!(
                    "blob {} not committed",
                    dir.display()
                )))
            }
            Err(e) => return Err(DepotError::InternalIO(format!("read metadata: {e}"))),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| DepotError::InternalIO(format!("decode metadata: {e}")))
    }

    /// Read shard slots; unreadable shards come back as `None` so the
    /// decoder attempts reconstruction. A shard that reads but mismatches
    /// its recorded checksum aborts with `ShardCorruption`.
    async fn read_shards(
        &self,
        dir: &Path,
        metadata: &BlobMetadata,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let mut shards = Vec::with_capacity(metadata.total_shards);
        for i in 0..metadata.total_shards {
            match tokio::fs::read(Self::shard_path(dir, i)).await {
                Ok(bytes) => {
                    let expected = metadata.shard_checksums.get(&i.to_string());
                    match expected {
                        Some(expected) if *expected == sha256_hex(&bytes) => {
                            shards.push(Some(bytes))
                        }
                        Some(_) => return Err(DepotError::ShardCorruption { index: i }),
                        // Unrecorded shard: treat as lost rather than trust it.
                        None => shards.push(None),
                    }
                }
                Err(_) => shards.push(None),
            }
        }
        Ok(shards)
    }

    /// Reconstruct and return the original artifact bytes.
    pub async fn download(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        artifact_id: &str,
    ) -> Result<Bytes> {
        let dir = self.artifact_dir(tenant, repo, artifact_id)?;
        let _guard = self.lock.read().await;

        let metadata = self.read_metadata(&dir).await?;
        let shards = self.read_shards(&dir, &metadata).await?;
        let data = self
            .coder
            .decode(shards, metadata.original_size as usize)?;

        if sha256_hex(&data) != metadata.checksum {
            tracing::error!(
                artifact = %artifact_id,
                "whole-object checksum mismatch after reconstruction"
            );
            return Err(DepotError::IntegrityFailure(format!(
                "artifact {artifact_id} failed whole-object verification"
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Per-shard verification without reconstructing the payload.
    pub async fn verify_integrity(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        artifact_id: &str,
    ) -> Result<IntegrityReport> {
        let dir = self.artifact_dir(tenant, repo, artifact_id)?;
        let _guard = self.lock.read().await;

        let metadata = self.read_metadata(&dir).await?;
        let mut corrupted = Vec::new();
        let mut missing = Vec::new();
        for i in 0..metadata.total_shards {
            match tokio::fs::read(Self::shard_path(&dir, i)).await {
                Ok(bytes) => {
                    let expected = metadata.shard_checksums.get(&i.to_string());
                    if expected != Some(&sha256_hex(&bytes)) {
                        corrupted.push(i);
                    }
                }
                Err(_) => missing.push(i),
            }
        }
        Ok(IntegrityReport {
            valid: corrupted.is_empty() && missing.is_empty(),
            corrupted_shards: corrupted,
            missing_shards: missing,
        })
    }

    /// Remove the artifact directory. Idempotent.
    pub async fn delete(&self, tenant: &TenantId, repo: &RepoId, artifact_id: &str) -> Result<()> {
        let dir = self.artifact_dir(tenant, repo, artifact_id)?;
        let _guard = self.lock.write().await;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DepotError::InternalIO(format!("delete blob: {e}"))),
        }
    }

    /// Directory holding an artifact's shards; used by tooling and tests.
    pub fn artifact_path(
        &self,
        tenant: &TenantId,
        repo: &RepoId,
        artifact_id: &str,
    ) -> Result<PathBuf> {
        self.artifact_dir(tenant, repo, artifact_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::NoopReplication;

    fn store(dir: &Path) -> BlobStore {
        BlobStore::new(dir, 4, 2, Arc::new(NoopReplication)).unwrap()
    }

    fn ids() -> (TenantId, RepoId) {
        (
            TenantId::new("acme").unwrap(),
            RepoId::new("releases").unwrap(),
        )
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        let data = Bytes::from((0..10_000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>());

        let meta = store.upload(&tenant, &repo, "art-1", data.clone()).await.unwrap();
        assert_eq!(meta.original_size, data.len() as u64);
        assert_eq!(meta.total_shards, 6);
        assert_eq!(meta.checksum, sha256_hex(&data));

        let restored = store.download(&tenant, &repo, "art-1").await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn download_survives_m_lost_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        let data = Bytes::from(vec![9u8; 4096]);
        store.upload(&tenant, &repo, "art-2", data.clone()).await.unwrap();

        let dir = store.artifact_path(&tenant, &repo, "art-2").unwrap();
        std::fs::remove_file(dir.join("shard-0.bin")).unwrap();
        std::fs::remove_file(dir.join("shard-3.bin")).unwrap();

        let restored = store.download(&tenant, &repo, "art-2").await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn download_fails_beyond_m_lost_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        store
            .upload(&tenant, &repo, "art-3", Bytes::from(vec![1u8; 2048]))
            .await
            .unwrap();

        let dir = store.artifact_path(&tenant, &repo, "art-3").unwrap();
        for i in [0usize, 3, 5] {
            std::fs::remove_file(dir.join(format!("shard-{i}.bin"))).unwrap();
        }

        let err = store.download(&tenant, &repo, "art-3").await.unwrap_err();
        assert!(matches!(err, DepotError::InsufficientShards { .. }));
    }

    #[tokio::test]
    async fn corrupted_shard_is_reported_by_index() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        store
            .upload(&tenant, &repo, "art-4", Bytes::from(vec![5u8; 1024]))
            .await
            .unwrap();

        let dir = store.artifact_path(&tenant, &repo, "art-4").unwrap();
        std::fs::write(dir.join("shard-2.bin"), vec![0u8; 256]).unwrap();

        let err = store.download(&tenant, &repo, "art-4").await.unwrap_err();
        assert!(matches!(err, DepotError::ShardCorruption { index: 2 }));

        let report = store
            .verify_integrity(&tenant, &repo, "art-4")
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.corrupted_shards, vec![2]);
    }

    #[tokio::test]
    async fn uncommitted_directory_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();

        let dir = store.artifact_path(&tenant, &repo, "partial").unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("shard-0.bin"), b"junk").unwrap();

        let err = store.download(&tenant, &repo, "partial").await.unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        store
            .upload(&tenant, &repo, "art-5", Bytes::from_static(b"bytes"))
            .await
            .unwrap();

        store.delete(&tenant, &repo, "art-5").await.unwrap();
        store.delete(&tenant, &repo, "art-5").await.unwrap();
        assert!(matches!(
            store.download(&tenant, &repo, "art-5").await,
            Err(DepotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_traversal_in_artifact_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let (tenant, repo) = ids();
        let err = store
            .upload(&tenant, &repo, "../escape", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::Invalid(_)));
    }
}
