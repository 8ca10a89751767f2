//! Resumable chunked uploads.
//!
//! Sessions live in a process-local map (an HA deployment substitutes a
//! shared KV with the same TTL semantics). Chunks land in temporary files
//! and may arrive in any order; every chunk except the last must equal the
//! session's chunk size exactly. Completion concatenates the chunks in
//! order, hands the payload to the blob store, records the artifact, and
//! tears the session down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DepotError, Result};
use crate::protocols::{ArtifactService, StoreArtifact};
use crate::storage::{sha256_hex, ArtifactRecord};
use crate::tenant::{EcosystemType, RepoId, TenantId};

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 128 * 1024 * 1024;
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// `POST /api/v1/artifacts/upload/initiate` body.
#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub repo: String,
    pub name: String,
    pub version: String,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UploadProgress {
    pub upload_id: String,
    pub received_chunks: u64,
    pub total_chunks: u64,
    pub complete: bool,
    pub expires_at: DateTime<Utc>,
}

struct UploadSession {
    id: String,
    tenant: TenantId,
    repo: RepoId,
    name: String,
    version: String,
    total_size: u64,
    chunk_size: u64,
    total_chunks: u64,
    /// Per-chunk SHA-256, present once the chunk has been received.
    chunks: Vec<Option<String>>,
    expires_at: DateTime<Utc>,
}

impl UploadSession {
    fn received(&self) -> u64 {
        self.chunks.iter().filter(|c| c.is_some()).count() as u64
    }

    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    fn progress(&self) -> UploadProgress {
        UploadProgress {
            upload_id: self.id.clone(),
            received_chunks: self.received(),
            total_chunks: self.total_chunks,
            complete: self.received() == self.total_chunks,
            expires_at: self.expires_at,
        }
    }

    /// Expected byte length of one chunk; only the final chunk may be
    /// short.
    fn expected_len(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.total_size - self.chunk_size * (self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }
}

type SharedSession = Arc<tokio::sync::Mutex<UploadSession>>;

pub struct ChunkedUploadManager {
    /// Session map under its own mutex; each session has a second mutex so
    /// parts of different uploads proceed in parallel.
    sessions: parking_lot::Mutex<HashMap<String, SharedSession>>,
    tmp_root: PathBuf,
    service: Arc<ArtifactService>,
}

impl ChunkedUploadManager {
    pub fn new(tmp_root: impl Into<PathBuf>, service: Arc<ArtifactService>) -> Result<Self> {
        let tmp_root = tmp_root.into();
        std::fs::create_dir_all(&tmp_root)?;
        Ok(Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            tmp_root,
            service,
        })
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.tmp_root.join(id)
    }

    fn chunk_path(&self, id: &str, index: u64) -> PathBuf {
        self.session_dir(id).join(format!("chunk-{index}.part"))
    }

    fn lookup(&self, id: &str) -> Result<SharedSession> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(format!("upload session {id}")))
    }

    async fn drop_session(&self, id: &str) {
        self.sessions.lock().remove(id);
        let _ = tokio::fs::remove_dir_all(self.session_dir(id)).await;
    }

    pub async fn initiate(
        &self,
        tenant: &TenantId,
        request: InitiateRequest,
    ) -> Result<InitiateResponse> {
        let repo = RepoId::new(&request.repo)?;
        if request.name.is_empty() || request.version.is_empty() {
            return Err(DepotError::Invalid("name and version are required".into()));
        }
        if request.total_size == 0 {
            return Err(DepotError::Invalid("total_size must be positive".into()));
        }
        let chunk_size = request.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(DepotError::Invalid(format!(
                "chunk_size must be within (0, {MAX_CHUNK_SIZE}]"
            )));
        }

        let total_chunks = request.total_size.div_ceil(chunk_size);
        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.session_dir(&id)).await?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(SESSION_TTL).expect("static ttl fits");
        let session = UploadSession {
            id: id.clone(),
            tenant: tenant.clone(),
            repo,
            name: request.name,
            version: request.version,
            total_size: request.total_size,
            chunk_size,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
            expires_at,
        };
        self.sessions
            .lock()
            .insert(id.clone(), Arc::new(tokio::sync::Mutex::new(session)));

        Ok(InitiateResponse {
            upload_id: id,
            chunk_size,
            total_chunks,
            expires_at,
        })
    }

    pub async fn upload_part(
        &self,
        tenant: &TenantId,
        id: &str,
        chunk_index: u64,
        body: Bytes,
    ) -> Result<UploadProgress> {
        let shared = self.lookup(id)?;
        let mut session = shared.lock().await;

        if session.is_expired() {
            drop(session);
            self.drop_session(id).await;
            return Err(DepotError::NotFound(format!("upload session {id} expired")));
        }
        if session.tenant != *tenant {
            return Err(DepotError::Forbidden(format!(
                "session {id} belongs to another tenant"
            )));
        }
        if chunk_index >= session.total_chunks {
            return Err(DepotError::Invalid(format!(
                "chunk {chunk_index} out of range [0, {})",
                session.total_chunks
            )));
        }
        let expected = session.expected_len(chunk_index);
        if body.len() as u64 != expected {
            return Err(DepotError::Invalid(format!(
                "chunk {chunk_index} must be {expected} bytes, got {}",
                body.len()
            )));
        }

        tokio::fs::write(self.chunk_path(id, chunk_index), &body).await?;
        session.chunks[chunk_index as usize] = Some(sha256_hex(&body));
        Ok(session.progress())
    }

    pub async fn complete(&self, tenant: &TenantId, id: &str) -> Result<ArtifactRecord> {
        let shared = self.lookup(id)?;
        let session = shared.lock().await;

        if session.is_expired() {
            drop(session);
            self.drop_session(id).await;
            return Err(DepotError::NotFound(format!("upload session {id} expired")));
        }
        if session.tenant != *tenant {
            return Err(DepotError::Forbidden(format!(
                "session {id} belongs to another tenant"
            )));
        }
        let missing: Vec<u64> = session
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u64)
            .collect();
        if !missing.is_empty() {
            return Err(DepotError::Invalid(format!(
                "upload incomplete, missing chunks {missing:?}"
            )));
        }

        let mut payload = Vec::with_capacity(session.total_size as usize);
        for index in 0..session.total_chunks {
            let bytes = tokio::fs::read(self.chunk_path(id, index)).await?;
            let recorded = session.chunks[index as usize]
                .as_deref()
                .expect("all chunks present");
            if sha256_hex(&bytes) != recorded {
                return Err(DepotError::IntegrityFailure(format!(
                    "chunk {index} changed on disk after upload"
                )));
            }
            payload.extend_from_slice(&bytes);
        }
        if payload.len() as u64 != session.total_size {
            return Err(DepotError::IntegrityFailure(format!(
                "assembled {} bytes, expected {}",
                payload.len(),
                session.total_size
            )));
        }

        let record = self
            .service
            .store(StoreArtifact {
                tenant: session.tenant.clone(),
                repo: session.repo.clone(),
                ecosystem: EcosystemType::Generic,
                name: session.name.clone(),
                version: session.version.clone(),
                storage_key: format!("artifacts/{}/{}", session.name, session.version),
                payload: Bytes::from(payload),
                ecosystem_metadata: serde_json::json!({
                    "chunked": true,
                    "chunk_size": session.chunk_size,
                    "total_chunks": session.total_chunks,
                }),
                uploader: None,
            })
            .await?;

        drop(session);
        self.drop_session(id).await;
        Ok(record)
    }

    pub async fn progress(&self, tenant: &TenantId, id: &str) -> Result<UploadProgress> {
        let shared = self.lookup(id)?;
        let session = shared.lock().await;
        if session.tenant != *tenant {
            return Err(DepotError::Forbidden(format!(
                "session {id} belongs to another tenant"
            )));
        }
        Ok(session.progress())
    }

    /// Drop expired sessions and their temp files.
    pub async fn sweep_expired(&self) -> usize {
        let candidates: Vec<(String, SharedSession)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut removed = 0;
        for (id, shared) in candidates {
            let expired = shared.lock().await.is_expired();
            if expired {
                self.drop_session(&id).await;
                removed += 1;
            }
        }
        removed
    }

    pub fn spawn_expiry_sweep(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = manager.sweep_expired().await;
                if removed > 0 {
                    tracing::info!(removed, "expired upload sessions swept");
                }
            }
        })
    }
}
