//! OCI / Docker Registry v2 protocol.
//!
//! Content addressing is the `sha256:{64 lowercase hex}` digest; any
//! mismatch between a declared and computed digest rejects the request.
//! Blobs arrive through upload sessions (monolithic PUT or chunked PATCH);
//! manifests are validated structurally and must reference blobs that
//! already exist. The per-image tag map is maintained as an index document
//! and backs `/v2/{name}/tags/list`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;

use super::{ArtifactService, IndexStore, ProtocolCapabilities, StoreArtifact};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;
use crate::tenant::{EcosystemType, RepositoryBinding};

pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
pub const API_VERSION: &str = "registry/2.0";
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

const UPLOAD_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Accepted manifest media types.
pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Media types describing multi-manifest indexes, whose references point at
/// other manifests rather than local blobs.
const INDEX_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

/// A validated `sha256:{hex}` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn parse(raw: &str) -> Result<Self> {
        let hex_part = raw.strip_prefix("sha256:").ok_or_else(|| {
            DepotError::DigestInvalid(format!("{raw:?} does not start with sha256:"))
        })?;
        if hex_part.len() != 64
            || !hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(DepotError::DigestInvalid(format!(
                "{raw:?} is not 64 lowercase hex characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("sha256:{}", sha256_hex(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `name` components: lowercase alphanumerics joined by `.`/`_`/`-`,
/// path-separated by `/`.
pub fn validate_image_name(name: &str) -> Result<()> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.starts_with(|ch: char| ch.is_ascii_lowercase() || ch.is_ascii_digit())
            && c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-'))
    };
    if name.is_empty() || name.len() > 255 || !name.split('/').all(valid_component) {
        return Err(DepotError::Invalid(format!("invalid image name {name:?}")));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    if !head_ok
        || tag.len() > 128
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(DepotError::Invalid(format!("invalid tag {tag:?}")));
    }
    Ok(())
}

/// A manifest reference: tag or digest.
#[derive(Debug, Clone)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.starts_with("sha256:") {
            Ok(Reference::Digest(Digest::parse(raw)?))
        } else {
            validate_tag(raw)?;
            Ok(Reference::Tag(raw.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

/// Structural validation; returns (media type, referenced blob digests).
fn validate_manifest(body: &[u8], content_type: Option<&str>) -> Result<(String, Vec<Digest>)> {
    let doc: ManifestDoc = serde_json::from_slice(body)
        .map_err(|e| DepotError::Invalid(format!("malformed manifest: {e}")))?;
    if doc.schema_version != 2 {
        return Err(DepotError::Invalid(format!(
            "unsupported manifest schemaVersion {}",
            doc.schema_version
        )));
    }
    let media_type = doc
        .media_type
        .or_else(|| content_type.map(|c| c.to_string()))
        .ok_or_else(|| DepotError::Invalid("manifest carries no media type".into()))?;
    if !MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) {
        return Err(DepotError::Invalid(format!(
            "unaccepted manifest media type {media_type:?}"
        )));
    }

    if INDEX_MEDIA_TYPES.contains(&media_type.as_str()) {
        return Ok((media_type, Vec::new()));
    }

    let config = doc
        .config
        .ok_or_else(|| DepotError::Invalid("image manifest has no config".into()))?;
    let mut referenced = vec![Digest::parse(&config.digest)?];
    for layer in &doc.layers {
        referenced.push(Digest::parse(&layer.digest)?);
    }
    Ok((media_type, referenced))
}

// ============================================================================
// Capabilities
// ============================================================================

pub struct OciProtocol;

impl ProtocolCapabilities for OciProtocol {
    fn ecosystem(&self) -> EcosystemType {
        EcosystemType::Oci
    }

    fn validate(&self, path: &str) -> Result<()> {
        // Repository-relative OCI paths are {name}/blobs/{digest} or
        // {name}/manifests/{reference}.
        if let Some((name, digest)) = split_marker(path, "blobs") {
            validate_image_name(name)?;
            Digest::parse(digest).map(|_| ())
        } else if let Some((name, reference)) = split_marker(path, "manifests") {
            validate_image_name(name)?;
            Reference::parse(reference).map(|_| ())
        } else {
            Err(DepotError::Invalid(format!("unexpected oci path {path:?}")))
        }
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        self.validate(path)?;
        Ok(path.trim_matches('/').to_string())
    }

    fn content_type(&self, path: &str) -> &'static str {
        if path.contains("/manifests/") {
            "application/vnd.docker.distribution.manifest.v2+json"
        } else {
            "application/octet-stream"
        }
    }

    fn requires_manifest(&self) -> bool {
        true
    }

    fn supports_versioning(&self) -> bool {
        false
    }

    fn extract_metadata(&self, path: &str, payload: &[u8]) -> Result<serde_json::Value> {
        let digest = Digest::from_bytes(payload);
        if path.contains("/manifests/") {
            let (media_type, _) = validate_manifest(payload, None)?;
            Ok(json!({ "digest": digest.as_str(), "media_type": media_type }))
        } else {
            Ok(json!({ "digest": digest.as_str() }))
        }
    }
}

/// Split `{name}/{marker}/{rest}` at the last occurrence of `marker`.
fn split_marker<'a>(path: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let needle = format!("/{marker}/");
    let idx = path.rfind(&needle)?;
    Some((&path[..idx], &path[idx + needle.len()..]))
}

// ============================================================================
// Handler
// ============================================================================

struct UploadSession {
    image: String,
    buffer: Vec<u8>,
    started: Instant,
}

/// State returned by a chunk append: byte range received so far.
pub struct UploadProgress {
    pub received: u64,
}

pub struct OciHandler {
    service: Arc<ArtifactService>,
    index: Arc<IndexStore>,
    sessions: DashMap<String, UploadSession>,
}

impl OciHandler {
    pub fn new(service: Arc<ArtifactService>, index: Arc<IndexStore>) -> Self {
        Self {
            service,
            index,
            sessions: DashMap::new(),
        }
    }

    fn blob_key(image: &str, digest: &Digest) -> String {
        format!("{image}/blobs/{digest}")
    }

    fn manifest_key(image: &str, digest: &Digest) -> String {
        format!("{image}/manifests/{digest}")
    }

    fn tags_path(binding: &RepositoryBinding, image: &str) -> String {
        format!("oci/{}/{}/{}/tags.json", binding.tenant, binding.repo, image)
    }

    fn prune_sessions(&self) {
        self.sessions
            .retain(|_, session| session.started.elapsed() < UPLOAD_SESSION_TTL);
    }

    /// `POST /v2/{name}/blobs/uploads/` → upload id for the Location header.
    pub fn start_blob_upload(&self, image: &str) -> Result<String> {
        validate_image_name(image)?;
        self.prune_sessions();
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            UploadSession {
                image: image.to_string(),
                buffer: Vec::new(),
                started: Instant::now(),
            },
        );
        Ok(id)
    }

    /// `PATCH /v2/{name}/blobs/uploads/{id}`.
    pub fn append_blob_chunk(&self, image: &str, id: &str, chunk: &[u8]) -> Result<UploadProgress> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| DepotError::NotFound(format!("upload session {id}")))?;
        if session.image != image {
            return Err(DepotError::Invalid(format!(
                "session {id} belongs to {:?}",
                session.image
            )));
        }
        session.buffer.extend_from_slice(chunk);
        Ok(UploadProgress {
            received: session.buffer.len() as u64,
        })
    }

    /// `PUT /v2/{name}/blobs/uploads/{id}?digest=...`, with an optional
    /// final body chunk. Verifies the declared digest and commits the blob.
    pub async fn complete_blob_upload(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        id: &str,
        declared: &str,
        final_chunk: &[u8],
    ) -> Result<Digest> {
        let declared = Digest::parse(declared)?;
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| DepotError::NotFound(format!("upload session {id}")))?;
        if session.image != image {
            return Err(DepotError::Invalid(format!(
                "session {id} belongs to {:?}",
                session.image
            )));
        }

        let mut payload = session.buffer;
        payload.extend_from_slice(final_chunk);
        let computed = Digest::from_bytes(&payload);
        if computed != declared {
            return Err(DepotError::DigestInvalid(format!(
                "declared {declared} but received {computed}"
            )));
        }

        self.commit_blob(binding, image, computed, Bytes::from(payload))
            .await
    }

    async fn commit_blob(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        digest: Digest,
        payload: Bytes,
    ) -> Result<Digest> {
        // Re-pushing an existing blob is a no-op.
        if self
            .service
            .metadata()
            .find_by_storage_key(&binding.tenant, &binding.repo, &Self::blob_key(image, &digest))
            .await?
            .is_some()
        {
            return Ok(digest);
        }

        self.service
            .store(StoreArtifact {
                tenant: binding.tenant.clone(),
                repo: binding.repo.clone(),
                ecosystem: EcosystemType::Oci,
                name: format!("{image}/blobs"),
                version: digest.as_str().to_string(),
                storage_key: Self::blob_key(image, &digest),
                payload,
                ecosystem_metadata: json!({ "digest": digest.as_str() }),
                uploader: None,
            })
            .await?;
        Ok(digest)
    }

    /// `GET`/`HEAD /v2/{name}/blobs/{digest}`.
    pub async fn get_blob(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        digest: &str,
    ) -> Result<(Bytes, Digest)> {
        validate_image_name(image)?;
        let digest = Digest::parse(digest)?;
        match self
            .service
            .load_by_storage_key(&binding.tenant, &binding.repo, &Self::blob_key(image, &digest))
            .await?
        {
            Some((_, bytes)) => Ok((bytes, digest)),
            None => Err(DepotError::NotFound(format!("blob {digest}"))),
        }
    }

    /// `PUT /v2/{name}/manifests/{reference}`.
    pub async fn put_manifest(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        reference: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<Digest> {
        validate_image_name(image)?;
        let reference = Reference::parse(reference)?;
        let (media_type, referenced) = validate_manifest(&body, content_type)?;

        for blob in &referenced {
            let present = self
                .service
                .metadata()
                .find_by_storage_key(&binding.tenant, &binding.repo, &Self::blob_key(image, blob))
                .await?
                .is_some();
            if !present {
                return Err(DepotError::Invalid(format!(
                    "manifest references unknown blob {blob}"
                )));
            }
        }

        let digest = Digest::from_bytes(&body);
        if let Reference::Digest(declared) = &reference {
            if *declared != digest {
                return Err(DepotError::DigestInvalid(format!(
                    "declared {declared} but received {digest}"
                )));
            }
        }

        let already_stored = self
            .service
            .metadata()
            .find_by_storage_key(
                &binding.tenant,
                &binding.repo,
                &Self::manifest_key(image, &digest),
            )
            .await?
            .is_some();
        if !already_stored {
            self.service
                .store(StoreArtifact {
                    tenant: binding.tenant.clone(),
                    repo: binding.repo.clone(),
                    ecosystem: EcosystemType::Oci,
                    name: format!("{image}/manifests"),
                    version: digest.as_str().to_string(),
                    storage_key: Self::manifest_key(image, &digest),
                    payload: body,
                    ecosystem_metadata: json!({
                        "digest": digest.as_str(),
                        "media_type": media_type,
                    }),
                    uploader: None,
                })
                .await?;
        }

        if let Reference::Tag(tag) = &reference {
            self.update_tags(binding, image, |tags| {
                tags.insert(tag.clone(), digest.as_str().to_string());
            })
            .await?;
        }
        Ok(digest)
    }

    /// `GET`/`HEAD /v2/{name}/manifests/{reference}` →
    /// (bytes, digest, media type).
    pub async fn get_manifest(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        reference: &str,
    ) -> Result<(Bytes, Digest, String)> {
        validate_image_name(image)?;
        let digest = match Reference::parse(reference)? {
            Reference::Digest(digest) => digest,
            Reference::Tag(tag) => {
                let tags = self.read_tags(binding, image).await?;
                let raw = tags.get(&tag).ok_or_else(|| {
                    DepotError::NotFound(format!("manifest {image}:{tag}"))
                })?;
                Digest::parse(raw)?
            }
        };

        match self
            .service
            .load_by_storage_key(
                &binding.tenant,
                &binding.repo,
                &Self::manifest_key(image, &digest),
            )
            .await?
        {
            Some((record, bytes)) => {
                let media_type = record
                    .ecosystem_metadata
                    .get("media_type")
                    .and_then(|m| m.as_str())
                    .unwrap_or(MANIFEST_MEDIA_TYPES[0])
                    .to_string();
                Ok((bytes, digest, media_type))
            }
            None => Err(DepotError::NotFound(format!("manifest {digest}"))),
        }
    }

    /// `DELETE /v2/{name}/manifests/{reference}`. Deleting a tag untags;
    /// deleting a digest removes the manifest and every tag pointing at it.
    pub async fn delete_manifest(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        reference: &str,
    ) -> Result<()> {
        validate_image_name(image)?;
        match Reference::parse(reference)? {
            Reference::Tag(tag) => {
                let mut removed = false;
                self.update_tags(binding, image, |tags| {
                    removed = tags.remove(&tag).is_some();
                })
                .await?;
                if removed {
                    Ok(())
                } else {
                    Err(DepotError::NotFound(format!("tag {image}:{tag}")))
                }
            }
            Reference::Digest(digest) => {
                let record = self
                    .service
                    .metadata()
                    .find_by_storage_key(
                        &binding.tenant,
                        &binding.repo,
                        &Self::manifest_key(image, &digest),
                    )
                    .await?
                    .ok_or_else(|| DepotError::NotFound(format!("manifest {digest}")))?;
                self.service.delete(&record).await?;
                self.update_tags(binding, image, |tags| {
                    tags.retain(|_, d| d != digest.as_str());
                })
                .await
            }
        }
    }

    /// `GET /v2/{name}/tags/list`.
    pub async fn list_tags(
        &self,
        binding: &RepositoryBinding,
        image: &str,
    ) -> Result<Vec<String>> {
        validate_image_name(image)?;
        let tags = self.read_tags(binding, image).await?;
        let mut out: Vec<String> = tags.into_keys().collect();
        out.sort();
        Ok(out)
    }

    async fn read_tags(
        &self,
        binding: &RepositoryBinding,
        image: &str,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        match self.index.read(&Self::tags_path(binding, image)).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| DepotError::InternalIO(format!("decode tag map: {e}"))),
            None => Ok(std::collections::BTreeMap::new()),
        }
    }

    async fn update_tags(
        &self,
        binding: &RepositoryBinding,
        image: &str,
        mutate: impl FnOnce(&mut std::collections::BTreeMap<String, String>),
    ) -> Result<()> {
        let mut tags = self.read_tags(binding, image).await?;
        mutate(&mut tags);
        let rendered = serde_json::to_vec_pretty(&tags)
            .map_err(|e| DepotError::InternalIO(format!("encode tag map: {e}")))?;
        self.index
            .write_atomic(&Self::tags_path(binding, image), &rendered)
            .await
    }
}
