//! Maven repository protocol.
//!
//! Deploy paths follow the `groupId/artifactId/version/file` layout; the
//! artifact name is `groupId:artifactId`. Every successful deploy refreshes
//! the per-(group, artifact) `maven-metadata.xml` index. Checksum sidecars
//! (`.md5`, `.sha1`, `.sha256`, `.sha512`) are generated from stored
//! checksums on download and verified against them on upload; output is
//! always bare lowercase hex.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sha1::Digest as _;

use super::{ArtifactService, IndexStore, ProtocolCapabilities, StoreArtifact};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;
use crate::tenant::{EcosystemType, RepositoryBinding};

const METADATA_DOC: &str = "maven-metadata.xml";
const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// Checksum sidecar flavors, in sidecar-extension order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "md5" => Some(Self::Md5),
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn compute(&self, data: &[u8]) -> String {
        match self {
            Self::Md5 => format!("{:x}", md5::compute(data)),
            Self::Sha1 => hex::encode(sha1::Sha1::digest(data)),
            Self::Sha256 => sha256_hex(data),
            Self::Sha512 => hex::encode(sha2::Sha512::digest(data)),
        }
    }
}

/// A parsed Maven repository path.
#[derive(Debug, Clone)]
pub enum MavenPath {
    Artifact(MavenCoordinates),
    /// `{group}/{artifact}/maven-metadata.xml`
    Metadata {
        group_path: String,
        artifact_id: String,
    },
    /// A checksum sidecar of either of the above.
    Checksum {
        target: Box<MavenPath>,
        kind: ChecksumKind,
    },
}

#[derive(Debug, Clone)]
pub struct MavenCoordinates {
    /// Dotted form, e.g. `org.example`.
    pub group_id: String,
    /// Slashed form, e.g. `org/example`.
    pub group_path: String,
    pub artifact_id: String,
    pub version: String,
    pub file_name: String,
}

impl MavenCoordinates {
    /// Artifact name in the metadata store.
    pub fn artifact_name(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parse a repository-relative Maven path.
pub fn parse_path(path: &str) -> Result<MavenPath> {
    let path = path.trim_matches('/');

    if let Some((stem, ext)) = path.rsplit_once('.') {
        if let Some(kind) = ChecksumKind::from_extension(ext) {
            return Ok(MavenPath::Checksum {
                target: Box::new(parse_path(stem)?),
                kind,
            });
        }
    }

    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| !valid_segment(s)) {
        return Err(DepotError::Invalid(format!("invalid maven path {path:?}")));
    }

    let file_name = *segments
        .last()
        .ok_or_else(|| DepotError::Invalid("empty maven path".into()))?;

    if file_name == METADATA_DOC {
        if segments.len() < 3 {
            return Err(DepotError::Invalid(format!(
                "metadata path {path:?} needs at least group/artifact"
            )));
        }
        return Ok(MavenPath::Metadata {
            group_path: segments[..segments.len() - 2].join("/"),
            artifact_id: segments[segments.len() - 2].to_string(),
        });
    }

    if segments.len() < 4 {
        return Err(DepotError::Invalid(format!(
            "artifact path {path:?} needs group/artifact/version/file"
        )));
    }
    let version = segments[segments.len() - 2];
    let artifact_id = segments[segments.len() - 3];
    let group_segments = &segments[..segments.len() - 3];

    let coordinates = MavenCoordinates {
        group_id: group_segments.join("."),
        group_path: group_segments.join("/"),
        artifact_id: artifact_id.to_string(),
        version: version.to_string(),
        file_name: file_name.to_string(),
    };

    if !coordinates
        .file_name
        .starts_with(&format!("{artifact_id}-{version}"))
    {
        return Err(DepotError::Invalid(format!(
            "file {file_name:?} does not match artifact {artifact_id:?} version {version:?}"
        )));
    }
    Ok(MavenPath::Artifact(coordinates))
}

/// Maven version ordering: dot/dash tokens compare numerically when both
/// sides are numeric, lexicographically otherwise; missing tokens count as
/// zero. Not full Maven `ComparableVersion`, but stable for release lines.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let tokens = |v: &str| -> Vec<String> {
        v.split(['.', '-']).map(|t| t.to_string()).collect()
    };
    let (ta, tb) = (tokens(a), tokens(b));
    for i in 0..ta.len().max(tb.len()) {
        let xa = ta.get(i).map(String::as_str).unwrap_or("0");
        let xb = tb.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (xa.parse::<u64>(), xb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => xa.cmp(xb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn is_snapshot(version: &str) -> bool {
    version.ends_with(SNAPSHOT_SUFFIX)
}

// ============================================================================
// maven-metadata.xml rendering
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename = "metadata")]
struct MetadataDoc {
    #[serde(rename = "groupId")]
    group_id: String,
    #[serde(rename = "artifactId")]
    artifact_id: String,
    versioning: VersioningDoc,
}

#[derive(Debug, Serialize)]
struct VersioningDoc {
    latest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    release: Option<String>,
    versions: VersionsDoc,
    #[serde(rename = "lastUpdated")]
    last_updated: String,
}

#[derive(Debug, Serialize)]
struct VersionsDoc {
    version: Vec<String>,
}

fn render_metadata(group_id: &str, artifact_id: &str, mut versions: Vec<String>) -> Result<String> {
    versions.sort_by(|a, b| compare_versions(a, b));
    let latest = versions
        .last()
        .cloned()
        .ok_or_else(|| DepotError::NotFound(format!("no versions of {group_id}:{artifact_id}")))?;
    let release = versions.iter().rev().find(|v| !is_snapshot(v)).cloned();

    let doc = MetadataDoc {
        group_id: group_id.to_string(),
        artifact_id: artifact_id.to_string(),
        versioning: VersioningDoc {
            latest,
            release,
            versions: VersionsDoc { version: versions },
            last_updated: Utc::now().format("%Y%m%d%H%M%S").to_string(),
        },
    };
    let body = quick_xml::se::to_string(&doc)
        .map_err(|e| DepotError::InternalIO(format!("render maven metadata: {e}")))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}"))
}

// ============================================================================
// Capabilities
// ============================================================================

/// Stateless Maven capability set.
pub struct MavenProtocol;

impl ProtocolCapabilities for MavenProtocol {
    fn ecosystem(&self) -> EcosystemType {
        EcosystemType::Maven
    }

    fn validate(&self, path: &str) -> Result<()> {
        parse_path(path).map(|_| ())
    }

    fn storage_key(&self, path: &str) -> Result<String> {
        parse_path(path)?;
        Ok(path.trim_matches('/').to_string())
    }

    fn content_type(&self, path: &str) -> &'static str {
        match path.rsplit_once('.').map(|(_, ext)| ext) {
            Some("jar" | "war" | "ear") => "application/java-archive",
            Some("pom" | "xml") => "text/xml",
            Some("md5" | "sha1" | "sha256" | "sha512") => "text/plain",
            _ => "application/octet-stream",
        }
    }

    fn requires_manifest(&self) -> bool {
        false
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn extract_metadata(&self, path: &str, payload: &[u8]) -> Result<serde_json::Value> {
        let MavenPath::Artifact(coordinates) = parse_path(path)? else {
            return Err(DepotError::Invalid(format!(
                "{path:?} is not an artifact path"
            )));
        };
        Ok(serde_json::json!({
            "group_id": coordinates.group_id,
            "artifact_id": coordinates.artifact_id,
            "version": coordinates.version,
            "file_name": coordinates.file_name,
            "checksums": {
                "md5": ChecksumKind::Md5.compute(payload),
                "sha1": ChecksumKind::Sha1.compute(payload),
                "sha256": ChecksumKind::Sha256.compute(payload),
                "sha512": ChecksumKind::Sha512.compute(payload),
            },
        }))
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct MavenHandler {
    service: Arc<ArtifactService>,
    index: Arc<IndexStore>,
}

impl MavenHandler {
    pub fn new(service: Arc<ArtifactService>, index: Arc<IndexStore>) -> Self {
        Self { service, index }
    }

    fn index_path(binding: &RepositoryBinding, group_path: &str, artifact_id: &str) -> String {
        format!(
            "maven/{}/{}/{}/{}/{}",
            binding.tenant, binding.repo, group_path, artifact_id, METADATA_DOC
        )
    }

    /// `PUT /maven2/{path}`.
    pub async fn deploy(
        &self,
        binding: &RepositoryBinding,
        path: &str,
        body: Bytes,
        uploader: Option<String>,
    ) -> Result<()> {
        match parse_path(path)? {
            MavenPath::Artifact(coordinates) => {
                self.deploy_artifact(binding, path, coordinates, body, uploader)
                    .await
            }
            // Clients push their own metadata after deploying; the index is
            // regenerated server-side, so the upload is accepted and dropped.
            MavenPath::Metadata { .. } => Ok(()),
            MavenPath::Checksum { target, kind } => {
                self.verify_uploaded_checksum(binding, &target, kind, &body)
                    .await
            }
        }
    }

    async fn deploy_artifact(
        &self,
        binding: &RepositoryBinding,
        path: &str,
        coordinates: MavenCoordinates,
        body: Bytes,
        uploader: Option<String>,
    ) -> Result<()> {
        let metadata = MavenProtocol.extract_metadata(path, &body)?;
        self.service
            .store(StoreArtifact {
                tenant: binding.tenant.clone(),
                repo: binding.repo.clone(),
                ecosystem: EcosystemType::Maven,
                name: coordinates.artifact_name(),
                // One record per file: jar, pom, and classified artifacts
                // of a version coexist under the artifact name.
                version: format!("{}+{}", coordinates.version, coordinates.file_name),
                storage_key: path.trim_matches('/').to_string(),
                payload: body,
                ecosystem_metadata: metadata,
                uploader,
            })
            .await?;
        self.refresh_metadata(binding, &coordinates).await
    }

    /// Uploaded sidecars are verified against the stored artifact's
    /// checksums; upper- and lowercase hex are both accepted.
    async fn verify_uploaded_checksum(
        &self,
        binding: &RepositoryBinding,
        target: &MavenPath,
        kind: ChecksumKind,
        body: &[u8],
    ) -> Result<()> {
        // Sidecars for server-generated metadata are accepted as-is.
        let MavenPath::Artifact(_) = target else {
            return Ok(());
        };
        let expected = self
            .stored_checksum(binding, target, kind)
            .await?
            .ok_or_else(|| {
                DepotError::NotFound("checksum uploaded for unknown artifact".into())
            })?;

        let presented = String::from_utf8_lossy(body);
        let presented = presented.split_whitespace().next().unwrap_or_default();
        if presented.eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            Err(DepotError::Invalid(format!(
                "{} checksum mismatch: expected {expected}",
                kind.key()
            )))
        }
    }

    async fn stored_checksum(
        &self,
        binding: &RepositoryBinding,
        target: &MavenPath,
        kind: ChecksumKind,
    ) -> Result<Option<String>> {
        let MavenPath::Artifact(coordinates) = target else {
            return Ok(None);
        };
        let storage_key = format!(
            "{}/{}/{}/{}",
            coordinates.group_path,
            coordinates.artifact_id,
            coordinates.version,
            coordinates.file_name
        );
        let record = self
            .service
            .metadata()
            .find_by_storage_key(&binding.tenant, &binding.repo, &storage_key)
            .await?;
        Ok(record.and_then(|r| {
            r.ecosystem_metadata
                .get("checksums")
                .and_then(|c| c.get(kind.key()))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        }))
    }

    /// `GET`/`HEAD /maven2/{path}` for hosted repositories.
    pub async fn retrieve(
        &self,
        binding: &RepositoryBinding,
        path: &str,
    ) -> Result<(Bytes, &'static str)> {
        let content_type = MavenProtocol.content_type(path);
        match parse_path(path)? {
            MavenPath::Artifact(_) => {
                let key = path.trim_matches('/');
                match self
                    .service
                    .load_by_storage_key(&binding.tenant, &binding.repo, key)
                    .await?
                {
                    Some((_, bytes)) => Ok((bytes, content_type)),
                    None => Err(DepotError::NotFound(format!("no artifact at {path}"))),
                }
            }
            MavenPath::Metadata {
                group_path,
                artifact_id,
            } => {
                let doc = self
                    .index
                    .read(&Self::index_path(binding, &group_path, &artifact_id))
                    .await?
                    .ok_or_else(|| {
                        DepotError::NotFound(format!("no metadata for {group_path}/{artifact_id}"))
                    })?;
                Ok((doc, "text/xml"))
            }
            MavenPath::Checksum { target, kind } => match *target {
                MavenPath::Artifact(_) => {
                    let checksum = self
                        .stored_checksum(binding, &target, kind)
                        .await?
                        .ok_or_else(|| DepotError::NotFound(format!("no artifact at {path}")))?;
                    Ok((Bytes::from(checksum), "text/plain"))
                }
                MavenPath::Metadata {
                    ref group_path,
                    ref artifact_id,
                } => {
                    let doc = self
                        .index
                        .read(&Self::index_path(binding, group_path, artifact_id))
                        .await?
                        .ok_or_else(|| {
                            DepotError::NotFound(format!(
                                "no metadata for {group_path}/{artifact_id}"
                            ))
                        })?;
                    Ok((Bytes::from(kind.compute(&doc)), "text/plain"))
                }
                MavenPath::Checksum { .. } => {
                    Err(DepotError::Invalid("nested checksum extension".into()))
                }
            },
        }
    }

    /// Regenerate the `maven-metadata.xml` index for one (group, artifact).
    async fn refresh_metadata(
        &self,
        binding: &RepositoryBinding,
        coordinates: &MavenCoordinates,
    ) -> Result<()> {
        let records = self
            .service
            .metadata()
            .list_versions(&binding.tenant, &binding.repo, &coordinates.artifact_name())
            .await?;
        // Stored versions are `{version}+{file}`; the index wants each
        // version once.
        let mut versions: Vec<String> = records
            .into_iter()
            .filter_map(|r| r.version.split_once('+').map(|(v, _)| v.to_string()))
            .collect();
        versions.sort();
        versions.dedup();
        let xml = render_metadata(&coordinates.group_id, &coordinates.artifact_id, versions)?;
        self.index
            .write_atomic(
                &Self::index_path(binding, &coordinates.group_path, &coordinates.artifact_id),
                xml.as_bytes(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testutil::fixture;
    use crate::tenant::RepositoryMode;

    fn binding(fx: &crate::protocols::testutil::Fixture) -> RepositoryBinding {
        RepositoryBinding {
            tenant: fx.tenant.clone(),
            repo: fx.repo.clone(),
            ecosystem: EcosystemType::Maven,
            mode: RepositoryMode::Hosted,
            upstream: None,
            backup_upstreams: Vec::new(),
            cache_ttl_secs: None,
        }
    }

    #[test]
    fn parses_artifact_paths() {
        let parsed = parse_path("org/example/foo/1.2.3/foo-1.2.3.jar").unwrap();
        let MavenPath::Artifact(c) = parsed else {
            panic!("expected artifact");
        };
        assert_eq!(c.group_id, "org.example");
        assert_eq!(c.artifact_id, "foo");
        assert_eq!(c.version, "1.2.3");
        assert_eq!(c.artifact_name(), "org.example:foo");
    }

    #[test]
    fn parses_metadata_and_checksum_paths() {
        assert!(matches!(
            parse_path("org/example/foo/maven-metadata.xml").unwrap(),
            MavenPath::Metadata { .. }
        ));
        let MavenPath::Checksum { target, kind } =
            parse_path("org/example/foo/1.0/foo-1.0.jar.sha1").unwrap()
        else {
            panic!("expected checksum");
        };
        assert_eq!(kind, ChecksumKind::Sha1);
        assert!(matches!(*target, MavenPath::Artifact(_)));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_path("foo.jar").is_err());
        assert!(parse_path("org/../../etc/passwd/1.0/x-1.0.jar").is_err());
        assert!(parse_path("org/example/foo/1.0/bar-2.0.jar").is_err());
    }

    #[test]
    fn version_ordering_is_numeric_per_segment() {
        assert_eq!(compare_versions("1.2.10", "1.2.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.10", "1.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0-SNAPSHOT", "1.0"), Ordering::Less);
    }

    #[tokio::test]
    async fn deploy_and_retrieve_round_trip() {
        let fx = fixture();
        let handler = MavenHandler::new(fx.service.clone(), fx.index.clone());
        let binding = binding(&fx);
        let body = Bytes::from(vec![0xABu8; 4096]);

        handler
            .deploy(
                &binding,
                "org/example/foo/1.2.3/foo-1.2.3.jar",
                body.clone(),
                Some("ci".into()),
            )
            .await
            .unwrap();

        let (bytes, content_type) = handler
            .retrieve(&binding, "org/example/foo/1.2.3/foo-1.2.3.jar")
            .await
            .unwrap();
        assert_eq!(bytes, body);
        assert_eq!(content_type, "application/java-archive");

        // Sidecar is the bare lowercase SHA-1 of the payload.
        let (sha1, _) = handler
            .retrieve(&binding, "org/example/foo/1.2.3/foo-1.2.3.jar.sha1")
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&sha1),
            ChecksumKind::Sha1.compute(&body)
        );
    }

    #[tokio::test]
    async fn metadata_tracks_versions_latest_and_release() {
        let fx = fixture();
        let handler = MavenHandler::new(fx.service.clone(), fx.index.clone());
        let binding = binding(&fx);

        for version in ["1.0.0", "1.2.0", "2.0.0-SNAPSHOT"] {
            handler
                .deploy(
                    &binding,
                    &format!("org/example/foo/{version}/foo-{version}.jar"),
                    Bytes::from_static(b"jar"),
                    None,
                )
                .await
                .unwrap();
        }

        let (doc, _) = handler
            .retrieve(&binding, "org/example/foo/maven-metadata.xml")
            .await
            .unwrap();
        let xml = String::from_utf8_lossy(&doc);
        assert!(xml.contains("<version>1.0.0</version>"));
        assert!(xml.contains("<version>1.2.0</version>"));
        assert!(xml.contains("<version>2.0.0-SNAPSHOT</version>"));
        assert!(xml.contains("<latest>2.0.0-SNAPSHOT</latest>"));
        assert!(xml.contains("<release>1.2.0</release>"));
        assert!(xml.contains("<lastUpdated>"));
    }

    #[tokio::test]
    async fn jar_and_pom_of_one_version_coexist() {
        let fx = fixture();
        let handler = MavenHandler::new(fx.service.clone(), fx.index.clone());
        let binding = binding(&fx);

        handler
            .deploy(&binding, "org/x/lib/1.0/lib-1.0.jar", Bytes::from_static(b"jar"), None)
            .await
            .unwrap();
        handler
            .deploy(
                &binding,
                "org/x/lib/1.0/lib-1.0.pom",
                Bytes::from_static(b"<project/>"),
                None,
            )
            .await
            .unwrap();

        let (jar, _) = handler.retrieve(&binding, "org/x/lib/1.0/lib-1.0.jar").await.unwrap();
        let (pom, _) = handler.retrieve(&binding, "org/x/lib/1.0/lib-1.0.pom").await.unwrap();
        assert_eq!(jar.as_ref(), b"jar");
        assert_eq!(pom.as_ref(), b"<project/>");

        // The version appears once in the index despite two files.
        let (doc, _) = handler
            .retrieve(&binding, "org/x/lib/maven-metadata.xml")
            .await
            .unwrap();
        let xml = String::from_utf8_lossy(&doc);
        assert_eq!(xml.matches("<version>1.0</version>").count(), 1);
    }

    #[tokio::test]
    async fn uploaded_checksums_are_verified() {
        let fx = fixture();
        let handler = MavenHandler::new(fx.service.clone(), fx.index.clone());
        let binding = binding(&fx);
        let body = Bytes::from_static(b"artifact bytes");

        handler
            .deploy(&binding, "org/x/lib/1.0/lib-1.0.jar", body.clone(), None)
            .await
            .unwrap();

        // Uppercase hex is accepted on input.
        let sha1_upper = ChecksumKind::Sha1.compute(&body).to_uppercase();
        handler
            .deploy(
                &binding,
                "org/x/lib/1.0/lib-1.0.jar.sha1",
                Bytes::from(sha1_upper),
                None,
            )
            .await
            .unwrap();

        let err = handler
            .deploy(
                &binding,
                "org/x/lib/1.0/lib-1.0.jar.md5",
                Bytes::from_static(b"00000000000000000000000000000000"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::Invalid(_)));
    }
}
