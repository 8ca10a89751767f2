//! L3: object-store cache tier.
//!
//! The tier talks to an [`ObjectStore`] trait so deployments can bind any
//! S3/GCS/Azure-compatible client without this crate dictating a cloud SDK.
//! A filesystem-backed implementation ships for development and tests.
//! Capacity is treated as unbounded and TTL is advisory: expiry is enforced
//! on read and by the sweep, but the provider's lifecycle rules are the
//! real collector in cloud deployments.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{now_ms, CacheEntry, CacheTier, TierStats};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;

/// Minimal object-store surface the cache needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Keys under `prefix`, relative to the store root.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed object store. Keys map directly to paths; the cache
/// tier only hands it hash-derived, path-safe keys.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(DepotError::Invalid(format!("invalid object key {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn collect(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect(&path, root, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        Self::collect(&self.root, &self.root, &mut out);
        out.retain(|k| k.starts_with(prefix));
        Ok(out)
    }
}

/// Envelope stored alongside each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    integrity_hash: String,
    created_at_unix_ms: u64,
    ttl_ms: u64,
    original_key: String,
}

/// The L3 cache tier.
pub struct ObjectTier {
    store: Arc<dyn ObjectStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Local approximations; object stores do not expose cheap counts.
    entry_count: AtomicU64,
    used_bytes: AtomicU64,
}

const DATA_SUFFIX: &str = "data";
const META_SUFFIX: &str = "meta";

impl ObjectTier {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
        }
    }

    fn object_prefix(key: &str) -> String {
        let digest = sha256_hex(key.as_bytes());
        format!("cache/{}/{}", &digest[..2], &digest[2..])
    }

    async fn read(&self, key: &str, respect_ttl: bool) -> Option<CacheEntry> {
        let prefix = Self::object_prefix(key);
        let meta_raw = match self.store.get(&format!("{prefix}/{META_SUFFIX}")).await {
            Ok(Some(raw)) => raw,
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let meta: ObjectMeta = match serde_json::from_slice(&meta_raw) {
            Ok(meta) => meta,
            Err(_) => {
                self.discard(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if respect_ttl && now_ms().saturating_sub(meta.created_at_unix_ms) > meta.ttl_ms {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let bytes = match self.store.get(&format!("{prefix}/{DATA_SUFFIX}")).await {
            Ok(Some(bytes)) => bytes,
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if sha256_hex(&bytes) != meta.integrity_hash {
            tracing::warn!(key, "L3 entry failed integrity check, evicting");
            self.discard(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheEntry {
            key: key.to_string(),
            bytes,
            integrity_hash: meta.integrity_hash,
            created_at_ms: meta.created_at_unix_ms,
            ttl: std::time::Duration::from_millis(meta.ttl_ms),
        })
    }

    async fn discard(&self, key: &str) {
        let prefix = Self::object_prefix(key);
        let _ = self.store.delete(&format!("{prefix}/{DATA_SUFFIX}")).await;
        let _ = self.store.delete(&format!("{prefix}/{META_SUFFIX}")).await;
        self.entry_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
    }
}

#[async_trait]
impl CacheTier for ObjectTier {
    fn name(&self) -> &'static str {
        "l3"
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, true).await
    }

    async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, false).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let prefix = Self::object_prefix(&entry.key);
        let meta = ObjectMeta {
            integrity_hash: entry.integrity_hash.clone(),
            created_at_unix_ms: entry.created_at_ms,
            ttl_ms: entry.ttl.as_millis() as u64,
            original_key: entry.key.clone(),
        };
        let meta_raw = serde_json::to_vec(&meta)
            .map_err(|e| DepotError::InternalIO(format!("encode object meta: {e}")))?;

        let size = entry.size();
        self.store
            .put(&format!("{prefix}/{DATA_SUFFIX}"), entry.bytes)
            .await?;
        self.store
            .put(&format!("{prefix}/{META_SUFFIX}"), Bytes::from(meta_raw))
            .await?;
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.discard(key).await;
    }

    async fn cleanup(&self) -> usize {
        let now = now_ms();
        let keys = match self.store.list("cache/").await {
            Ok(keys) => keys,
            Err(_) => return 0,
        };
        let mut removed = 0usize;
        for object in keys.iter().filter(|k| k.ends_with(META_SUFFIX)) {
            let Ok(Some(raw)) = self.store.get(object).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<ObjectMeta>(&raw) else {
                continue;
            };
            if now.saturating_sub(meta.created_at_unix_ms) > meta.ttl_ms {
                self.discard(&meta.original_key).await;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        removed
    }

    async fn clear(&self) {
        if let Ok(keys) = self.store.list("cache/").await {
            for key in keys {
                let _ = self.store.delete(&key).await;
            }
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    fn stats(&self) -> TierStats {
        TierStats {
            max_size: 0,
            used_size: self.used_bytes.load(Ordering::Relaxed),
            entry_count: self.entry_count.load(Ordering::Relaxed),
            utilization: 0.0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
        .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trip_via_filesystem_store() {
        let tmp = tempfile::tempdir().unwrap();
        let tier = ObjectTier::new(Arc::new(FilesystemObjectStore::new(tmp.path()).unwrap()));

        tier.put(CacheEntry::new(
            "repo:big",
            Bytes::from(vec![9u8; 2048]),
            Duration::from_secs(60),
        ))
        .await
        .unwrap();

        let entry = tier.get("repo:big").await.unwrap();
        assert_eq!(entry.bytes.len(), 2048);
    }

    #[tokio::test]
    async fn ttl_enforced_on_read_and_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let tier = ObjectTier::new(Arc::new(FilesystemObjectStore::new(tmp.path()).unwrap()));

        tier.put(CacheEntry::new(
            "repo:old",
            Bytes::from_static(b"old"),
            Duration::from_millis(10),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(tier.get("repo:old").await.is_none());
        assert!(tier.get_stale("repo:old").await.is_some());
        assert_eq!(tier.cleanup().await, 1);
        assert!(tier.get_stale("repo:old").await.is_none());
    }

    #[tokio::test]
    async fn filesystem_store_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(tmp.path()).unwrap();
        assert!(store.get("../outside").await.is_err());
    }
}
