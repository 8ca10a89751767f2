//! Three-tier cache: L1 in-process, L2 local disk, L3 object store.
//!
//! Tiers are ordered by decreasing speed and increasing durability. A Get
//! walks L1→L2→L3 and promotes lower-tier hits upward; a Set routes to
//! tiers by payload size. Every tier verifies an entry's integrity hash
//! before serving it; a mismatch evicts the entry at that tier and the walk
//! continues. Tier failures are logged, never surfaced, as long as at least
//! one tier can satisfy the operation.

pub mod disk;
pub mod memory;
pub mod object;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use object::{FilesystemObjectStore, ObjectStore, ObjectTier};

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::config::CacheSettings;
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One logical cached payload, identical across tiers.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub bytes: Bytes,
    /// SHA-256 of `bytes`, lowercase hex.
    pub integrity_hash: String,
    pub created_at_ms: u64,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, bytes: Bytes, ttl: Duration) -> Self {
        let integrity_hash = sha256_hex(&bytes);
        Self {
            key: key.into(),
            bytes,
            integrity_hash,
            created_at_ms: now_ms(),
            ttl,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_expired(&self) -> bool {
        now_ms().saturating_sub(self.created_at_ms) > self.ttl.as_millis() as u64
    }
}

/// Where a payload was ultimately served from. Doubles as the
/// cardinality-safe `cache-source` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Locally hosted artifact, no cache involved.
    Local,
    L1,
    L2,
    L3,
    /// Fetched from the upstream registry.
    Origin,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Local => "local",
            CacheSource::L1 => "l1",
            CacheSource::L2 => "l2",
            CacheSource::L3 => "l3",
            CacheSource::Origin => "origin",
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, CacheSource::L1 | CacheSource::L2 | CacheSource::L3)
    }
}

/// Point-in-time statistics for one tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub max_size: u64,
    pub used_size: u64,
    pub entry_count: u64,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl TierStats {
    pub(crate) fn finish(mut self) -> Self {
        self.utilization = if self.max_size > 0 {
            self.used_size as f64 / self.max_size as f64
        } else {
            0.0
        };
        self
    }
}

/// Uniform tier interface.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    /// TTL-respecting, integrity-verified read.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Integrity-verified read that ignores TTL, for stale-cache fallback.
    async fn get_stale(&self, key: &str) -> Option<CacheEntry>;

    async fn put(&self, entry: CacheEntry) -> Result<()>;

    async fn remove(&self, key: &str);

    /// Sweep expired entries; returns how many were removed.
    async fn cleanup(&self) -> usize;

    async fn clear(&self);

    fn stats(&self) -> TierStats;
}

/// The tier manager.
pub struct TieredCache {
    l1: Arc<MemoryCache>,
    l2: Arc<DiskCache>,
    l3: Option<Arc<ObjectTier>>,
    small_threshold: u64,
    medium_threshold: u64,
}

impl TieredCache {
    pub fn new(settings: &CacheSettings) -> Result<Self> {
        let l3 = match &settings.l3_path {
            Some(path) => Some(Arc::new(ObjectTier::new(Arc::new(
                FilesystemObjectStore::new(path)?,
            )))),
            None => None,
        };
        Ok(Self {
            l1: Arc::new(MemoryCache::new(settings.l1_max_bytes)),
            l2: Arc::new(DiskCache::new(&settings.l2_path, settings.l2_max_bytes)?),
            l3,
            small_threshold: settings.small_threshold,
            medium_threshold: settings.medium_threshold,
        })
    }

    /// Replace the L3 backend, e.g. with a cloud object store.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.l3 = Some(Arc::new(ObjectTier::new(store)));
        self
    }

    /// Walk the tiers; promote a lower-tier hit into every higher tier.
    /// Promotion of small entries happens inline; large entries promote on
    /// a detached task so the caller's latency is unaffected.
    pub async fn get(&self, key: &str) -> Option<(CacheEntry, CacheSource)> {
        if let Some(entry) = self.l1.get(key).await {
            return Some((entry, CacheSource::L1));
        }

        if let Some(entry) = self.l2.get(key).await {
            self.promote(entry.clone(), &[Level::L1]).await;
            return Some((entry, CacheSource::L2));
        }

        if let Some(l3) = &self.l3 {
            if let Some(entry) = l3.get(key).await {
                self.promote(entry.clone(), &[Level::L2, Level::L1]).await;
                return Some((entry, CacheSource::L3));
            }
        }

        None
    }

    /// Read past TTL. Every tier holds the same payload, so the first hit
    /// wins; the source tier is reported for metrics.
    pub async fn get_stale(&self, key: &str) -> Option<(CacheEntry, CacheSource)> {
        if let Some(entry) = self.l1.get_stale(key).await {
            return Some((entry, CacheSource::L1));
        }
        if let Some(entry) = self.l2.get_stale(key).await {
            return Some((entry, CacheSource::L2));
        }
        if let Some(l3) = &self.l3 {
            if let Some(entry) = l3.get_stale(key).await {
                return Some((entry, CacheSource::L3));
            }
        }
        None
    }

    async fn promote(&self, entry: CacheEntry, levels: &[Level]) {
        let synchronous = entry.size() < self.small_threshold;
        let l1 = self.l1.clone();
        let l2 = self.l2.clone();
        let levels = levels.to_vec();
        let task = async move {
            for level in levels {
                let result = match level {
                    Level::L1 => l1.put(entry.clone()).await,
                    Level::L2 => l2.put(entry.clone()).await,
                };
                if let Err(err) = result {
                    tracing::warn!(key = %entry.key, ?level, error = %err, "cache promotion failed");
                }
            }
        };
        if synchronous {
            task.await;
        } else {
            tokio::spawn(task);
        }
    }

    /// Admit a payload, routed by size:
    /// below the small threshold → L1 only; below the medium threshold →
    /// L1+L2; at or above it → all tiers. Per-tier failures are logged;
    /// the call fails only if no tier persisted the entry.
    pub async fn set(&self, key: &str, bytes: Bytes, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key, bytes, ttl);
        let size = entry.size();

        let mut targets: Vec<(&str, &dyn CacheTier)> = vec![("l1", self.l1.as_ref())];
        if size >= self.small_threshold {
            targets.push(("l2", self.l2.as_ref()));
        }
        if size >= self.medium_threshold {
            if let Some(l3) = &self.l3 {
                targets.push(("l3", l3.as_ref()));
            }
        }

        let results = futures::future::join_all(targets.into_iter().map(|(name, tier)| {
            let entry = entry.clone();
            async move { (name, tier.put(entry).await) }
        }))
        .await;

        let mut persisted = 0usize;
        for (name, result) in results {
            match result {
                Ok(()) => persisted += 1,
                Err(err) => {
                    tracing::warn!(key, tier = name, error = %err, "cache admission failed")
                }
            }
        }

        if persisted == 0 {
            return Err(DepotError::InternalIO(format!(
                "no cache tier accepted entry for {key}"
            )));
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) {
        self.l1.remove(key).await;
        self.l2.remove(key).await;
        if let Some(l3) = &self.l3 {
            l3.remove(key).await;
        }
    }

    /// Flush one tier (`Some`) or all tiers (`None`).
    pub async fn flush(&self, level: Option<Level3>) {
        match level {
            Some(Level3::L1) => self.l1.clear().await,
            Some(Level3::L2) => self.l2.clear().await,
            Some(Level3::L3) => {
                if let Some(l3) = &self.l3 {
                    l3.clear().await;
                }
            }
            None => {
                self.l1.clear().await;
                self.l2.clear().await;
                if let Some(l3) = &self.l3 {
                    l3.clear().await;
                }
            }
        }
    }

    /// Sweep expired entries out of every tier.
    pub async fn cleanup(&self) -> usize {
        let mut removed = self.l1.cleanup().await + self.l2.cleanup().await;
        if let Some(l3) = &self.l3 {
            removed += l3.cleanup().await;
        }
        removed
    }

    pub fn stats(&self) -> Vec<(&'static str, TierStats)> {
        let mut out = vec![
            (self.l1.name(), self.l1.stats()),
            (self.l2.name(), self.l2.stats()),
        ];
        if let Some(l3) = &self.l3 {
            out.push((l3.name(), l3.stats()));
        }
        out
    }

    /// Periodic TTL sweep, started once from the composition root.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.cleanup().await;
                if removed > 0 {
                    tracing::debug!(removed, "cache TTL sweep");
                }
            }
        })
    }
}

/// Promotion target levels (L3 never receives promotions; it is where
/// entries come from).
#[derive(Debug, Clone, Copy)]
enum Level {
    L1,
    L2,
}

/// Addressable tiers for explicit flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level3 {
    L1,
    L2,
    L3,
}

impl std::str::FromStr for Level3 {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Level3::L1),
            "l2" => Ok(Level3::L2),
            "l3" => Ok(Level3::L3),
            other => Err(DepotError::Invalid(format!("unknown cache tier {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> CacheSettings {
        CacheSettings {
            l1_max_bytes: 1024 * 1024,
            l2_max_bytes: 16 * 1024 * 1024,
            l2_path: dir.join("l2"),
            l3_path: Some(dir.join("l3")),
            default_ttl: Duration::from_secs(60),
            small_threshold: 1024,
            medium_threshold: 64 * 1024,
            cleanup_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn small_entries_stay_in_l1() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(&settings(tmp.path())).unwrap();

        cache
            .set("repo:small", Bytes::from_static(b"tiny"), Duration::from_secs(60))
            .await
            .unwrap();

        let (entry, source) = cache.get("repo:small").await.unwrap();
        assert_eq!(source, CacheSource::L1);
        assert_eq!(entry.bytes.as_ref(), b"tiny");
        // Not admitted to L2.
        assert!(cache.l2.get("repo:small").await.is_none());
    }

    #[tokio::test]
    async fn medium_entries_reach_l2_and_promote_back() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(&settings(tmp.path())).unwrap();

        let payload = Bytes::from(vec![7u8; 4096]);
        cache
            .set("repo:medium", payload.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        // Flush L1 only: the next get must resolve from L2 and repopulate L1.
        cache.flush(Some(Level3::L1)).await;
        let (entry, source) = cache.get("repo:medium").await.unwrap();
        assert_eq!(source, CacheSource::L2);
        assert_eq!(entry.bytes, payload);

        // Promotion of L2-sized entries is fire-and-forget.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_, source) = cache.get("repo:medium").await.unwrap();
        assert_eq!(source, CacheSource::L1);
    }

    #[tokio::test]
    async fn large_entries_reach_l3() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(&settings(tmp.path())).unwrap();

        let payload = Bytes::from(vec![3u8; 128 * 1024]);
        cache
            .set("repo:large", payload.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        cache.flush(Some(Level3::L1)).await;
        cache.flush(Some(Level3::L2)).await;

        let (entry, source) = cache.get("repo:large").await.unwrap();
        assert_eq!(source, CacheSource::L3);
        assert_eq!(entry.bytes, payload);
    }

    #[tokio::test]
    async fn expired_entries_miss_but_serve_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(&settings(tmp.path())).unwrap();

        let payload = Bytes::from(vec![1u8; 4096]);
        cache
            .set("repo:exp", payload.clone(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get("repo:exp").await.is_none());
        let (stale, _) = cache.get_stale("repo:exp").await.unwrap();
        assert_eq!(stale.bytes, payload);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(&settings(tmp.path())).unwrap();

        cache
            .set("repo:sweep", Bytes::from(vec![2u8; 4096]), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = cache.cleanup().await;
        assert!(removed >= 1);
        assert!(cache.get_stale("repo:sweep").await.is_none());
    }
}
