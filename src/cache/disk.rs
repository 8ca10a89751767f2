//! L2: local-disk cache.
//!
//! Entries live at `{base}/{first2(sha256(key))}/{rest}/` as a `data` file
//! plus a `meta` JSON sidecar. The in-memory index and byte-usage counter
//! sit behind one mutex; disk I/O never happens under it. On startup the
//! base directory is scanned to rebuild the index, skipping anything
//! corrupt. Eviction removes least-recently-accessed entries until usage is
//! back under the cap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{now_ms, CacheEntry, CacheTier, TierStats};
use crate::error::{DepotError, Result};
use crate::storage::sha256_hex;

/// Sidecar schema. `original_key` lets the startup scan rebuild the index
/// without reversing the path hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaFile {
    integrity_hash: String,
    created_at_unix_ms: u64,
    ttl_ms: u64,
    original_key: String,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    integrity_hash: String,
    created_at_ms: u64,
    ttl_ms: u64,
    size: u64,
    last_access_ms: u64,
}

impl IndexEntry {
    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at_ms) > self.ttl_ms
    }
}

#[derive(Default)]
struct DiskIndex {
    entries: HashMap<String, IndexEntry>,
    used_bytes: u64,
}

pub struct DiskCache {
    base: PathBuf,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskCache {
    pub fn new(base: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let cache = Self {
            base,
            max_bytes,
            index: Mutex::new(DiskIndex::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        cache.scan_existing();
        Ok(cache)
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        let digest = sha256_hex(key.as_bytes());
        self.base.join(&digest[..2]).join(&digest[2..])
    }

    /// Rebuild the index from whatever survived a restart. Unreadable meta
    /// or data files mean the entry is skipped, never an error.
    fn scan_existing(&self) {
        let mut index = self.index.lock();
        let Ok(shards) = std::fs::read_dir(&self.base) else {
            return;
        };
        for shard in shards.flatten() {
            let Ok(entries) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for dir in entries.flatten() {
                let dir = dir.path();
                let Ok(raw_meta) = std::fs::read(dir.join("meta")) else {
                    continue;
                };
                let Ok(meta) = serde_json::from_slice::<MetaFile>(&raw_meta) else {
                    tracing::debug!(path = %dir.display(), "skipping corrupt cache meta");
                    continue;
                };
                let Ok(stat) = std::fs::metadata(dir.join("data")) else {
                    continue;
                };
                index.used_bytes += stat.len();
                index.entries.insert(
                    meta.original_key.clone(),
                    IndexEntry {
                        integrity_hash: meta.integrity_hash,
                        created_at_ms: meta.created_at_unix_ms,
                        ttl_ms: meta.ttl_ms,
                        size: stat.len(),
                        last_access_ms: meta.created_at_unix_ms,
                    },
                );
            }
        }
        tracing::info!(
            entries = index.entries.len(),
            used_bytes = index.used_bytes,
            "disk cache index rebuilt"
        );
    }

    async fn read(&self, key: &str, respect_ttl: bool) -> Option<CacheEntry> {
        let now = now_ms();
        let meta = {
            let mut index = self.index.lock();
            match index.entries.get_mut(key) {
                Some(entry) => {
                    entry.last_access_ms = now;
                    entry.clone()
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        if respect_ttl && meta.is_expired(now) {
            // Expired entries stay on disk for the stale-cache fallback
            // until a sweep collects them.
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let dir = self.entry_dir(key);
        let bytes = match tokio::fs::read(dir.join("data")).await {
            Ok(bytes) => bytes,
            Err(_) => {
                self.forget(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if sha256_hex(&bytes) != meta.integrity_hash {
            tracing::warn!(key, "L2 entry failed integrity check, evicting");
            self.forget(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheEntry {
            key: key.to_string(),
            bytes: Bytes::from(bytes),
            integrity_hash: meta.integrity_hash,
            created_at_ms: meta.created_at_ms,
            ttl: std::time::Duration::from_millis(meta.ttl_ms),
        })
    }

    /// Drop an entry from index and disk.
    async fn forget(&self, key: &str) {
        let removed = {
            let mut index = self.index.lock();
            index.entries.remove(key).map(|e| {
                index.used_bytes = index.used_bytes.saturating_sub(e.size);
            })
        };
        if removed.is_some() {
            let _ = tokio::fs::remove_dir_all(self.entry_dir(key)).await;
        }
    }

    /// Victims (least recently accessed first) that free at least
    /// `required` bytes. Called with the index already locked.
    fn pick_victims(index: &mut DiskIndex, required: u64, exclude: &str) -> Vec<String> {
        let mut candidates: Vec<(String, u64, u64)> = index
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != exclude)
            .map(|(k, e)| (k.clone(), e.last_access_ms, e.size))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for (key, _, size) in candidates {
            if freed >= required {
                break;
            }
            index.entries.remove(&key);
            index.used_bytes = index.used_bytes.saturating_sub(size);
            freed += size;
            victims.push(key);
        }
        victims
    }
}

#[async_trait]
impl CacheTier for DiskCache {
    fn name(&self) -> &'static str {
        "l2"
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, true).await
    }

    async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, false).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let size = entry.size();
        if size > self.max_bytes {
            return Err(DepotError::InternalIO(format!(
                "entry of {size} bytes exceeds L2 capacity"
            )));
        }

        let dir = self.entry_dir(&entry.key);
        tokio::fs::create_dir_all(&dir).await?;

        let meta = MetaFile {
            integrity_hash: entry.integrity_hash.clone(),
            created_at_unix_ms: entry.created_at_ms,
            ttl_ms: entry.ttl.as_millis() as u64,
            original_key: entry.key.clone(),
        };
        let meta_raw = serde_json::to_vec(&meta)
            .map_err(|e| DepotError::InternalIO(format!("encode cache meta: {e}")))?;

        // Write-then-rename so a reader never observes a partial entry.
        let data_tmp = dir.join("data.tmp");
        let meta_tmp = dir.join("meta.tmp");
        tokio::fs::write(&data_tmp, &entry.bytes).await?;
        tokio::fs::write(&meta_tmp, &meta_raw).await?;
        tokio::fs::rename(&data_tmp, dir.join("data")).await?;
        tokio::fs::rename(&meta_tmp, dir.join("meta")).await?;

        let victims = {
            let mut index = self.index.lock();
            if let Some(previous) = index.entries.insert(
                entry.key.clone(),
                IndexEntry {
                    integrity_hash: entry.integrity_hash,
                    created_at_ms: entry.created_at_ms,
                    ttl_ms: entry.ttl.as_millis() as u64,
                    size,
                    last_access_ms: now_ms(),
                },
            ) {
                index.used_bytes = index.used_bytes.saturating_sub(previous.size);
            }
            index.used_bytes += size;

            if index.used_bytes > self.max_bytes {
                let required = index.used_bytes - self.max_bytes;
                Self::pick_victims(&mut index, required, &entry.key)
            } else {
                Vec::new()
            }
        };

        for key in victims {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            let _ = tokio::fs::remove_dir_all(self.entry_dir(&key)).await;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.forget(key).await;
    }

    async fn cleanup(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                if let Some(e) = index.entries.remove(key) {
                    index.used_bytes = index.used_bytes.saturating_sub(e.size);
                }
            }
            keys
        };
        for key in &expired {
            let _ = tokio::fs::remove_dir_all(self.entry_dir(key)).await;
        }
        expired.len()
    }

    async fn clear(&self) {
        let keys: Vec<String> = {
            let mut index = self.index.lock();
            index.used_bytes = 0;
            index.entries.drain().map(|(k, _)| k).collect()
        };
        for key in &keys {
            let _ = tokio::fs::remove_dir_all(self.entry_dir(key)).await;
        }
    }

    fn stats(&self) -> TierStats {
        let (used, count) = {
            let index = self.index.lock();
            (index.used_bytes, index.entries.len() as u64)
        };
        TierStats {
            max_size: self.max_bytes,
            used_size: used,
            entry_count: count,
            utilization: 0.0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
        .finish()
    }
}
