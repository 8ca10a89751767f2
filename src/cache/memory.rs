//! L1: in-process byte-bounded cache.
//!
//! Backed by a weighted moka cache so total resident bytes stay under the
//! configured cap with LRU-ish (TinyLFU) eviction. Per-entry TTL is carried
//! in the stored entry and checked on every read; expired entries are
//! invalidated lazily and by the periodic sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::notification::RemovalCause;

use super::{now_ms, CacheEntry, CacheTier, TierStats};
use crate::error::Result;
use crate::storage::sha256_hex;

#[derive(Clone)]
struct StoredEntry {
    bytes: Bytes,
    integrity_hash: String,
    created_at_ms: u64,
    ttl: Duration,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        now_ms().saturating_sub(self.created_at_ms) > self.ttl.as_millis() as u64
    }
}

pub struct MemoryCache {
    cache: moka::future::Cache<String, Arc<StoredEntry>>,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl MemoryCache {
    pub fn new(max_bytes: u64) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let listener_counter = evictions.clone();
        let cache = moka::future::Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &String, value: &Arc<StoredEntry>| {
                value.bytes.len().clamp(1, u32::MAX as usize) as u32
            })
            .eviction_listener(move |_key, _value, cause| {
                if matches!(cause, RemovalCause::Size) {
                    listener_counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();
        Self {
            cache,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    async fn read(&self, key: &str, respect_ttl: bool) -> Option<CacheEntry> {
        let stored = match self.cache.get(key).await {
            Some(stored) => stored,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if respect_ttl && stored.is_expired() {
            self.cache.invalidate(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if sha256_hex(&stored.bytes) != stored.integrity_hash {
            tracing::warn!(key, "L1 entry failed integrity check, evicting");
            self.cache.invalidate(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheEntry {
            key: key.to_string(),
            bytes: stored.bytes.clone(),
            integrity_hash: stored.integrity_hash.clone(),
            created_at_ms: stored.created_at_ms,
            ttl: stored.ttl,
        })
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    fn name(&self) -> &'static str {
        "l1"
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, true).await
    }

    async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.read(key, false).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let stored = Arc::new(StoredEntry {
            bytes: entry.bytes,
            integrity_hash: entry.integrity_hash,
            created_at_ms: entry.created_at_ms,
            ttl: entry.ttl,
        });
        self.cache.insert(entry.key, stored).await;
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn cleanup(&self) -> usize {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, v)| v.is_expired())
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        for key in &expired {
            self.cache.invalidate(key).await;
        }
        expired.len()
    }

    async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    fn stats(&self) -> TierStats {
        TierStats {
            max_size: self.max_bytes,
            used_size: self.cache.weighted_size(),
            entry_count: self.cache.entry_count(),
            utilization: 0.0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
        .finish()
    }
}
