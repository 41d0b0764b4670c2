//! # In-Memory Cache Store
//!
//! Bounded map with an access-order side table. Expired entries are
//! removed lazily on read; an optional background sweep reclaims entries
//! that are never read again.
//!
//! Eviction scans the access table for the least recently used key, which
//! is O(n). That is fine for the configured capacities (hundreds to a few
//! thousand entries) and is the known scaling limit of this store.

use super::{glob_to_regex, normalize_ttl, CacheEntry, CacheStore, CacheStoreStats};
use crate::caching::CacheResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Background sweep interval for expired entries; `None` relies on
    /// lazy expiry only
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            cleanup_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// key -> logical access time; larger is more recent
    access: HashMap<String, u64>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        match self.access.get_mut(key) {
            Some(slot) => *slot = tick,
            None => {
                self.access.insert(key.to_string(), tick);
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.access.remove(key);
        self.entries.remove(key)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.access
            .iter()
            .min_by_key(|(_, tick)| **tick)
            .map(|(key, _)| key.clone())
    }

    fn purge_expired(&mut self, now: Instant) -> u64 {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len() as u64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
}

/// In-memory cache implementation
pub struct InMemoryCache {
    config: InMemoryCacheConfig,
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl InMemoryCache {
    /// Create a new in-memory cache.
    ///
    /// The background sweep only starts when called inside a tokio runtime.
    pub fn new(config: InMemoryCacheConfig) -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let counters = Arc::new(Counters::default());

        let cleanup_task = match (config.cleanup_interval, tokio::runtime::Handle::try_current()) {
            (Some(period), Ok(handle)) if !period.is_zero() => Some(handle.spawn(Self::sweep(
                Arc::downgrade(&inner),
                Arc::downgrade(&counters),
                period,
            ))),
            _ => None,
        };

        Self {
            config,
            inner,
            counters,
            cleanup_task,
        }
    }

    async fn sweep(inner: Weak<Mutex<Inner>>, counters: Weak<Counters>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (Some(inner), Some(counters)) = (inner.upgrade(), counters.upgrade()) else {
                break;
            };
            let removed = inner.lock().purge_expired(Instant::now());
            if removed > 0 {
                counters.expired_cleanups.fetch_add(removed, Ordering::Relaxed);
                debug!("Swept {} expired cache entries", removed);
            }
        }
    }

    pub fn config(&self) -> &InMemoryCacheConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_entries.max(1)
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            inner.remove(key);
            self.counters.expired_cleanups.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        inner.touch(key);
        let value = inner.entries.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.value.clone()
        });
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity() {
            if let Some(victim) = inner.least_recently_used() {
                inner.remove(&victim);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "Evicted least recently used cache entry");
            }
        }

        inner
            .entries
            .insert(key.to_string(), CacheEntry::new(key, value.to_vec(), normalize_ttl(ttl)));
        inner.touch(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.access.clear();
        info!("Cleared {} entries from in-memory cache", count);
        Ok(())
    }

    async fn size(&self) -> CacheResult<usize> {
        Ok(self.inner.lock().entries.len())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .values()
            .filter(|entry| !entry.is_expired() && matcher.is_match(&entry.key))
            .map(|entry| entry.key.clone())
            .collect())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let inner = self.inner.lock();
        Ok(CacheStoreStats {
            backend: self.name().to_string(),
            entries: inner.entries.len(),
            memory_usage: inner.entries.values().map(CacheEntry::size).sum(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.counters.expired_cleanups.load(Ordering::Relaxed),
            errors: 0,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }
}
