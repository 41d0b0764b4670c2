//! # Cache Manager
//!
//! One `get`/`set`/`delete`/`clear`/`get_or_set` surface over three backend
//! modes:
//!
//! - `memory`: the in-process LRU store only
//! - `redis`: the shared Redis store only
//! - `hybrid`: memory in front of Redis; a Redis hit is written back into
//!   memory with half the default TTL
//!
//! Every operation is timed into [`CacheMetrics`]. Store failures are
//! logged, counted and turned into a safe default (`None` for reads,
//! `false` for writes); they never reach the caller as errors.

use super::key_generator::CacheKeyBuilder;
use super::serializer::{Serializer, SerializerConfig};
use super::stores::{CacheStore, CacheStoreStats, InMemoryCache, InMemoryCacheConfig, RedisCache, RedisCacheConfig};
use super::CacheError;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which stores back the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendType {
    #[default]
    Memory,
    Redis,
    Hybrid,
}

impl fmt::Display for CacheBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for CacheBackendType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(CacheError::Configuration {
                message: format!("unknown cache backend '{}'", other),
            }),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; a disabled manager reads as empty and rejects writes
    pub enabled: bool,

    pub backend: CacheBackendType,

    pub redis: RedisCacheConfig,

    /// TTL used when a caller does not pass one; zero stores without expiry
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Capacity of the in-memory store
    pub max_entries: usize,

    /// Background sweep of expired in-memory entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Option<Duration>,

    /// Namespace for every key, and for the Redis keys `clear` may remove
    pub key_prefix: String,

    pub serializer: SerializerConfig,

    /// Longer keys are replaced by a digest
    pub max_key_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendType::Memory,
            redis: RedisCacheConfig::default(),
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            cleanup_interval: Some(Duration::from_secs(60)),
            key_prefix: "edu".to_string(),
            serializer: SerializerConfig::default(),
            max_key_length: 250,
        }
    }
}

/// Process-wide cache counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    operations: AtomicU64,
    latency_micros: AtomicU64,
}

impl CacheMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!("edge_cache_hits_total").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("edge_cache_misses_total").increment(1);
    }

    fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!("edge_cache_sets_total").increment(1);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        counter!("edge_cache_deletes_total").increment(1);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("edge_cache_errors_total").increment(1);
    }

    fn record_latency(&self, operation: &'static str, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        histogram!("edge_cache_operation_seconds", "operation" => operation)
            .record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let operations = self.operations.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheMetricsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            operations,
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            average_latency_ms: if operations > 0 {
                self.latency_micros.load(Ordering::Relaxed) as f64 / operations as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub operations: u64,
    pub hit_ratio: f64,
    pub average_latency_ms: f64,
}

/// Manager metrics plus per-store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: CacheBackendType,
    pub metrics: CacheMetricsSnapshot,
    pub memory: Option<CacheStoreStats>,
    pub redis: Option<CacheStoreStats>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Multi-mode cache manager
pub struct CacheManager {
    config: CacheConfig,
    backend: CacheBackendType,
    /// In-process tier
    memory: Option<Arc<dyn CacheStore>>,
    /// Shared tier
    redis: Option<Arc<dyn CacheStore>>,
    serializer: Serializer,
    keys: CacheKeyBuilder,
    metrics: Arc<CacheMetrics>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.backend)
            .field("enabled", &self.config.enabled)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl CacheManager {
    /// Build the stores for the configured backend.
    ///
    /// An unusable Redis configuration falls back to the memory store with
    /// a warning instead of failing startup.
    pub fn new(config: CacheConfig) -> Self {
        let memory_store = || -> Arc<dyn CacheStore> {
            Arc::new(InMemoryCache::new(InMemoryCacheConfig {
                max_entries: config.max_entries,
                cleanup_interval: config.cleanup_interval,
            }))
        };
        let redis_store = || -> Option<Arc<dyn CacheStore>> {
            match RedisCache::new(config.redis.clone(), config.key_prefix.clone()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, "Invalid Redis cache settings, falling back to memory cache");
                    None
                }
            }
        };

        let (memory, redis) = match config.backend {
            CacheBackendType::Memory => (Some(memory_store()), None),
            CacheBackendType::Redis => match redis_store() {
                Some(redis) => (None, Some(redis)),
                None => (Some(memory_store()), None),
            },
            CacheBackendType::Hybrid => (Some(memory_store()), redis_store()),
        };

        Self::with_stores(config, memory, redis)
    }

    /// Assemble a manager from explicit stores. Both present is hybrid mode.
    pub fn with_stores(
        config: CacheConfig,
        memory: Option<Arc<dyn CacheStore>>,
        redis: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let memory = match (memory, &redis) {
            (None, None) => {
                warn!("No cache store supplied, using an in-memory store");
                let store: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(InMemoryCacheConfig {
                    max_entries: config.max_entries,
                    cleanup_interval: config.cleanup_interval,
                }));
                Some(store)
            }
            (memory, _) => memory,
        };
        let backend = match (&memory, &redis) {
            (Some(_), Some(_)) => CacheBackendType::Hybrid,
            (None, Some(_)) => CacheBackendType::Redis,
            _ => CacheBackendType::Memory,
        };

        if backend != config.backend {
            warn!(configured = %config.backend, effective = %backend, "Cache backend differs from configuration");
        }

        let serializer = Serializer::new(config.serializer.clone());
        let keys = CacheKeyBuilder::new(config.key_prefix.clone())
            .with_suffix(serializer.format().key_suffix())
            .with_max_length(config.max_key_length);

        info!(
            backend = %backend,
            enabled = config.enabled,
            format = %serializer.format(),
            "Cache manager initialized"
        );

        Self {
            config,
            backend,
            memory,
            redis,
            serializer,
            keys,
            metrics: Arc::new(CacheMetrics::default()),
            started_at: chrono::Utc::now(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The backend actually in use
    pub fn backend(&self) -> CacheBackendType {
        self.backend
    }

    /// Key builder bound to this manager's prefix and format
    pub fn key_builder(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn usable(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        if key.is_empty() {
            warn!("Rejected empty cache key");
            self.metrics.record_error();
            return false;
        }
        true
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.config.default_ttl)
    }

    /// Get a value; misses, store failures and undecodable payloads all read
    /// as `None`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.usable(key) {
            return None;
        }

        let start = Instant::now();
        let value = match self.lookup(key).await {
            Some(bytes) => match self.serializer.try_deserialize::<T>(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "Undecodable cache entry treated as miss");
                    self.metrics.record_error();
                    None
                }
            },
            None => None,
        };

        match value {
            Some(_) => {
                debug!(key, "Cache hit");
                self.metrics.record_hit();
            }
            None => {
                debug!(key, "Cache miss");
                self.metrics.record_miss();
            }
        }
        self.metrics.record_latency("get", start.elapsed());
        value
    }

    /// Store a value; `None` uses the default TTL, a zero TTL never expires
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        if !self.usable(key) {
            return false;
        }

        let start = Instant::now();
        let stored = match self.serializer.serialize(value) {
            Ok(bytes) => self.store(key, &bytes, self.resolve_ttl(ttl)).await,
            Err(e) => {
                error!(key, error = %e, "Failed to serialize cache value");
                self.metrics.record_error();
                false
            }
        };

        if stored {
            self.metrics.record_set();
        }
        self.metrics.record_latency("set", start.elapsed());
        stored
    }

    /// Delete a key; true if any tier removed it
    pub async fn delete(&self, key: &str) -> bool {
        if !self.usable(key) {
            return false;
        }

        let start = Instant::now();
        let mut deleted = false;
        for store in self.stores() {
            match store.delete(key).await {
                Ok(removed) => deleted |= removed,
                Err(e) => self.store_error(store.name(), "delete", key, &e),
            }
        }

        if deleted {
            self.metrics.record_delete();
        }
        self.metrics.record_latency("delete", start.elapsed());
        deleted
    }

    /// True if any tier holds a live entry for `key`
    pub async fn exists(&self, key: &str) -> bool {
        if !self.usable(key) {
            return false;
        }

        let start = Instant::now();
        let mut found = false;
        for store in self.stores() {
            match store.exists(key).await {
                Ok(true) => {
                    found = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => self.store_error(store.name(), "exists", key, &e),
            }
        }
        self.metrics.record_latency("exists", start.elapsed());
        found
    }

    /// Empty every tier; true only if all of them succeeded
    pub async fn clear(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        let start = Instant::now();
        let mut cleared = true;
        for store in self.stores() {
            if let Err(e) = store.clear().await {
                self.store_error(store.name(), "clear", "*", &e);
                cleared = false;
            }
        }
        self.metrics.record_latency("clear", start.elapsed());

        if cleared {
            info!(backend = %self.backend, "Cache cleared");
        }
        cleared
    }

    /// Return the cached value, or run `producer` once and cache its
    /// non-empty result.
    ///
    /// Concurrent callers that miss on the same key each run their own
    /// producer.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, producer: F, ttl: Option<Duration>) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Some(value);
        }

        let value = producer().await?;
        if !self.set(key, &value, ttl).await {
            debug!(key, "Produced value was not cached");
        }
        Some(value)
    }

    /// Remove every entry whose key matches the glob `pattern`, returning
    /// how many distinct keys were removed
    pub async fn invalidate(&self, pattern: &str) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let start = Instant::now();
        let mut removed = HashSet::new();
        for store in self.stores() {
            let keys = match store.keys(pattern).await {
                Ok(keys) => keys,
                Err(e) => {
                    self.store_error(store.name(), "keys", pattern, &e);
                    continue;
                }
            };
            for key in keys {
                match store.delete(&key).await {
                    Ok(true) => {
                        removed.insert(key);
                    }
                    Ok(false) => {}
                    Err(e) => self.store_error(store.name(), "delete", &key, &e),
                }
            }
        }
        self.metrics.record_latency("invalidate", start.elapsed());

        info!(pattern, removed = removed.len(), "Invalidated cache entries");
        removed.len()
    }

    /// Manager metrics plus whatever statistics the stores can report
    pub async fn stats(&self) -> CacheStats {
        let memory = match &self.memory {
            Some(store) => self.store_stats(store.as_ref()).await,
            None => None,
        };
        let redis = match &self.redis {
            Some(store) => self.store_stats(store.as_ref()).await,
            None => None,
        };

        CacheStats {
            backend: self.backend,
            metrics: self.metrics.snapshot(),
            memory,
            redis,
            started_at: self.started_at,
        }
    }

    /// True when every tier answers
    pub async fn health_check(&self) -> bool {
        let mut healthy = true;
        for store in self.stores() {
            match store.health_check().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(store = store.name(), "Cache store health check failed");
                    healthy = false;
                }
                Err(e) => {
                    warn!(store = store.name(), error = %e, "Cache store health check failed");
                    healthy = false;
                }
            }
        }
        healthy
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<dyn CacheStore>> {
        self.memory.iter().chain(self.redis.iter())
    }

    async fn store_stats(&self, store: &dyn CacheStore) -> Option<CacheStoreStats> {
        match store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(store = store.name(), error = %e, "Could not read cache store stats");
                None
            }
        }
    }

    fn store_error(&self, store: &str, operation: &str, key: &str, error: &CacheError) {
        error!(store, operation, key, error = %error, "Cache store operation failed");
        self.metrics.record_error();
    }

    /// Read through the tiers, refreshing memory from Redis in hybrid mode
    async fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(memory) = &self.memory {
            match memory.get(key).await {
                Ok(Some(bytes)) => return Some(bytes),
                Ok(None) => {}
                Err(e) => self.store_error(memory.name(), "get", key, &e),
            }
        }

        let redis = self.redis.as_ref()?;
        let bytes = match redis.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                self.store_error(redis.name(), "get", key, &e);
                return None;
            }
        };

        if let Some(memory) = &self.memory {
            let refresh_ttl = self.config.default_ttl / 2;
            if let Err(e) = memory.set(key, &bytes, Some(refresh_ttl)).await {
                self.store_error(memory.name(), "refresh", key, &e);
            } else {
                debug!(key, ttl = ?refresh_ttl, "Refreshed memory tier from Redis");
            }
        }
        Some(bytes)
    }

    /// Write to every tier; succeeds only if all tiers accepted the write
    async fn store(&self, key: &str, bytes: &[u8], ttl: Duration) -> bool {
        let mut stored = true;
        for store in self.stores() {
            if let Err(e) = store.set(key, bytes, Some(ttl)).await {
                self.store_error(store.name(), "set", key, &e);
                stored = false;
            }
        }
        stored
    }
}
