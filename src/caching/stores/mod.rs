//! # Cache Stores Module
//!
//! Storage backends for cached payloads. Both stores hold opaque byte
//! payloads produced by the [`Serializer`](super::Serializer); neither
//! knows anything about the values inside.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryCache, InMemoryCacheConfig};
pub use redis_store::{RedisCache, RedisCacheConfig};

use super::{CacheError, CacheResult};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Opaque cache key
    pub key: String,

    /// Serialized, optionally compressed payload
    pub value: Vec<u8>,

    /// When the entry was written
    pub created_at: Instant,

    /// When the entry stops being visible; `None` never expires
    pub expires_at: Option<Instant>,

    /// Number of reads served from this entry
    pub access_count: u64,
}

impl CacheEntry {
    /// Create a new entry; a missing or zero TTL means no expiry
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: normalize_ttl(ttl).map(|ttl| now + ttl),
            access_count: 0,
        }
    }

    /// Visible only while `now < expires_at`
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }

    /// Age of the entry
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time until expiration, `None` for entries that never expire
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Zero TTLs mean "no expiry"
pub fn normalize_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| !ttl.is_zero())
}

/// Trait for cache store implementations
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for logs and stats
    fn name(&self) -> &'static str;

    /// Get a payload; expired entries read as missing
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a payload; `None` or zero TTL never expires
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a key, reporting whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check if a live key exists
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Remove every entry owned by this store
    async fn clear(&self) -> CacheResult<()>;

    /// Number of entries currently held
    async fn size(&self) -> CacheResult<usize>;

    /// Keys matching a glob pattern (`*` and `?`)
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Store statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Cache store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    pub backend: String,
    pub entries: usize,
    pub memory_usage: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_cleanups: u64,
    pub errors: u64,
}

/// Compile a Redis-style glob (`*`, `?`) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let mut source = String::with_capacity(pattern.len() * 2 + 2);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| CacheError::Key {
        message: format!("invalid pattern '{}': {}", pattern, e),
    })
}
