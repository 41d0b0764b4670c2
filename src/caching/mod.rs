//! # Caching System Module
//!
//! Response and value caching for the edge layer, with three backend modes:
//! in-memory, Redis, and a hybrid of both where the memory tier is refreshed
//! from Redis on remote hits.
//!
//! ## Architecture
//! 1. **Serializer**: encodes values (JSON or binary) and compresses large payloads
//! 2. **Cache Stores**: in-memory LRU store and Redis store behind [`CacheStore`]
//! 3. **Key Generator**: deterministic keys for requests and business values
//! 4. **Cache Manager**: backend selection, metrics, failure isolation
//! 5. **TTL Policy**: static or request-frequency adaptive expiry
//! 6. **Middleware**: tower layer serving hits and storing misses
//!
//! ## Usage Example
//! ```rust,ignore
//! use edu_edge::caching::{CacheConfig, CacheManager};
//! use std::time::Duration;
//!
//! let manager = CacheManager::new(CacheConfig::default());
//! manager.set("grades:class-7", &report, Some(Duration::from_secs(300))).await;
//! let cached: Option<Report> = manager.get("grades:class-7").await;
//! ```

pub mod cache_manager;
pub mod key_generator;
pub mod middleware;
pub mod serializer;
pub mod stores;
pub mod ttl_policy;

pub use cache_manager::{
    CacheBackendType, CacheConfig, CacheManager, CacheMetrics, CacheMetricsSnapshot, CacheStats,
};
pub use key_generator::{CacheKeyBuilder, RequestKeyParts};
pub use middleware::{
    CacheLayer, CacheMiddleware, CachePolicy, CacheService, CachedResponse, CACHE_STATUS_HEADER,
};
pub use serializer::{SerializationFormat, Serializer, SerializerConfig};
pub use stores::{
    CacheEntry, CacheStore, CacheStoreStats, InMemoryCache, InMemoryCacheConfig, RedisCache,
    RedisCacheConfig,
};
pub use ttl_policy::{
    AdaptiveTtlConfig, AdaptiveTtlPolicy, PathTtlRule, StaticTtlPolicy, TtlPolicy, TtlPolicyKind,
};

use crate::core::error::EdgeError;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid cache key: {message}")]
    Key { message: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Cache operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<CacheError> for EdgeError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Timeout { timeout_ms } => EdgeError::Timeout { timeout_ms },
            CacheError::Configuration { message } => EdgeError::Configuration { message },
            other => EdgeError::Cache {
                message: other.to_string(),
            },
        }
    }
}
