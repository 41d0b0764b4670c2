//! # Rate Limiting System
//!
//! Per-scope request quotas enforced in front of the cache layer.
//!
//! ## Architecture
//! - [`rules`]: rule definitions, rule resolution per path, counter keys
//! - [`algorithms`]: token bucket, sliding window and fixed window behind
//!   the `RateLimitAlgorithm` trait
//! - [`storage`]: counter storage for the fixed window (in-memory, Redis)
//! - [`limiter`]: allow/deny lists, rule evaluation, metrics, fail-open
//! - [`layer`]: the tower layer producing 403/429 responses and
//!   `X-RateLimit-*` headers
//!
//! Every rule matching a request must pass. A failing backing store lets
//! the request through and is counted as degraded.

pub mod algorithms;
pub mod layer;
pub mod limiter;
pub mod rules;
pub mod storage;

pub use algorithms::{
    FixedWindowAlgorithm, RateLimitAlgorithm, RateLimitAlgorithmType, RateLimitDecision,
    SlidingWindowAlgorithm, TokenBucketAlgorithm,
};
pub use layer::{RateLimitLayer, RateLimitService};
pub use limiter::{
    LimitHeaders, RateLimitConfig, RateLimitMetrics, RateLimitMetricsSnapshot, RateLimitOutcome,
    RateLimiter,
};
pub use rules::{PathRuleSet, RateLimitRule, RateLimitScope, RequestIdentity, RuleEngine};
pub use storage::{InMemoryStorage, RateLimitStorage, RateLimitStorageType, RedisStorage};

use crate::core::error::EdgeError;
use thiserror::Error;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Storage timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;

impl From<RateLimitError> for EdgeError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Configuration(message) => EdgeError::Configuration { message },
            RateLimitError::Timeout { timeout_ms } => EdgeError::Timeout { timeout_ms },
            other => EdgeError::RateLimitStore {
                message: other.to_string(),
            },
        }
    }
}
