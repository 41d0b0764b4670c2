//! # edu-edge
//!
//! Response caching and rate limiting for an education platform's HTTP
//! API, packaged as tower layers for axum.
//!
//! ## Modules
//! - [`caching`]: value serializer, memory/Redis/hybrid stores, the cache
//!   manager, TTL policies and the response cache layer
//! - [`middleware::rate_limiting`]: rules, token bucket, sliding window and
//!   fixed window algorithms, and the rate limit layer
//! - [`core`]: errors, configuration, clock, request helpers
//! - [`gateway`]: [`EdgeContext`], which builds both layers from an
//!   [`EdgeConfig`] and installs them on a router
//! - [`observability`]: `tracing` subscriber setup
//!
//! ```rust,ignore
//! use edu_edge::{EdgeConfig, EdgeContext};
//!
//! let config = EdgeConfig::from_env();
//! edu_edge::observability::init_logging(&config.logging);
//! let context = EdgeContext::build(config);
//! let app = context.apply(Router::new().route("/api/lessons", get(lessons)));
//! ```

pub mod caching;
pub mod core;
pub mod gateway;
pub mod middleware;
pub mod observability;

pub use crate::caching::{CacheConfig, CacheLayer, CacheManager, CachePolicy};
pub use crate::core::{EdgeConfig, EdgeError, EdgeResult};
pub use crate::gateway::EdgeContext;
pub use crate::middleware::rate_limiting::{RateLimitConfig, RateLimitLayer, RateLimiter};
