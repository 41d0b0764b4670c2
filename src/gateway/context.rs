//! # Edge Context
//!
//! Owns the shared state behind both middlewares (cache manager, rate
//! limiter, clock) and installs them on an axum [`Router`]. There is no
//! global state: everything a layer needs is built here from an
//! [`EdgeConfig`] and handed to the layer explicitly.
//!
//! Layer order, outermost first:
//!
//! ```text
//! request -> rate limit -> cache -> handler
//! ```
//!
//! so a rejected request never reaches the cache and a cache hit still
//! counts against the caller's quota.

use crate::caching::{CacheLayer, CacheManager};
use crate::core::clock::{system_clock, SharedClock};
use crate::core::config::EdgeConfig;
use crate::middleware::rate_limiting::{RateLimitLayer, RateLimiter};
use axum::Router;
use std::sync::Arc;
use tracing::info;

/// Shared edge layer state
#[derive(Clone)]
pub struct EdgeContext {
    config: EdgeConfig,
    clock: SharedClock,
    cache: Option<CacheLayer>,
    rate_limit: Option<RateLimitLayer>,
}

impl EdgeContext {
    /// Build every enabled component on the wall clock
    pub fn build(config: EdgeConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: EdgeConfig, clock: SharedClock) -> Self {
        let cache = config.cache.enabled.then(|| {
            let manager = Arc::new(CacheManager::new(config.cache.clone()));
            CacheLayer::new(manager, config.cache_policy.clone(), clock.clone())
        });

        let rate_limit = config.rate_limit.enabled.then(|| {
            let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
            RateLimitLayer::new(limiter)
        });

        info!(
            cache = cache.is_some(),
            cache_backend = %config.cache.backend,
            rate_limit = rate_limit.is_some(),
            rate_limit_algorithm = %config.rate_limit.algorithm,
            "Edge context built"
        );

        Self {
            config,
            clock,
            cache,
            rate_limit,
        }
    }

    /// Install rate limiting (outer) and caching (inner) on `router`
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        // The last layer added runs first
        let router = match &self.cache {
            Some(cache) => router.layer(cache.clone()),
            None => router,
        };
        match &self.rate_limit {
            Some(rate_limit) => router.layer(rate_limit.clone()),
            None => router,
        }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn cache(&self) -> Option<&CacheLayer> {
        self.cache.as_ref()
    }

    pub fn cache_manager(&self) -> Option<Arc<CacheManager>> {
        self.cache.as_ref().map(CacheLayer::manager)
    }

    pub fn rate_limit(&self) -> Option<&RateLimitLayer> {
        self.rate_limit.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.rate_limit.as_ref().map(RateLimitLayer::limiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_components_are_not_built() {
        let mut config = EdgeConfig::default();
        config.cache.enabled = false;
        config.rate_limit.enabled = false;

        let context = EdgeContext::build(config);
        assert!(context.cache().is_none());
        assert!(context.cache_manager().is_none());
        assert!(context.rate_limiter().is_none());
    }

    #[tokio::test]
    async fn test_default_context_builds_both_layers() {
        let context = EdgeContext::build(EdgeConfig::default());
        assert!(context.cache_manager().is_some_and(|manager| manager.is_enabled()));
        assert_eq!(
            context.rate_limiter().map(|limiter| limiter.algorithm().to_string()),
            Some("sliding_window".to_string())
        );
    }
}
