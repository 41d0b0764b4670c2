//! Rule evaluation for one request.

use super::algorithms::{
    FixedWindowAlgorithm, RateLimitAlgorithm, RateLimitAlgorithmType, SlidingWindowAlgorithm,
    TokenBucketAlgorithm,
};
use super::rules::{PathRuleSet, RateLimitRule, RateLimitScope, RequestIdentity, RuleEngine};
use super::storage::{InMemoryStorage, RateLimitStorage, RateLimitStorageType, RedisStorage};
use crate::core::clock::SharedClock;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Algorithm applied to every rule
    pub algorithm: RateLimitAlgorithmType,

    /// Rules applied to every request
    pub default_rules: Vec<RateLimitRule>,

    /// Extra rules per path prefix
    pub path_rules: Vec<PathRuleSet>,

    /// Clients that skip rate limiting entirely
    pub allow_ips: Vec<IpAddr>,

    /// Clients rejected with 403 before any rule is checked
    pub deny_ips: Vec<IpAddr>,

    /// Sub-buckets per sliding window
    pub sliding_window_buckets: u32,

    /// Counter storage for the fixed window algorithm
    pub storage: RateLimitStorageType,

    pub redis_url: Option<String>,

    /// Timeout for each storage round-trip
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: RateLimitAlgorithmType::SlidingWindow,
            default_rules: vec![RateLimitRule::new(
                100,
                Duration::from_secs(60),
                RateLimitScope::Ip,
            )],
            path_rules: Vec::new(),
            allow_ips: Vec::new(),
            deny_ips: Vec::new(),
            sliding_window_buckets: SlidingWindowAlgorithm::DEFAULT_SUB_BUCKETS,
            storage: RateLimitStorageType::Memory,
            redis_url: None,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Values for the `X-RateLimit-*` response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub window: Duration,
}

/// What the middleware should do with a request
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitOutcome {
    /// Rate limiting disabled or the client is allow-listed
    Bypassed,
    /// Client is deny-listed
    Denied { ip: IpAddr },
    /// Every rule passed; headers describe the most restrictive one
    Allowed { headers: Option<LimitHeaders> },
    /// `rule` was exhausted
    Limited {
        rule: RateLimitRule,
        retry_after: Duration,
    },
}

/// Rate limiting metrics
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    allowed: AtomicU64,
    blocked: AtomicU64,
    denied_ip: AtomicU64,
    degraded: AtomicU64,
    bypassed: AtomicU64,
}

impl RateLimitMetrics {
    pub fn snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            denied_ip: self.denied_ip.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of rate limiting metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub allowed: u64,
    pub blocked: u64,
    pub denied_ip: u64,
    pub degraded: u64,
    pub bypassed: u64,
}

/// Main rate limiter implementation
pub struct RateLimiter {
    config: RateLimitConfig,
    rules: RuleEngine,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    allow_ips: HashSet<IpAddr>,
    deny_ips: HashSet<IpAddr>,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    /// Build the configured algorithm. An unusable Redis URL falls back to
    /// in-memory counters with a warning.
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        let algorithm: Arc<dyn RateLimitAlgorithm> = match config.algorithm {
            RateLimitAlgorithmType::TokenBucket => Arc::new(TokenBucketAlgorithm::new(clock)),
            RateLimitAlgorithmType::SlidingWindow => Arc::new(SlidingWindowAlgorithm::new(
                clock,
                config.sliding_window_buckets,
            )),
            RateLimitAlgorithmType::FixedWindow => {
                let storage = Self::build_storage(&config, clock.clone());
                Arc::new(FixedWindowAlgorithm::new(clock, storage))
            }
        };

        Self::with_algorithm(config, algorithm)
    }

    /// Build around an explicit algorithm
    pub fn with_algorithm(config: RateLimitConfig, algorithm: Arc<dyn RateLimitAlgorithm>) -> Self {
        let default_rules = Self::valid_rules(&config.default_rules);
        let path_rules = config
            .path_rules
            .iter()
            .map(|set| PathRuleSet {
                prefix: set.prefix.clone(),
                rules: Self::valid_rules(&set.rules),
            })
            .collect();

        info!(
            algorithm = algorithm.name(),
            enabled = config.enabled,
            rules = config.default_rules.len(),
            path_rule_sets = config.path_rules.len(),
            "Rate limiter initialized"
        );

        Self {
            rules: RuleEngine::new(default_rules, path_rules),
            allow_ips: config.allow_ips.iter().copied().collect(),
            deny_ips: config.deny_ips.iter().copied().collect(),
            algorithm,
            config,
            metrics: RateLimitMetrics::default(),
        }
    }

    fn build_storage(config: &RateLimitConfig, clock: SharedClock) -> Arc<dyn RateLimitStorage> {
        if config.storage == RateLimitStorageType::Redis {
            match config.redis_url.as_deref() {
                Some(url) => match RedisStorage::new(url, config.store_timeout) {
                    Ok(storage) => return Arc::new(storage),
                    Err(e) => warn!(error = %e, "Invalid rate limit Redis URL, using in-memory counters"),
                },
                None => warn!("Redis rate limit storage selected without a URL, using in-memory counters"),
            }
        }
        Arc::new(InMemoryStorage::new(clock))
    }

    fn valid_rules(rules: &[RateLimitRule]) -> Vec<RateLimitRule> {
        rules
            .iter()
            .filter(|rule| match rule.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Skipping invalid rate limit rule");
                    false
                }
            })
            .cloned()
            .collect()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm.name()
    }

    /// Evaluate every applicable rule for a request
    pub async fn check(&self, identity: &RequestIdentity) -> RateLimitOutcome {
        if !self.config.enabled {
            return RateLimitOutcome::Bypassed;
        }

        if let Some(ip) = identity.ip {
            if self.deny_ips.contains(&ip) {
                self.metrics.denied_ip.fetch_add(1, Ordering::Relaxed);
                counter!("edge_rate_limit_denied_ip_total").increment(1);
                info!(ip = %ip, path = %identity.path, "Rejected deny-listed client");
                return RateLimitOutcome::Denied { ip };
            }
            if self.allow_ips.contains(&ip) {
                self.metrics.bypassed.fetch_add(1, Ordering::Relaxed);
                return RateLimitOutcome::Bypassed;
            }
        }

        let mut tightest: Option<LimitHeaders> = None;
        for rule in self.rules.rules_for(&identity.path) {
            let key = identity.key(rule.scope);
            let decision = match self.algorithm.check(&key, rule).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.metrics.degraded.fetch_add(1, Ordering::Relaxed);
                    counter!("edge_rate_limit_degraded_total").increment(1);
                    warn!(
                        key = %key,
                        scope = %rule.scope,
                        error = %e,
                        "Rate limit store unavailable, allowing request"
                    );
                    continue;
                }
            };

            if !decision.allowed {
                self.metrics.blocked.fetch_add(1, Ordering::Relaxed);
                counter!("edge_rate_limit_blocked_total", "scope" => rule.scope.as_str())
                    .increment(1);
                info!(
                    key = %key,
                    rule = %rule.display_name(),
                    retry_after = ?decision.retry_after,
                    "Rate limit exceeded"
                );
                return RateLimitOutcome::Limited {
                    rule: rule.clone(),
                    retry_after: decision.retry_after,
                };
            }

            let headers = LimitHeaders {
                limit: rule.requests,
                remaining: decision.remaining,
                window: rule.window,
            };
            let tighter = tightest.map_or(true, |current| {
                (headers.remaining, headers.limit) < (current.remaining, current.limit)
            });
            if tighter {
                tightest = Some(headers);
            }
        }

        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        counter!("edge_rate_limit_allowed_total").increment(1);
        debug!(path = %identity.path, "Request within rate limits");

        RateLimitOutcome::Allowed { headers: tightest }
    }

    /// Forget all counters for a key such as `rate_limit:user:alice`
    pub async fn reset(&self, key: &str) -> bool {
        match self.algorithm.reset(key).await {
            Ok(()) => {
                info!(key, "Rate limit state reset");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to reset rate limit state");
                false
            }
        }
    }

    pub fn metrics(&self) -> RateLimitMetricsSnapshot {
        self.metrics.snapshot()
    }
}
