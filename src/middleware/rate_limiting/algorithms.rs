//! Rate limiting algorithms.
//!
//! All three expose the same `check(key, rule)` contract and read time
//! from a [`Clock`](crate::core::clock::Clock):
//!
//! - [`TokenBucketAlgorithm`]: capacity `burst`, refilled at
//!   `requests / window` tokens per second
//! - [`SlidingWindowAlgorithm`]: the window split into N sub-buckets
//! - [`FixedWindowAlgorithm`]: one counter per aligned window in a
//!   [`RateLimitStorage`]; up to twice the limit can pass around a window
//!   boundary
//!
//! Token bucket and sliding window state lives in process memory and is
//! updated under a per-key lock.

use super::rules::RateLimitRule;
use super::storage::RateLimitStorage;
use super::RateLimitResult;
use crate::core::clock::SharedClock;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Checks between sweeps of idle in-process state
const SWEEP_EVERY: u64 = 4096;

/// Tolerance for float drift in token arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Rate limiting algorithm types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithmType {
    TokenBucket,
    #[default]
    SlidingWindow,
    FixedWindow,
}

impl fmt::Display for RateLimitAlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => write!(f, "token_bucket"),
            Self::SlidingWindow => write!(f, "sliding_window"),
            Self::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

impl FromStr for RateLimitAlgorithmType {
    type Err = super::RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(super::RateLimitError::Configuration(format!(
                "unknown rate limit algorithm '{}'",
                other
            ))),
        }
    }
}

/// Outcome of checking one rule
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// How long until a retry can succeed; zero when allowed
    pub retry_after: Duration,
}

impl RateLimitDecision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Count one request against `rule` for `key`
    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult<RateLimitDecision>;

    /// Forget all state held for `key`
    async fn reset(&self, key: &str) -> RateLimitResult<()>;
}

/// In-process state is kept per key and per rule shape, so two rules of the
/// same scope never share a bucket
fn state_key(key: &str, rule: &RateLimitRule) -> String {
    format!("{}|{}", key, rule.shape())
}

fn owned_by(state_key: &str, key: &str) -> bool {
    state_key
        .strip_prefix(key)
        .is_some_and(|rest| rest.starts_with('|'))
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

#[derive(Debug, Clone, PartialEq)]
struct TokenBucketState {
    tokens: f64,
    last_refill: Duration,
}

/// Token bucket algorithm implementation
pub struct TokenBucketAlgorithm {
    clock: SharedClock,
    buckets: DashMap<String, TokenBucketState>,
    checks: AtomicU64,
}

impl TokenBucketAlgorithm {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            buckets: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Current tokens for a key and rule, after refilling
    pub fn tokens(&self, key: &str, rule: &RateLimitRule) -> Option<f64> {
        let now = self.clock.now();
        self.buckets.get(&state_key(key, rule)).map(|state| {
            let elapsed = now.saturating_sub(state.last_refill).as_secs_f64();
            (state.tokens + elapsed * rule.refill_rate()).min(rule.capacity() as f64)
        })
    }

    /// Drop buckets untouched for an hour
    fn sweep(&self) {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now.saturating_sub(state.last_refill) < Duration::from_secs(3600));
        debug!("Swept {} idle token buckets", before.saturating_sub(self.buckets.len()));
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketAlgorithm {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult<RateLimitDecision> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }

        let now = self.clock.now();
        let capacity = rule.capacity() as f64;
        let rate = rule.refill_rate();

        // The entry guard holds the shard lock for the whole update
        let mut state = self
            .buckets
            .entry(state_key(key, rule))
            .or_insert_with(|| TokenBucketState {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_sub(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(capacity);
        state.last_refill = now;

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Ok(RateLimitDecision::allow(
                (state.tokens + TOKEN_EPSILON).floor() as u32,
            ))
        } else if rate > 0.0 {
            Ok(RateLimitDecision::deny(secs((1.0 - state.tokens) / rate)))
        } else {
            Ok(RateLimitDecision::deny(rule.window))
        }
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.buckets.retain(|state_key, _| !owned_by(state_key, key));
        Ok(())
    }
}

/// Sliding window counter implementation
pub struct SlidingWindowAlgorithm {
    clock: SharedClock,
    sub_buckets: u32,
    /// (sub-bucket start in ms since epoch, count), oldest first
    windows: DashMap<String, VecDeque<(u64, u32)>>,
    checks: AtomicU64,
}

impl SlidingWindowAlgorithm {
    pub const DEFAULT_SUB_BUCKETS: u32 = 10;

    pub fn new(clock: SharedClock, sub_buckets: u32) -> Self {
        Self {
            clock,
            sub_buckets: sub_buckets.max(1),
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Requests currently counted for a key and rule
    pub fn count(&self, key: &str, rule: &RateLimitRule) -> u32 {
        let now = self.clock.now().as_millis() as u64;
        let window = rule.window.as_millis() as u64;
        self.windows
            .get(&state_key(key, rule))
            .map(|buckets| {
                buckets
                    .iter()
                    .filter(|(start, _)| *start + window > now)
                    .map(|(_, count)| count)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn sweep(&self) {
        let now = self.clock.now().as_millis() as u64;
        let before = self.windows.len();
        // Windows never exceed an hour in practice; anything idle that long
        // has aged out completely
        self.windows.retain(|_, buckets| {
            buckets
                .back()
                .is_some_and(|(start, _)| now.saturating_sub(*start) < 3_600_000)
        });
        debug!("Swept {} idle sliding windows", before.saturating_sub(self.windows.len()));
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowAlgorithm {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult<RateLimitDecision> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }

        let now = self.clock.now().as_millis() as u64;
        let window = (rule.window.as_millis() as u64).max(1);
        let width = (window / self.sub_buckets as u64).max(1);
        let current = now / width * width;

        let mut buckets = self.windows.entry(state_key(key, rule)).or_default();

        // A sub-bucket counts while its start lies within the trailing window
        while matches!(buckets.front(), Some((start, _)) if start + window <= now) {
            buckets.pop_front();
        }

        let used: u32 = buckets.iter().map(|(_, count)| count).sum();
        if used < rule.requests {
            match buckets.back_mut() {
                Some((start, count)) if *start == current => *count += 1,
                _ => buckets.push_back((current, 1)),
            }
            return Ok(RateLimitDecision::allow(rule.requests - used - 1));
        }

        // Wait until enough of the oldest sub-buckets have aged out
        let excess = used + 1 - rule.requests;
        let mut freed = 0;
        let mut retry_at = now + window;
        for (start, count) in buckets.iter() {
            freed += count;
            if freed >= excess {
                retry_at = start + window;
                break;
            }
        }

        Ok(RateLimitDecision::deny(Duration::from_millis(
            retry_at.saturating_sub(now),
        )))
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.windows.retain(|state_key, _| !owned_by(state_key, key));
        Ok(())
    }
}

/// Fixed window counter backed by a [`RateLimitStorage`]
pub struct FixedWindowAlgorithm {
    clock: SharedClock,
    storage: Arc<dyn RateLimitStorage>,
}

impl FixedWindowAlgorithm {
    pub fn new(clock: SharedClock, storage: Arc<dyn RateLimitStorage>) -> Self {
        Self { clock, storage }
    }

    /// `{key}:{window start}` with the start aligned to the window length
    pub fn window_key(key: &str, window_start: u64) -> String {
        format!("{}:{}", key, window_start)
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowAlgorithm {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    async fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitResult<RateLimitDecision> {
        let now = self.clock.now();
        let window = rule.window.as_secs().max(1);
        let window_start = now.as_secs() / window * window;
        let window_end = Duration::from_secs(window_start + window);

        let count = self
            .storage
            .increment(&Self::window_key(key, window_start), Duration::from_secs(window))
            .await?;

        if count <= rule.requests as u64 {
            Ok(RateLimitDecision::allow(rule.requests - count as u32))
        } else {
            Ok(RateLimitDecision::deny(window_end.saturating_sub(now)))
        }
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.storage.delete_prefix(&format!("{}:", key)).await?;
        Ok(())
    }
}
