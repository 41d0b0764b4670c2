//! TTL strategies for cached responses.
//!
//! The middleware asks a [`TtlPolicy`] how long to keep each stored
//! response. The static policy uses the response's own `max-age` or a
//! path heuristic; the adaptive policy scales that result by how often the
//! path was requested over the last hour.

use crate::core::clock::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Which TTL policy the cache middleware runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlPolicyKind {
    #[default]
    Static,
    Adaptive,
}

impl FromStr for TtlPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "adaptive" | "smart" => Ok(Self::Adaptive),
            other => Err(format!("unknown ttl policy '{}'", other)),
        }
    }
}

/// Path heuristic: paths containing `pattern` get `ttl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathTtlRule {
    pub pattern: String,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl PathTtlRule {
    pub fn new(pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            ttl,
        }
    }
}

/// Default heuristics: aggregate views change slowly, list views quickly
pub fn default_path_rules() -> Vec<PathTtlRule> {
    vec![
        PathTtlRule::new("statistics", Duration::from_secs(1800)),
        PathTtlRule::new("analytics", Duration::from_secs(1800)),
        PathTtlRule::new("list", Duration::from_secs(60)),
    ]
}

/// Strategy deciding how long a stored response lives
pub trait TtlPolicy: Send + Sync + fmt::Debug {
    /// Observe a request for `path`; called for every cacheable request
    fn record_request(&self, _path: &str) {}

    /// TTL for a response to `path`, given the response's own `max-age`
    fn ttl_for(&self, path: &str, max_age: Option<Duration>) -> Duration;
}

/// `max-age` capped by the default TTL, else the first matching path rule,
/// else the default TTL
#[derive(Debug, Clone)]
pub struct StaticTtlPolicy {
    default_ttl: Duration,
    path_rules: Vec<PathTtlRule>,
}

impl StaticTtlPolicy {
    pub fn new(default_ttl: Duration, path_rules: Vec<PathTtlRule>) -> Self {
        Self {
            default_ttl,
            path_rules,
        }
    }
}

impl TtlPolicy for StaticTtlPolicy {
    fn ttl_for(&self, path: &str, max_age: Option<Duration>) -> Duration {
        if let Some(max_age) = max_age {
            if self.default_ttl.is_zero() {
                return max_age;
            }
            return max_age.min(self.default_ttl);
        }

        self.path_rules
            .iter()
            .find(|rule| path.contains(&rule.pattern))
            .map(|rule| rule.ttl)
            .unwrap_or(self.default_ttl)
    }
}

/// Thresholds for the adaptive policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTtlConfig {
    /// Requests per window at or above which a path counts as hot
    pub high_frequency: u64,
    /// Requests per window at or below which a path counts as cold
    pub low_frequency: u64,
    pub high_multiplier: f64,
    pub low_multiplier: f64,
    /// Upper bound on any adapted TTL
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Length of the frequency window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            high_frequency: 100,
            low_frequency: 10,
            high_multiplier: 2.0,
            low_multiplier: 0.5,
            max_ttl: Duration::from_secs(3600),
            window: Duration::from_secs(3600),
        }
    }
}

const FREQUENCY_BUCKETS: u64 = 60;

/// Scales the static TTL by per-path request frequency
#[derive(Debug)]
pub struct AdaptiveTtlPolicy {
    base: StaticTtlPolicy,
    config: AdaptiveTtlConfig,
    clock: SharedClock,
    /// path -> (bucket start in seconds, requests in bucket), oldest first
    frequency: Mutex<HashMap<String, VecDeque<(u64, u64)>>>,
    /// Seconds at which idle paths were last dropped
    last_sweep: AtomicU64,
}

impl AdaptiveTtlPolicy {
    pub fn new(base: StaticTtlPolicy, config: AdaptiveTtlConfig, clock: SharedClock) -> Self {
        Self {
            base,
            config,
            clock,
            frequency: Mutex::new(HashMap::new()),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Number of paths currently tracked
    pub fn tracked_paths(&self) -> usize {
        self.frequency.lock().len()
    }

    fn bucket_width(&self) -> u64 {
        (self.config.window.as_secs() / FREQUENCY_BUCKETS).max(1)
    }

    fn window_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.window.as_secs())
    }

    /// Requests observed for `path` in the trailing window
    pub fn frequency(&self, path: &str) -> u64 {
        let now = self.clock.now().as_secs();
        let start = self.window_start(now);
        self.frequency
            .lock()
            .get(path)
            .map(|buckets| {
                buckets
                    .iter()
                    .filter(|(bucket, _)| *bucket >= start)
                    .map(|(_, count)| count)
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl TtlPolicy for AdaptiveTtlPolicy {
    fn record_request(&self, path: &str) {
        let now = self.clock.now().as_secs();
        let width = self.bucket_width();
        let bucket = now / width * width;
        let start = self.window_start(now);

        let mut frequency = self.frequency.lock();

        // At most once per bucket width, forget paths with nothing left in the window
        if now >= self.last_sweep.load(Ordering::Relaxed) + width {
            let before = frequency.len();
            frequency.retain(|_, buckets| {
                buckets.back().is_some_and(|(newest, _)| *newest >= start)
            });
            self.last_sweep.store(now, Ordering::Relaxed);
            let dropped = before - frequency.len();
            if dropped > 0 {
                debug!(dropped, "Dropped idle paths from TTL frequency table");
            }
        }

        let buckets = frequency.entry(path.to_string()).or_default();
        while matches!(buckets.front(), Some((oldest, _)) if *oldest < start) {
            buckets.pop_front();
        }
        match buckets.back_mut() {
            Some((last, count)) if *last == bucket => *count += 1,
            _ => buckets.push_back((bucket, 1)),
        }
    }

    fn ttl_for(&self, path: &str, max_age: Option<Duration>) -> Duration {
        let base = self.base.ttl_for(path, max_age);
        if base.is_zero() {
            return base;
        }
        let frequency = self.frequency(path);

        let multiplier = if frequency >= self.config.high_frequency {
            self.config.high_multiplier
        } else if frequency <= self.config.low_frequency {
            self.config.low_multiplier
        } else {
            1.0
        };

        base.mul_f64(multiplier.max(0.0))
            .min(self.config.max_ttl)
            .max(Duration::from_secs(1))
    }
}
