//! # Configuration Module
//!
//! `EdgeConfig` gathers the cache, cache policy, rate limit and logging
//! sections. It loads from YAML, then applies `EDGE_*` environment
//! overrides, then repairs out-of-range values.
//!
//! Startup never fails on a bad value: an unparsable override or an
//! out-of-range setting is logged with `warn!` and the default is kept.
//! Only an unreadable or malformed configuration file is an error.

use crate::caching::{CacheBackendType, CacheConfig, CachePolicy, SerializationFormat, TtlPolicyKind};
use crate::core::error::{EdgeError, EdgeResult};
use crate::middleware::rate_limiting::{
    RateLimitAlgorithmType, RateLimitConfig, RateLimitRule, RateLimitStorageType,
};
use crate::observability::{LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Smallest rate limit window after repair
const MIN_RULE_WINDOW: Duration = Duration::from_secs(1);

/// Complete edge layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub cache: CacheConfig,
    pub cache_policy: CachePolicy,
    pub rate_limit: RateLimitConfig,
    pub logging: LogConfig,
}

impl EdgeConfig {
    /// Load from a YAML file, then apply environment overrides and repairs
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> EdgeResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EdgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(std::env::vars());
        config.validate();

        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse YAML without consulting the environment
    pub fn from_yaml(content: &str) -> EdgeResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(std::env::vars());
        config.validate();
        config
    }

    /// Apply `EDGE_*` overrides from `(name, value)` pairs; other names are ignored
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let name = name.as_ref();
            if name.starts_with("EDGE_") {
                self.apply_override(name, value.as_ref().trim());
            }
        }
    }

    fn apply_override(&mut self, name: &str, value: &str) {
        let cache = &mut self.cache;
        let rate_limit = &mut self.rate_limit;

        match name {
            "EDGE_CACHE_ENABLED" => set(&mut cache.enabled, parse_bool(name, value)),
            "EDGE_CACHE_BACKEND" => {
                set(&mut cache.backend, parse::<CacheBackendType>(name, value))
            }
            "EDGE_REDIS_URL" => {
                cache.redis.url = Some(value.to_string());
                rate_limit.redis_url = Some(value.to_string());
            }
            "EDGE_REDIS_HOST" => cache.redis.host = value.to_string(),
            "EDGE_REDIS_PORT" => set(&mut cache.redis.port, parse(name, value)),
            "EDGE_REDIS_DB" => set(&mut cache.redis.db, parse(name, value)),
            "EDGE_REDIS_PASSWORD" => cache.redis.password = Some(value.to_string()),
            "EDGE_REDIS_TIMEOUT" => {
                if let Some(timeout) = parse_duration(name, value) {
                    cache.redis.operation_timeout = timeout;
                    rate_limit.store_timeout = timeout;
                }
            }
            "EDGE_CACHE_DEFAULT_TTL" => set(&mut cache.default_ttl, parse_duration(name, value)),
            "EDGE_CACHE_MAX_ENTRIES" => set(&mut cache.max_entries, parse(name, value)),
            "EDGE_CACHE_KEY_PREFIX" => cache.key_prefix = value.to_string(),
            "EDGE_CACHE_COMPRESSION" => set(
                &mut cache.serializer.compression_enabled,
                parse_bool(name, value),
            ),
            "EDGE_CACHE_COMPRESSION_THRESHOLD" => set(
                &mut cache.serializer.compression_threshold,
                parse(name, value),
            ),
            "EDGE_CACHE_SERIALIZATION" => set(
                &mut cache.serializer.format,
                parse::<SerializationFormat>(name, value),
            ),
            "EDGE_CACHE_TTL_POLICY" => set(
                &mut self.cache_policy.ttl_policy,
                parse::<TtlPolicyKind>(name, value),
            ),
            "EDGE_RATE_LIMIT_ENABLED" => set(&mut rate_limit.enabled, parse_bool(name, value)),
            "EDGE_RATE_LIMIT_ALGORITHM" => set(
                &mut rate_limit.algorithm,
                parse::<RateLimitAlgorithmType>(name, value),
            ),
            "EDGE_RATE_LIMIT_STORAGE" => set(
                &mut rate_limit.storage,
                parse_storage(name, value),
            ),
            "EDGE_RATE_LIMIT_DEFAULT_RULES" => set(
                &mut rate_limit.default_rules,
                parse_list::<RateLimitRule>(name, value),
            ),
            "EDGE_RATE_LIMIT_ALLOW_IPS" => {
                set(&mut rate_limit.allow_ips, parse_list::<IpAddr>(name, value))
            }
            "EDGE_RATE_LIMIT_DENY_IPS" => {
                set(&mut rate_limit.deny_ips, parse_list::<IpAddr>(name, value))
            }
            "EDGE_LOG_LEVEL" => self.logging.level = value.to_string(),
            "EDGE_LOG_FORMAT" => set(&mut self.logging.format, parse::<LogFormat>(name, value)),
            _ => {}
        }
    }

    /// Repair out-of-range values in place, returning a description of
    /// each repair
    pub fn validate(&mut self) -> Vec<String> {
        let mut repairs = Vec::new();
        let cache_defaults = CacheConfig::default();

        if self.cache.max_entries == 0 {
            self.cache.max_entries = cache_defaults.max_entries;
            repairs.push("cache.max_entries must be positive".to_string());
        }
        if self.cache.max_key_length < 32 {
            self.cache.max_key_length = cache_defaults.max_key_length;
            repairs.push("cache.max_key_length must be at least 32".to_string());
        }
        if self.cache.serializer.compression_level > 9 {
            self.cache.serializer.compression_level = cache_defaults.serializer.compression_level;
            repairs.push("cache.serializer.compression_level must be 0-9".to_string());
        }
        if self.cache_policy.max_body_size == 0 {
            self.cache_policy.max_body_size = CachePolicy::default().max_body_size;
            repairs.push("cache_policy.max_body_size must be positive".to_string());
        }

        let rate_limit = &mut self.rate_limit;
        if rate_limit.sliding_window_buckets == 0 {
            rate_limit.sliding_window_buckets = RateLimitConfig::default().sliding_window_buckets;
            repairs.push("rate_limit.sliding_window_buckets must be positive".to_string());
        }
        repair_rules(&mut rate_limit.default_rules, "rate_limit.default_rules", &mut repairs);
        for set in &mut rate_limit.path_rules {
            let section = format!("rate_limit.path_rules[{}]", set.prefix);
            repair_rules(&mut set.rules, &section, &mut repairs);
        }
        if rate_limit.storage == RateLimitStorageType::Redis && rate_limit.redis_url.is_none() {
            rate_limit.redis_url = Some(self.cache.redis.connection_url());
            repairs.push("rate_limit.redis_url taken from cache.redis".to_string());
        }

        for repair in &repairs {
            warn!(repair = %repair, "Repaired configuration value");
        }
        repairs
    }
}

fn repair_rules(rules: &mut Vec<RateLimitRule>, section: &str, repairs: &mut Vec<String>) {
    let before = rules.len();
    rules.retain(|rule| rule.requests > 0);
    if rules.len() < before {
        repairs.push(format!("{}: dropped rules allowing zero requests", section));
    }

    for rule in rules.iter_mut() {
        if rule.window < MIN_RULE_WINDOW {
            repairs.push(format!(
                "{}: window of '{}' raised to {:?}",
                section,
                rule.display_name(),
                MIN_RULE_WINDOW
            ));
            rule.window = MIN_RULE_WINDOW;
        }
        if rule.burst == Some(0) {
            repairs.push(format!(
                "{}: zero burst of '{}' reset to the request count",
                section,
                rule.display_name()
            ));
            rule.burst = None;
        }
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn parse<T>(name: &str, value: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(variable = name, value, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            warn!(variable = name, value, "Ignoring invalid boolean override");
            None
        }
    }
}

/// Plain seconds or a humantime duration such as `1m 30s`
fn parse_duration(name: &str, value: &str) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    match humantime::parse_duration(value) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!(variable = name, value, error = %e, "Ignoring invalid duration override");
            None
        }
    }
}

fn parse_storage(name: &str, value: &str) -> Option<RateLimitStorageType> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Some(RateLimitStorageType::Memory),
        "redis" => Some(RateLimitStorageType::Redis),
        _ => {
            warn!(variable = name, value, "Ignoring invalid rate limit storage override");
            None
        }
    }
}

/// Comma-separated list; one bad entry rejects the whole list
fn parse_list<T>(name: &str, value: &str) -> Option<Vec<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse::<T>(name, item))
        .collect()
}
