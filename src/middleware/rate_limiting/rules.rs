//! Rate limit rules and rule resolution.
//!
//! A request is checked against the global default rules plus every rule
//! set whose prefix covers the request path on a segment boundary. Each
//! rule is evaluated against a counter keyed by its scope:
//!
//! ```text
//! rate_limit:ip:{sha256(client ip) prefix}
//! rate_limit:user:{user id | anonymous}
//! rate_limit:endpoint:{METHOD}:{path}
//! rate_limit:global:global
//! ```

use super::RateLimitError;
use crate::core::request::{authenticated_user, client_ip, path_has_prefix, ANONYMOUS};
use axum::http::Request;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

pub const KEY_PREFIX: &str = "rate_limit";

/// Smallest window a rule may use
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// What a rule counts requests by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Global,
    Ip,
    User,
    Endpoint,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Ip => "ip",
            Self::User => "user",
            Self::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitScope {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "ip" => Ok(Self::Ip),
            "user" => Ok(Self::User),
            "endpoint" => Ok(Self::Endpoint),
            other => Err(RateLimitError::Configuration(format!(
                "unknown rate limit scope '{}'",
                other
            ))),
        }
    }
}

/// `requests` per `window`, counted per `scope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Reported in rejections; derived from the shape when empty
    #[serde(default)]
    pub name: String,

    pub requests: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Token bucket capacity; defaults to `requests`
    #[serde(default)]
    pub burst: Option<u32>,

    pub scope: RateLimitScope,
}

impl RateLimitRule {
    pub fn new(requests: u32, window: Duration, scope: RateLimitScope) -> Self {
        Self {
            name: String::new(),
            requests,
            window,
            burst: None,
            scope,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capacity(&self) -> u32 {
        self.burst.unwrap_or(self.requests)
    }

    /// Tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.requests as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}/{}s/{}", self.requests, self.window.as_secs(), self.scope)
        } else {
            self.name.clone()
        }
    }

    /// Identity of the rule's shape, used to keep per-rule state apart
    pub(crate) fn shape(&self) -> String {
        format!(
            "{}/{}/{}",
            self.requests,
            self.window.as_millis(),
            self.capacity()
        )
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.window < MIN_WINDOW {
            return Err(RateLimitError::Configuration(format!(
                "rule '{}' has a window shorter than {:?}",
                self.display_name(),
                MIN_WINDOW
            )));
        }
        Ok(())
    }
}

/// Parses `requests/window/scope`, e.g. `100/60/ip` or `20/1m/user`
impl FromStr for RateLimitRule {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').map(str::trim).collect();
        let [requests, window, scope] = parts.as_slice() else {
            return Err(RateLimitError::Configuration(format!(
                "rule '{}' is not requests/window/scope",
                s
            )));
        };

        let requests = requests.parse::<u32>().map_err(|e| {
            RateLimitError::Configuration(format!("invalid request count in '{}': {}", s, e))
        })?;
        let window = match window.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => humantime::parse_duration(window).map_err(|e| {
                RateLimitError::Configuration(format!("invalid window in '{}': {}", s, e))
            })?,
        };

        let rule = Self::new(requests, window, scope.parse()?);
        rule.validate()?;
        Ok(rule)
    }
}

/// Rules applied to `prefix` and every path below it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRuleSet {
    pub prefix: String,
    pub rules: Vec<RateLimitRule>,
}

/// What rule keys are derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub ip: Option<IpAddr>,
    pub user: Option<String>,
    pub method: String,
    pub path: String,
}

impl RequestIdentity {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            ip: client_ip(request),
            user: authenticated_user(request).map(str::to_string),
            method: request.method().as_str().to_string(),
            path: request.uri().path().to_string(),
        }
    }

    /// Counter key for `scope`
    pub fn key(&self, scope: RateLimitScope) -> String {
        let identifier = match scope {
            RateLimitScope::Global => "global".to_string(),
            RateLimitScope::Ip => match self.ip {
                Some(ip) => hash_ip(&ip),
                None => "unknown".to_string(),
            },
            RateLimitScope::User => self.user.clone().unwrap_or_else(|| ANONYMOUS.to_string()),
            RateLimitScope::Endpoint => format!("{}:{}", self.method, self.path),
        };
        format!("{}:{}:{}", KEY_PREFIX, scope, identifier)
    }
}

fn hash_ip(ip: &IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    hex::encode(&digest[..8])
}

/// Resolves which rules apply to a path
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    default_rules: Vec<RateLimitRule>,
    path_rules: Vec<PathRuleSet>,
}

impl RuleEngine {
    pub fn new(default_rules: Vec<RateLimitRule>, path_rules: Vec<PathRuleSet>) -> Self {
        Self {
            default_rules,
            path_rules,
        }
    }

    /// Default rules followed by the rules of every matching prefix. A
    /// prefix registered more than once contributes only its first set.
    pub fn rules_for(&self, path: &str) -> Vec<&RateLimitRule> {
        let mut seen = HashSet::new();
        let mut rules: Vec<&RateLimitRule> = self.default_rules.iter().collect();

        for set in &self.path_rules {
            if path_has_prefix(path, &set.prefix) && seen.insert(set.prefix.as_str()) {
                rules.extend(set.rules.iter());
            }
        }
        rules
    }

    pub fn is_empty(&self) -> bool {
        self.default_rules.is_empty() && self.path_rules.iter().all(|set| set.rules.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn identity(ip: &str, user: Option<&str>) -> RequestIdentity {
        RequestIdentity {
            ip: Some(ip.parse().unwrap()),
            user: user.map(str::to_string),
            method: "GET".to_string(),
            path: "/api/lessons".to_string(),
        }
    }

    #[test]
    fn test_parse_rule_triples() {
        let rule: RateLimitRule = "100/60/ip".parse().unwrap();
        assert_eq!(rule.requests, 100);
        assert_eq!(rule.window, Duration::from_secs(60));
        assert_eq!(rule.scope, RateLimitScope::Ip);
        assert_eq!(rule.capacity(), 100);

        let rule: RateLimitRule = "20 / 1m / user".parse().unwrap();
        assert_eq!(rule.window, Duration::from_secs(60));
        assert_eq!(rule.scope, RateLimitScope::User);

        assert!("100/60".parse::<RateLimitRule>().is_err());
        assert!("x/60/ip".parse::<RateLimitRule>().is_err());
        assert!("10/0/ip".parse::<RateLimitRule>().is_err());
        assert!("10/60/planet".parse::<RateLimitRule>().is_err());
    }

    #[test]
    fn test_rule_keys_per_scope() {
        let alice = identity("1.2.3.4", Some("alice"));
        assert_eq!(alice.key(RateLimitScope::Global), "rate_limit:global:global");
        assert_eq!(alice.key(RateLimitScope::User), "rate_limit:user:alice");
        assert_eq!(
            alice.key(RateLimitScope::Endpoint),
            "rate_limit:endpoint:GET:/api/lessons"
        );

        let ip_key = alice.key(RateLimitScope::Ip);
        assert!(ip_key.starts_with("rate_limit:ip:"));
        assert!(!ip_key.contains("1.2.3.4"));
        assert_eq!(ip_key, identity("1.2.3.4", None).key(RateLimitScope::Ip));
        assert_ne!(ip_key, identity("1.2.3.5", None).key(RateLimitScope::Ip));

        let anonymous = identity("1.2.3.4", None);
        assert_eq!(anonymous.key(RateLimitScope::User), "rate_limit:user:anonymous");
    }

    #[test]
    fn test_identity_from_request_uses_forwarded_ip() {
        let request = axum::http::Request::builder()
            .uri("/api/homework?page=1")
            .header("x-forwarded-for", "9.9.9.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let identity = RequestIdentity::from_request(&request);
        assert_eq!(identity.ip, Some("9.9.9.9".parse().unwrap()));
        assert_eq!(identity.path, "/api/homework");
        assert_eq!(identity.user, None);
    }

    #[test]
    fn test_rules_union_across_matching_prefixes() {
        let engine = RuleEngine::new(
            vec![RateLimitRule::new(100, Duration::from_secs(60), RateLimitScope::Ip)],
            vec![
                PathRuleSet {
                    prefix: "/api/ai".to_string(),
                    rules: vec![RateLimitRule::new(10, Duration::from_secs(60), RateLimitScope::User)],
                },
                PathRuleSet {
                    prefix: "/api/ai/chat".to_string(),
                    rules: vec![RateLimitRule::new(3, Duration::from_secs(10), RateLimitScope::User)],
                },
                PathRuleSet {
                    prefix: "/api/ai".to_string(),
                    rules: vec![RateLimitRule::new(1, Duration::from_secs(1), RateLimitScope::Global)],
                },
            ],
        );

        let requests: Vec<u32> = engine
            .rules_for("/api/ai/chat/completions")
            .iter()
            .map(|rule| rule.requests)
            .collect();
        assert_eq!(requests, vec![100, 10, 3]);

        assert_eq!(engine.rules_for("/api/classes").len(), 1);
        assert_eq!(engine.rules_for("/api/aide").len(), 1);
        assert_eq!(engine.rules_for("/api/ai").len(), 2);
        assert!(!engine.is_empty());
        assert!(RuleEngine::default().is_empty());
    }

    #[test]
    fn test_display_name() {
        let rule = RateLimitRule::new(5, Duration::from_secs(60), RateLimitScope::Endpoint);
        assert_eq!(rule.display_name(), "5/60s/endpoint");
        assert_eq!(rule.with_name("chat").display_name(), "chat");
    }
}
