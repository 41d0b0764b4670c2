//! # Cache Key Generator
//!
//! Deterministic cache keys. Every key lives under the configured prefix:
//!
//! ```text
//! {prefix}:{category}:{identifier}[:bin]
//! {prefix}:response:{METHOD}:{normalized path}:{digest(sorted query, user)}
//! ```
//!
//! The method and path stay readable in response keys so that
//! `invalidate("edu:response:*:/api/classes*")` can bust a resource after a
//! write elsewhere in the system.

use crate::core::request::ANONYMOUS;
use sha2::{Digest, Sha256};

/// Category used for cached HTTP responses
pub const RESPONSE_CATEGORY: &str = "response";

const DEFAULT_MAX_KEY_LENGTH: usize = 250;

/// The parts of a request that identify a cached response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKeyParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// Caller identity; `None` keys the response as anonymous
    pub user: Option<&'a str>,
}

/// Builds namespaced cache keys
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    prefix: String,
    suffix: Option<&'static str>,
    max_length: usize,
}

impl CacheKeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: None,
            max_length: DEFAULT_MAX_KEY_LENGTH,
        }
    }

    /// Append a format suffix to namespaced keys
    pub fn with_suffix(mut self, suffix: Option<&'static str>) -> Self {
        self.suffix = suffix;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{category}:{identifier}[:suffix]`
    pub fn namespaced(&self, category: &str, identifier: &str) -> String {
        let key = match self.suffix {
            Some(suffix) => format!("{}:{}:{}:{}", self.prefix, category, identifier, suffix),
            None => format!("{}:{}:{}", self.prefix, category, identifier),
        };
        self.truncate_key(key, category)
    }

    /// Key for a cached HTTP response
    pub fn request_key(&self, parts: &RequestKeyParts<'_>) -> String {
        let method = parts.method.to_ascii_uppercase();
        let path = normalize_path(parts.path);
        let query = parts.query.map(normalize_query).unwrap_or_default();
        let user = parts.user.unwrap_or(ANONYMOUS);

        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update([0u8]);
        hasher.update(user.as_bytes());
        let digest = hex::encode(&hasher.finalize()[..12]);

        let key = format!(
            "{}:{}:{}:{}:{}",
            self.prefix, RESPONSE_CATEGORY, method, path, digest
        );
        self.truncate_key(key, RESPONSE_CATEGORY)
    }

    /// Patterns matching every cached response for a path and the paths
    /// below it; sibling paths sharing a prefix (`/api/classes-old`) are
    /// left alone
    pub fn response_patterns(&self, path_prefix: &str) -> Vec<String> {
        let path = normalize_path(path_prefix);
        let base = format!("{}:{}:*:", self.prefix, RESPONSE_CATEGORY);
        if path == "/" {
            return vec![format!("{}/*", base)];
        }
        vec![format!("{}{}:*", base, path), format!("{}{}/*", base, path)]
    }

    /// Hash keys that exceed the length limit, keeping prefix and category
    fn truncate_key(&self, key: String, category: &str) -> String {
        if key.len() <= self.max_length {
            return key;
        }
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        format!("{}:{}:hash:{}", self.prefix, category, digest)
    }
}

/// Collapse duplicate slashes and drop any trailing slash
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Sort query parameters so that parameter order never changes the key
pub fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
