//! # Cache Middleware
//!
//! Response caching as a tower layer. Per request:
//!
//! ```text
//! RECEIVED -> BYPASS                         -> forward
//!          -> LOOKUP -> HIT                  -> respond from cache
//!                    -> MISS -> forward      -> store if cacheable
//! ```
//!
//! Stores happen on a spawned task so the response is never delayed by the
//! cache write.

use super::cache_manager::CacheManager;
use super::key_generator::{normalize_path, RequestKeyParts};
use super::ttl_policy::{
    default_path_rules, AdaptiveTtlConfig, AdaptiveTtlPolicy, PathTtlRule, StaticTtlPolicy,
    TtlPolicy, TtlPolicyKind,
};
use crate::core::clock::SharedClock;
use crate::core::error::EdgeError;
use crate::core::request::{authenticated_user, has_authorization, path_has_prefix};
use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, warn};

pub const CACHE_STATUS_HEADER: &str = "x-cache-status";
pub const CACHE_KEY_HEADER: &str = "x-cache-key";
pub const CACHED_AT_HEADER: &str = "x-cached-at";
pub const CACHE_AGE_HEADER: &str = "x-cache-age";

/// What gets cached and for how long
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Methods eligible for caching
    pub cacheable_methods: Vec<String>,

    /// Path prefixes that are never cached
    pub excluded_paths: Vec<String>,

    /// Path prefixes where requests carrying `Authorization` may be cached
    pub authorized_paths: Vec<String>,

    /// Response headers dropped before storing
    pub volatile_headers: Vec<String>,

    /// Largest body that will be buffered and stored
    pub max_body_size: usize,

    /// Key responses per authenticated user
    pub vary_by_user: bool,

    pub ttl_policy: TtlPolicyKind,

    pub path_ttl_rules: Vec<PathTtlRule>,

    pub adaptive: AdaptiveTtlConfig,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cacheable_methods: vec!["GET".to_string()],
            excluded_paths: vec![
                "/auth".to_string(),
                "/api/auth".to_string(),
                "/health".to_string(),
                "/docs".to_string(),
                "/redoc".to_string(),
                "/openapi.json".to_string(),
            ],
            authorized_paths: Vec::new(),
            volatile_headers: vec!["date".to_string(), "server".to_string()],
            max_body_size: 1024 * 1024,
            vary_by_user: true,
            ttl_policy: TtlPolicyKind::Static,
            path_ttl_rules: default_path_rules(),
            adaptive: AdaptiveTtlConfig::default(),
        }
    }
}

/// A stored response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

impl CachedResponse {
    fn into_response(self, key: &str) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let age = (chrono::Utc::now() - self.cached_at).num_seconds().max(0);

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        set_header(headers, CACHE_STATUS_HEADER, "HIT");
        set_header(headers, CACHE_KEY_HEADER, key);
        set_header(headers, CACHED_AT_HEADER, &self.cached_at.to_rfc3339());
        set_header(headers, CACHE_AGE_HEADER, &age.to_string());
        response
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Cache-Control directives this middleware cares about
#[derive(Debug, Default, PartialEq, Eq)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    private: bool,
    max_age: Option<Duration>,
}

impl CacheControl {
    fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let directive = directive.trim().to_ascii_lowercase();
                match directive.split_once('=') {
                    Some(("max-age", secs)) => {
                        directives.max_age = secs.trim_matches('"').parse().ok().map(Duration::from_secs)
                    }
                    _ => match directive.as_str() {
                        "no-store" => directives.no_store = true,
                        "no-cache" => directives.no_cache = true,
                        "private" => directives.private = true,
                        _ => {}
                    },
                }
            }
        }
        directives
    }
}

/// Outcome of the cacheability gate
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Bypass,
    /// `refresh` skips the lookup but still stores the fresh response
    Lookup { key: String, path: String, refresh: bool },
}

/// Cache decision engine shared by every service the layer produces
#[derive(Debug)]
pub struct CacheMiddleware {
    manager: Arc<CacheManager>,
    policy: CachePolicy,
    ttl_policy: Arc<dyn TtlPolicy>,
}

impl CacheMiddleware {
    pub fn new(manager: Arc<CacheManager>, policy: CachePolicy, clock: SharedClock) -> Self {
        let base = StaticTtlPolicy::new(manager.config().default_ttl, policy.path_ttl_rules.clone());
        let ttl_policy: Arc<dyn TtlPolicy> = match policy.ttl_policy {
            TtlPolicyKind::Static => Arc::new(base),
            TtlPolicyKind::Adaptive => {
                Arc::new(AdaptiveTtlPolicy::new(base, policy.adaptive.clone(), clock))
            }
        };

        Self {
            manager,
            policy,
            ttl_policy,
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn decide(&self, request: &Request) -> Decision {
        if !self.manager.is_enabled() {
            return Decision::Bypass;
        }

        let method = request.method().as_str();
        if !self
            .policy
            .cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
        {
            return Decision::Bypass;
        }

        let path = normalize_path(request.uri().path());
        if self
            .policy
            .excluded_paths
            .iter()
            .any(|prefix| path_has_prefix(&path, prefix))
        {
            return Decision::Bypass;
        }

        if has_authorization(request)
            && !self
                .policy
                .authorized_paths
                .iter()
                .any(|prefix| path_has_prefix(&path, prefix))
        {
            debug!(path = %path, "Authorized request outside cacheable prefixes");
            return Decision::Bypass;
        }

        let directives = CacheControl::from_headers(request.headers());
        if directives.no_store {
            return Decision::Bypass;
        }

        let user = if self.policy.vary_by_user {
            authenticated_user(request)
        } else {
            None
        };
        let key = self.manager.key_builder().request_key(&RequestKeyParts {
            method,
            path: &path,
            query: request.uri().query(),
            user,
        });

        Decision::Lookup {
            key,
            path,
            refresh: directives.no_cache,
        }
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        let cached = self.manager.get::<CachedResponse>(key).await?;
        debug!(key, "Serving response from cache");
        Some(cached.into_response(key))
    }

    /// TTL for a response, or `None` when it must not be stored
    /// TTL to store a response with, `None` when it must not be stored.
    /// `Some(Duration::ZERO)` stores without expiry.
    fn storable_ttl(&self, path: &str, response: &Response) -> Option<Duration> {
        if !response.status().is_success() {
            return None;
        }

        let directives = CacheControl::from_headers(response.headers());
        if directives.no_store || directives.no_cache || directives.private {
            return None;
        }

        if directives.max_age == Some(Duration::ZERO) {
            return None;
        }

        Some(self.ttl_policy.ttl_for(path, directives.max_age))
    }

    async fn store(&self, key: String, path: &str, response: Response) -> Response {
        let Some(ttl) = self.storable_ttl(path, &response) else {
            return response;
        };

        let within_limit = matches!(
            response.body().size_hint().upper(),
            Some(upper) if upper as usize <= self.policy.max_body_size
        );
        if !within_limit {
            debug!(key = %key, "Response body too large or unbounded, not caching");
            return response;
        }

        let (mut parts, body) = response.into_parts();
        let bytes = match axum::body::to_bytes(body, self.policy.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to buffer response body");
                return EdgeError::internal("failed to read response body").into_response();
            }
        };

        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| !self.is_volatile(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let cached = CachedResponse {
            status: parts.status.as_u16(),
            headers,
            body: bytes.to_vec(),
            cached_at: chrono::Utc::now(),
        };

        let manager = Arc::clone(&self.manager);
        let store_key = key.clone();
        tokio::spawn(async move {
            if manager.set(&store_key, &cached, Some(ttl)).await {
                debug!(key = %store_key, ttl = ?ttl, "Stored response in cache");
            }
        });

        set_header(&mut parts.headers, CACHE_STATUS_HEADER, "MISS");
        set_header(&mut parts.headers, CACHE_KEY_HEADER, &key);
        Response::from_parts(parts, Body::from(bytes))
    }

    fn is_volatile(&self, name: &str) -> bool {
        name.starts_with("x-cache")
            || self
                .policy
                .volatile_headers
                .iter()
                .any(|volatile| volatile.eq_ignore_ascii_case(name))
    }

    /// Remove cached responses whose key matches the glob `pattern`
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.manager.invalidate(pattern).await
    }
}

/// Tower layer installing [`CacheMiddleware`]
#[derive(Clone)]
pub struct CacheLayer {
    middleware: Arc<CacheMiddleware>,
}

impl CacheLayer {
    pub fn new(manager: Arc<CacheManager>, policy: CachePolicy, clock: SharedClock) -> Self {
        Self {
            middleware: Arc::new(CacheMiddleware::new(manager, policy, clock)),
        }
    }

    /// Administrative handle to the underlying cache
    pub fn manager(&self) -> Arc<CacheManager> {
        Arc::clone(self.middleware.manager())
    }

    /// Bust every cached entry matching `pattern`
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.middleware.invalidate(pattern).await
    }

    /// Bust every cached response under a path prefix
    pub async fn invalidate_path(&self, path_prefix: &str) -> usize {
        let patterns = self
            .middleware
            .manager()
            .key_builder()
            .response_patterns(path_prefix);
        let mut removed = 0;
        for pattern in &patterns {
            removed += self.middleware.invalidate(pattern).await;
        }
        removed
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            middleware: Arc::clone(&self.middleware),
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    middleware: Arc<CacheMiddleware>,
}

impl<S> Service<Request> for CacheService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let middleware = Arc::clone(&self.middleware);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (key, path, refresh) = match middleware.decide(&request) {
                Decision::Bypass => return inner.call(request).await,
                Decision::Lookup { key, path, refresh } => (key, path, refresh),
            };

            middleware.ttl_policy.record_request(&path);

            if !refresh {
                if let Some(response) = middleware.lookup(&key).await {
                    return Ok(response);
                }
            }

            let response = inner.call(request).await?;
            Ok(middleware.store(key, &path, response).await)
        })
    }
}
