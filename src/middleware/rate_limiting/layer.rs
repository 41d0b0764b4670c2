//! Tower layer enforcing rate limits on an axum router.

use super::limiter::{LimitHeaders, RateLimitOutcome, RateLimiter};
use super::rules::{RateLimitRule, RequestIdentity};
use crate::core::error::EdgeError;
use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const WINDOW_HEADER: &str = "x-ratelimit-window";

/// Rate limiting layer
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Shared limiter, for resets and metrics
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Rate limiting service
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request> for RateLimitService<S>
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
        let clone = self.inner.clone();
        // The readied service handles this request
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);

        Box::pin(async move {
            let identity = RequestIdentity::from_request(&request);

            match limiter.check(&identity).await {
                RateLimitOutcome::Bypassed => inner.call(request).await,
                RateLimitOutcome::Denied { ip } => Ok(EdgeError::AccessDenied {
                    ip: ip.to_string(),
                }
                .into_response()),
                RateLimitOutcome::Limited { rule, retry_after } => {
                    Ok(limited_response(&rule, retry_after))
                }
                RateLimitOutcome::Allowed { headers } => {
                    let mut response = inner.call(request).await?;
                    if let Some(limits) = headers {
                        insert_limit_headers(response.headers_mut(), &limits);
                    }
                    Ok(response)
                }
            }
        })
    }
}

fn insert_limit_headers(headers: &mut HeaderMap, limits: &LimitHeaders) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(limits.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(limits.remaining));
    headers.insert(WINDOW_HEADER, HeaderValue::from(limits.window.as_secs()));
}

/// Whole seconds a client should wait, never zero
fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_millis().div_ceil(1000) as u64).max(1)
}

fn limited_response(rule: &RateLimitRule, retry_after: Duration) -> Response {
    let retry_secs = retry_after_secs(retry_after);
    let message = EdgeError::RateLimitExceeded {
        limit: rule.requests,
        window_secs: rule.window.as_secs(),
    }
    .to_string();

    let body = Json(json!({
        "error": "rate_limit_exceeded",
        "message": message,
        "limit": rule.requests,
        "window": rule.window.as_secs(),
        "scope": rule.scope.as_str(),
        "rule": rule.display_name(),
        "retry_after": retry_secs,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
    insert_limit_headers(
        headers,
        &LimitHeaders {
            limit: rule.requests,
            remaining: 0,
            window: rule.window,
        },
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::middleware::rate_limiting::{RateLimitConfig, RateLimitScope};
    use axum::{body::Body, routing::get, Router};
    use tower::ServiceExt;

    fn app(config: RateLimitConfig, clock: &ManualClock) -> Router {
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(clock.clone())));
        Router::new()
            .route("/api/lessons", get(|| async { "lessons" }))
            .layer(RateLimitLayer::new(limiter))
    }

    fn request(ip: &str) -> Request {
        Request::builder()
            .uri("/api/lessons")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn config(requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            default_rules: vec![RateLimitRule::new(
                requests,
                Duration::from_secs(10),
                RateLimitScope::Ip,
            )
            .with_name("per-ip")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allowed_response_carries_limit_headers() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let response = app(config(3), &clock).oneshot(request("1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "3");
        assert_eq!(response.headers()[REMAINING_HEADER], "2");
        assert_eq!(response.headers()[WINDOW_HEADER], "10");
    }

    #[tokio::test]
    async fn test_limited_response_body_and_headers() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let app = app(config(1), &clock);

        let first = app.clone().oneshot(request("1.2.3.4")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        clock.advance(Duration::from_millis(2500));
        let limited = app.oneshot(request("1.2.3.4")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()[header::RETRY_AFTER], "8");
        assert_eq!(limited.headers()[REMAINING_HEADER], "0");

        let body = axum::body::to_bytes(limited.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["limit"], 1);
        assert_eq!(body["window"], 10);
        assert_eq!(body["scope"], "ip");
        assert_eq!(body["rule"], "per-ip");
        assert_eq!(body["retry_after"], 8);
    }

    #[tokio::test]
    async fn test_deny_listed_ip_gets_forbidden() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let app = app(
            RateLimitConfig {
                deny_ips: vec!["6.6.6.6".parse().unwrap()],
                ..config(3)
            },
            &clock,
        );

        let response = app.clone().oneshot(request("6.6.6.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let other = app.oneshot(request("1.2.3.4")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(6001)), 7);
        assert_eq!(retry_after_secs(Duration::from_secs(7)), 7);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
