//! # Rate Limiting Integration Tests
//!
//! End-to-end behaviour of the rate limit layer on an axum router, with a
//! manually advanced clock.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use edu_edge::core::clock::ManualClock;
use edu_edge::core::request::AuthenticatedUser;
use edu_edge::middleware::rate_limiting::{
    PathRuleSet, RateLimitAlgorithmType, RateLimitConfig, RateLimitLayer, RateLimitRule,
    RateLimitScope, RateLimiter,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const START: Duration = Duration::from_secs(1_700_000_000);

fn app(config: RateLimitConfig, clock: &ManualClock) -> (Router, Arc<RateLimiter>) {
    let limiter = Arc::new(RateLimiter::new(config, Arc::new(clock.clone())));
    let router = Router::new()
        .route("/api/lessons", get(|| async { "lessons" }))
        .route("/api/ai/chat", get(|| async { "answer" }))
        .layer(RateLimitLayer::new(Arc::clone(&limiter)));
    (router, limiter)
}

fn from_ip(uri: &str, ip: &str) -> Request {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

fn three_per_ten_seconds(algorithm: RateLimitAlgorithmType) -> RateLimitConfig {
    RateLimitConfig {
        algorithm,
        default_rules: vec![RateLimitRule::new(3, Duration::from_secs(10), RateLimitScope::Ip)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sliding_window_scenario() {
    let clock = ManualClock::new(START);
    let (router, _) = app(three_per_ten_seconds(RateLimitAlgorithmType::SlidingWindow), &clock);

    for (second, remaining) in [(0, "2"), (1, "1"), (2, "0")] {
        clock.set(START + Duration::from_secs(second));
        let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK, "request at t={}", second);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        assert_eq!(response.headers()["x-ratelimit-window"], "10");
    }

    clock.set(START + Duration::from_secs(3));
    let limited = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()[header::RETRY_AFTER], "7");

    // a different client is unaffected
    let other = send(&router, from_ip("/api/lessons", "5.6.7.8")).await;
    assert_eq!(other.status(), StatusCode::OK);

    clock.set(START + Duration::from_secs(11));
    let recovered = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(recovered.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_token_bucket_refills() {
    let clock = ManualClock::new(START);
    let (router, limiter) = app(three_per_ten_seconds(RateLimitAlgorithmType::TokenBucket), &clock);

    for _ in 0..3 {
        let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let limited = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()[header::RETRY_AFTER], "4");

    // one token every 3.33s
    clock.advance(Duration::from_millis(3400));
    let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let metrics = limiter.metrics();
    assert_eq!(metrics.allowed, 4);
    assert_eq!(metrics.blocked, 1);
}

#[tokio::test]
async fn test_fixed_window_resets_at_boundary() {
    let clock = ManualClock::new(START);
    let (router, _) = app(three_per_ten_seconds(RateLimitAlgorithmType::FixedWindow), &clock);

    clock.set(START + Duration::from_secs(6));
    for _ in 0..3 {
        let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let limited = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()[header::RETRY_AFTER], "4");

    clock.set(START + Duration::from_secs(10));
    let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_path_rules_apply_per_user() {
    let clock = ManualClock::new(START);
    let config = RateLimitConfig {
        default_rules: vec![RateLimitRule::new(100, Duration::from_secs(60), RateLimitScope::Ip)],
        path_rules: vec![PathRuleSet {
            prefix: "/api/ai".to_string(),
            rules: vec![
                RateLimitRule::new(1, Duration::from_secs(60), RateLimitScope::User)
                    .with_name("ai-per-user"),
            ],
        }],
        ..Default::default()
    };
    let (router, limiter) = app(config, &clock);

    let as_user = |user: &str| {
        let mut request = from_ip("/api/ai/chat", "1.2.3.4");
        request.extensions_mut().insert(AuthenticatedUser::new(user));
        request
    };

    let first = send(&router, as_user("student-1")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "1");

    let second = send(&router, as_user("student-1")).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["rule"], "ai-per-user");
    assert_eq!(body["scope"], "user");

    // same IP, different user
    assert_eq!(send(&router, as_user("student-2")).await.status(), StatusCode::OK);

    // other paths only carry the IP rule
    let lessons = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
    assert_eq!(lessons.status(), StatusCode::OK);
    assert_eq!(lessons.headers()["x-ratelimit-limit"], "100");

    assert!(limiter.reset("rate_limit:user:student-1").await);
    assert_eq!(send(&router, as_user("student-1")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_allow_and_deny_lists() {
    let clock = ManualClock::new(START);
    let config = RateLimitConfig {
        allow_ips: vec!["10.0.0.5".parse().unwrap()],
        deny_ips: vec!["6.6.6.6".parse().unwrap()],
        ..three_per_ten_seconds(RateLimitAlgorithmType::SlidingWindow)
    };
    let (router, limiter) = app(config, &clock);

    let denied = send(&router, from_ip("/api/lessons", "6.6.6.6")).await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    for _ in 0..10 {
        let response = send(&router, from_ip("/api/lessons", "10.0.0.5")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }

    let metrics = limiter.metrics();
    assert_eq!(metrics.denied_ip, 1);
    assert_eq!(metrics.bypassed, 10);
}

#[tokio::test]
async fn test_unreachable_redis_fails_open() {
    let clock = ManualClock::new(START);
    let config = RateLimitConfig {
        storage: edu_edge::middleware::rate_limiting::RateLimitStorageType::Redis,
        redis_url: Some("redis://127.0.0.1:1/0".to_string()),
        store_timeout: Duration::from_millis(300),
        ..three_per_ten_seconds(RateLimitAlgorithmType::FixedWindow)
    };
    let (router, limiter) = app(config, &clock);

    for _ in 0..5 {
        let response = send(&router, from_ip("/api/lessons", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(limiter.metrics().degraded, 5);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_queue_behind_unreachable_redis() {
    let clock = ManualClock::new(START);
    let config = RateLimitConfig {
        storage: edu_edge::middleware::rate_limiting::RateLimitStorageType::Redis,
        redis_url: Some("redis://127.0.0.1:1/0".to_string()),
        store_timeout: Duration::from_millis(300),
        ..three_per_ten_seconds(RateLimitAlgorithmType::FixedWindow)
    };
    let (router, limiter) = app(config, &clock);

    let started = std::time::Instant::now();
    let responses = futures::future::join_all(
        (0..10).map(|_| send(&router, from_ip("/api/lessons", "1.2.3.4"))),
    )
    .await;

    assert!(responses.iter().all(|r| r.status() == StatusCode::OK));
    // a single connect timeout, not one per request
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "took {:?}",
        started.elapsed()
    );
    assert_eq!(limiter.metrics().degraded, 10);
}
