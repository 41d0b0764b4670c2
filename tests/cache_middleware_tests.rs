//! # Cache Middleware Integration Tests
//!
//! Drives an axum router wrapped in the cache layer through `oneshot`.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use edu_edge::caching::{
    CacheConfig, CacheLayer, CacheManager, CachePolicy, CACHE_STATUS_HEADER,
};
use edu_edge::core::clock::system_clock;
use edu_edge::core::request::AuthenticatedUser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    layer: CacheLayer,
    calls: Arc<AtomicUsize>,
}

fn test_app(policy: CachePolicy) -> TestApp {
    let manager = Arc::new(CacheManager::new(CacheConfig {
        cleanup_interval: None,
        ..Default::default()
    }));
    let layer = CacheLayer::new(manager, policy, system_clock());
    let calls = Arc::new(AtomicUsize::new(0));

    let lessons_calls = Arc::clone(&calls);
    let private_calls = Arc::clone(&calls);
    let router = Router::new()
        .route(
            "/api/lessons",
            get(move || {
                let calls = Arc::clone(&lessons_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    format!("lessons v{}", n)
                }
            }),
        )
        .route(
            "/api/private",
            get(move || {
                let calls = Arc::clone(&private_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::CACHE_CONTROL, "private")], "mine").into_response()
                }
            }),
        )
        .route("/api/homework", post(|| async { "submitted" }))
        .route("/api/missing", get(|| async { StatusCode::NOT_FOUND }))
        .layer(layer.clone());

    TestApp {
        router,
        layer,
        calls,
    }
}

fn get_request(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Stores run on a spawned task; wait until the key lands
async fn wait_for_key(manager: &CacheManager, key: &str) {
    for _ in 0..100 {
        if manager.exists(key).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("key {} was never stored", key);
}

async fn miss_then_stored(app: &TestApp, uri: &str) -> String {
    let response = app.router.clone().oneshot(get_request(uri)).await.unwrap();
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "MISS");
    let key = response.headers()["x-cache-key"].to_str().unwrap().to_string();
    wait_for_key(&app.layer.manager(), &key).await;
    key
}

#[tokio::test]
async fn test_miss_then_hit() {
    let app = test_app(CachePolicy::default());

    miss_then_stored(&app, "/api/lessons?page=1&size=10").await;

    let hit = app
        .router
        .clone()
        .oneshot(get_request("/api/lessons?size=10&page=1"))
        .await
        .unwrap();
    assert_eq!(hit.status(), StatusCode::OK);
    assert_eq!(hit.headers()[CACHE_STATUS_HEADER], "HIT");
    assert!(hit.headers().contains_key("x-cache-age"));
    assert_eq!(body_text(hit).await, "lessons v1");
    assert_eq!(app.calls.load(Ordering::SeqCst), 1);

    let metrics = app.layer.manager().metrics();
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.sets, 1);
}

#[tokio::test]
async fn test_no_cache_request_refreshes_entry() {
    let app = test_app(CachePolicy::default());
    let key = miss_then_stored(&app, "/api/lessons").await;

    let refresh = Request::builder()
        .uri("/api/lessons")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(refresh).await.unwrap();
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "MISS");
    assert_eq!(body_text(response).await, "lessons v2");

    // the refreshed body replaces the old one
    for _ in 0..100 {
        let hit = app.router.clone().oneshot(get_request("/api/lessons")).await.unwrap();
        if body_text(hit).await == "lessons v2" {
            assert!(app.layer.manager().exists(&key).await);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("refreshed response was never served");
}

#[tokio::test]
async fn test_no_store_request_bypasses_cache() {
    let app = test_app(CachePolicy::default());

    for _ in 0..2 {
        let request = Request::builder()
            .uri("/api/lessons")
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_uncacheable_requests_and_responses() {
    let app = test_app(CachePolicy::default());

    let post = Request::builder()
        .method("POST")
        .uri("/api/homework")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(post).await.unwrap();
    assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));

    let authorized = Request::builder()
        .uri("/api/lessons")
        .header(header::AUTHORIZATION, "Bearer token")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(authorized).await.unwrap();
    assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));

    let missing = app.router.clone().oneshot(get_request("/api/missing")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert!(!missing.headers().contains_key(CACHE_STATUS_HEADER));

    for _ in 0..2 {
        let private = app.router.clone().oneshot(get_request("/api/private")).await.unwrap();
        assert!(!private.headers().contains_key(CACHE_STATUS_HEADER));
    }
    assert_eq!(app.layer.manager().metrics().sets, 0);
}

#[tokio::test]
async fn test_responses_vary_by_user() {
    let app = test_app(CachePolicy::default());
    let as_user = |user: &str| {
        let mut request = get_request("/api/lessons");
        request.extensions_mut().insert(AuthenticatedUser::new(user));
        request
    };

    let first = app.router.clone().oneshot(as_user("alice")).await.unwrap();
    let alice_key = first.headers()["x-cache-key"].to_str().unwrap().to_string();
    wait_for_key(&app.layer.manager(), &alice_key).await;

    let bob = app.router.clone().oneshot(as_user("bob")).await.unwrap();
    assert_eq!(bob.headers()[CACHE_STATUS_HEADER], "MISS");
    assert_ne!(bob.headers()["x-cache-key"], alice_key.as_str());

    let alice_again = app.router.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(alice_again.headers()[CACHE_STATUS_HEADER], "HIT");
}

#[tokio::test]
async fn test_invalidate_path_drops_cached_responses() {
    let app = test_app(CachePolicy::default());
    miss_then_stored(&app, "/api/lessons?page=1").await;
    miss_then_stored(&app, "/api/lessons?page=2").await;

    assert_eq!(app.layer.invalidate_path("/api/lessons").await, 2);

    let response = app
        .router
        .clone()
        .oneshot(get_request("/api/lessons?page=1"))
        .await
        .unwrap();
    assert_eq!(response.headers()[CACHE_STATUS_HEADER], "MISS");
}

#[tokio::test]
async fn test_excluded_paths_are_never_cached() {
    let app = test_app(CachePolicy {
        excluded_paths: vec!["/api/lessons".to_string()],
        ..Default::default()
    });

    for _ in 0..2 {
        let response = app.router.clone().oneshot(get_request("/api/lessons")).await.unwrap();
        assert!(!response.headers().contains_key(CACHE_STATUS_HEADER));
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}
