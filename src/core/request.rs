//! Request-side helpers shared by the cache and rate-limit middleware.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::net::{IpAddr, SocketAddr};

/// Identity of the caller, inserted into request extensions by whichever
/// authentication layer runs in front of the edge middleware.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedUser(pub String);

impl AuthenticatedUser {
    pub fn new<S: Into<String>>(user_id: S) -> Self {
        Self(user_id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Placeholder identity for unauthenticated callers
pub const ANONYMOUS: &str = "anonymous";

/// Resolve the client address.
///
/// `X-Forwarded-For` wins (first hop is canonical), then `X-Real-IP`, then
/// the socket address recorded by axum's `ConnectInfo`.
pub fn client_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    forwarded_ip(request.headers()).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded
            .split(',')
            .next()
            .and_then(|first| first.trim().parse().ok())
        {
            return Some(ip);
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Authenticated user id, if an auth layer attached one
pub fn authenticated_user<B>(request: &Request<B>) -> Option<&str> {
    request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(AuthenticatedUser::id)
}

/// Whether `path` lies under `prefix` on a segment boundary: `/health`
/// covers `/health` and `/health/live` but not `/healthy`
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Whether the request carries credentials
pub fn has_authorization<B>(request: &Request<B>) -> bool {
    request.headers().contains_key(axum::http::header::AUTHORIZATION)
}
