//! Request middleware that is not part of the cache subsystem.

pub mod rate_limiting;

pub use rate_limiting::{RateLimitConfig, RateLimitLayer, RateLimiter};
