//! Counter storage for the fixed window algorithm.
//!
//! Counters are incremented atomically and expire with their window. The
//! in-memory storage serves single-instance deployments and tests; the
//! Redis storage shares counters across instances with a script that runs
//! `INCR` and, on the first increment, `PEXPIRE` as one atomic step.

use super::{RateLimitError, RateLimitResult};
use crate::core::backoff::{ConnectGate, DEFAULT_RECONNECT_BACKOFF};
use crate::core::clock::SharedClock;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient, Script};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Increment, setting the expiry only when the counter is new
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Increments between opportunistic sweeps of expired in-memory counters
const SWEEP_EVERY: u64 = 1024;

/// Where rate limit counters live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStorageType {
    #[default]
    Memory,
    Redis,
}

/// Trait for rate limiting storage backends
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Increment a counter, starting a fresh one that lives for `ttl` when
    /// the key is new or expired; returns the post-increment count
    async fn increment(&self, key: &str, ttl: Duration) -> RateLimitResult<u64>;

    /// Current count, `None` when absent or expired
    async fn get(&self, key: &str) -> RateLimitResult<Option<u64>>;

    /// Remove every counter whose key starts with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> RateLimitResult<usize>;
}

/// In-memory storage implementation
pub struct InMemoryStorage {
    clock: SharedClock,
    /// key -> (count, expires at since epoch)
    data: DashMap<String, (u64, Duration)>,
    operations: AtomicU64,
}

impl InMemoryStorage {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            data: DashMap::new(),
            operations: AtomicU64::new(0),
        }
    }

    /// Drop expired counters
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.data.len();
        self.data.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.data.len())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl RateLimitStorage for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str, ttl: Duration) -> RateLimitResult<u64> {
        if self.operations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let removed = self.cleanup_expired();
            if removed > 0 {
                debug!("Removed {} expired rate limit counters", removed);
            }
        }

        let now = self.clock.now();
        let expires_at = now + ttl;
        let entry = self
            .data
            .entry(key.to_string())
            .and_modify(|(count, exp)| {
                if *exp > now {
                    *count += 1;
                } else {
                    *count = 1;
                    *exp = expires_at;
                }
            })
            .or_insert((1, expires_at));

        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> RateLimitResult<Option<u64>> {
        let now = self.clock.now();
        Ok(self
            .data
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0))
    }

    async fn delete_prefix(&self, prefix: &str) -> RateLimitResult<usize> {
        let before = self.data.len();
        self.data.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.data.len()))
    }
}

/// Redis storage implementation
pub struct RedisStorage {
    client: RedisClient,
    connection: OnceCell<ConnectionManager>,
    gate: ConnectGate,
    increment: Script,
    timeout: Duration,
}

impl RedisStorage {
    /// Create the storage; the connection is made on first use
    pub fn new(redis_url: &str, timeout: Duration) -> RateLimitResult<Self> {
        Self::with_reconnect_backoff(redis_url, timeout, DEFAULT_RECONNECT_BACKOFF)
    }

    pub fn with_reconnect_backoff(
        redis_url: &str,
        timeout: Duration,
        backoff: Duration,
    ) -> RateLimitResult<Self> {
        let client = RedisClient::open(redis_url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            gate: ConnectGate::new(backoff),
            increment: Script::new(INCREMENT_SCRIPT),
            timeout,
        })
    }

    /// Shared connection; while no connection exists, only one caller
    /// tries to make one and everyone else fails immediately
    async fn connection(&self) -> RateLimitResult<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        let Some(attempt) = self.gate.try_begin() else {
            return Err(RateLimitError::Storage(format!(
                "redis unavailable, next connection attempt in {:?}",
                self.gate.remaining_backoff()
            )));
        };

        let result = self
            .connection
            .get_or_try_init(|| async {
                let conn = self
                    .with_timeout(async { Ok(ConnectionManager::new(self.client.clone()).await?) })
                    .await?;
                info!("Rate limit storage connected to Redis");
                Ok::<_, RateLimitError>(conn)
            })
            .await;

        match result {
            Ok(conn) => {
                attempt.succeeded();
                Ok(conn.clone())
            }
            Err(e) => {
                warn!(error = %e, "Rate limit storage could not connect to Redis");
                attempt.failed();
                Err(e)
            }
        }
    }

    async fn with_timeout<T, Fut>(&self, future: Fut) -> RateLimitResult<T>
    where
        Fut: Future<Output = RateLimitResult<T>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &str, ttl: Duration) -> RateLimitResult<u64> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.with_timeout(async move {
            let count: u64 = self
                .increment
                .key(key)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn get(&self, key: &str) -> RateLimitResult<Option<u64>> {
        let mut conn = self.connection().await?;
        self.with_timeout(async move {
            let count: Option<u64> = conn.get(key).await?;
            Ok(count)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> RateLimitResult<usize> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        self.with_timeout(async move {
            let mut keys: Vec<String> = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            if keys.is_empty() {
                return Ok(0);
            }
            let removed: usize = conn.del(&keys).await?;
            Ok(removed)
        })
        .await
    }
}
