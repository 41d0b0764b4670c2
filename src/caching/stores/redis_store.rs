//! # Redis Cache Store
//!
//! Thin wrapper translating store operations into Redis commands. The
//! connection is established lazily on first use and shared afterwards;
//! every command runs under the configured operation timeout, and a
//! timeout is reported exactly like any other backend error. After a
//! failed connection attempt, commands fail immediately until the
//! reconnect backoff has passed.

use super::{normalize_ttl, CacheStore, CacheStoreStats};
use crate::caching::{CacheError, CacheResult};
use crate::core::backoff::ConnectGate;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const SCAN_BATCH: usize = 500;

/// Redis cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// Full connection URL; overrides host/port/db/password when set
    pub url: Option<String>,

    pub host: String,

    pub port: u16,

    pub db: i64,

    pub password: Option<String>,

    /// Connection establishment timeout
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Per-command timeout
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Pause after a failed connection attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            reconnect_backoff: crate::core::backoff::DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

impl RedisCacheConfig {
    /// Connection URL, composed from the parts when no explicit URL is set
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_ref().filter(|url| !url.is_empty()) {
            return url.clone();
        }

        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Redis cache implementation
pub struct RedisCache {
    config: RedisCacheConfig,

    /// Key namespace owned by this store; `clear` and `size` only touch it
    namespace: String,

    client: Client,

    connection: OnceCell<ConnectionManager>,

    gate: ConnectGate,

    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl RedisCache {
    /// Create a Redis store. No connection is made until the first command.
    pub fn new(config: RedisCacheConfig, namespace: impl Into<String>) -> CacheResult<Self> {
        let client = Client::open(config.connection_url())?;
        let gate = ConnectGate::new(config.reconnect_backoff);
        Ok(Self {
            config,
            namespace: namespace.into(),
            client,
            connection: OnceCell::new(),
            gate,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespace_pattern(&self) -> String {
        format!("{}:*", self.namespace)
    }

    async fn connection(&self) -> CacheResult<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        let Some(attempt) = self.gate.try_begin() else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Store {
                message: format!(
                    "redis unavailable, next connection attempt in {:?}",
                    self.gate.remaining_backoff()
                ),
            });
        };

        let timeout = self.config.connection_timeout;
        let result = self
            .connection
            .get_or_try_init(|| async {
                match tokio::time::timeout(timeout, ConnectionManager::new(self.client.clone())).await {
                    Ok(Ok(conn)) => {
                        info!(namespace = %self.namespace, "Redis cache connected");
                        Ok(conn)
                    }
                    Ok(Err(e)) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        error!("Redis connection failed: {}", e);
                        Err(CacheError::Redis(e))
                    }
                    Err(_) => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                        error!("Redis connection timed out after {:?}", timeout);
                        Err(CacheError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            })
            .await;

        match result {
            Ok(conn) => {
                attempt.succeeded();
                Ok(conn.clone())
            }
            Err(e) => {
                attempt.failed();
                Err(e)
            }
        }
    }

    /// Run one command under the operation timeout
    async fn execute<T, F, Fut>(&self, operation: &'static str, command: F) -> CacheResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let conn = self.connection().await?;
        let timeout = self.config.operation_timeout;

        match tokio::time::timeout(timeout, command(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(operation, "Redis operation failed: {}", e);
                Err(CacheError::Redis(e))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(operation, "Redis operation timed out after {:?}", timeout);
                Err(CacheError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.execute("scan", |mut conn| async move {
            let mut cursor: u64 = 0;
            let mut all_keys = Vec::new();
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                all_keys.extend(keys);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<_, redis::RedisError>(all_keys)
        })
        .await
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = self
            .execute("get", |mut conn| async move { conn.get(key).await })
            .await?;

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache hit for key: {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache miss for key: {}", key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let ttl_ms = normalize_ttl(ttl).map(|ttl| (ttl.as_millis() as u64).max(1));

        self.execute("set", |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ms) = ttl_ms {
                cmd.arg("PX").arg(ms);
            }
            cmd.query_async::<_, ()>(&mut conn).await
        })
        .await?;

        debug!("Set Redis cache key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let deleted: i64 = self
            .execute("del", |mut conn| async move { conn.del(key).await })
            .await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.execute("exists", |mut conn| async move { conn.exists(key).await })
            .await
    }

    async fn clear(&self) -> CacheResult<()> {
        let keys = self.scan(&self.namespace_pattern()).await?;
        let mut deleted: i64 = 0;

        for chunk in keys.chunks(SCAN_BATCH) {
            let chunk = chunk.to_vec();
            deleted += self
                .execute("del", |mut conn| async move { conn.del::<_, i64>(chunk).await })
                .await?;
        }

        info!("Cleared {} keys from Redis cache namespace {}", deleted, self.namespace);
        Ok(())
    }

    async fn size(&self) -> CacheResult<usize> {
        Ok(self.scan(&self.namespace_pattern()).await?.len())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.scan(pattern).await
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let info: String = self
            .execute("info", |mut conn| async move {
                redis::cmd("INFO").arg("memory").query_async(&mut conn).await
            })
            .await
            .unwrap_or_default();

        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory:"))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        Ok(CacheStoreStats {
            backend: self.name().to_string(),
            entries: self.size().await.unwrap_or(0),
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
            expired_cleanups: 0,
            errors: self.errors.load(Ordering::Relaxed) + self.timeouts.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let pong = self
            .execute("ping", |mut conn| async move {
                redis::cmd("PING").query_async::<_, String>(&mut conn).await
            })
            .await;
        Ok(matches!(pong, Ok(ref reply) if reply == "PONG"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcontainers::{clients::Cli, core::WaitFor, GenericImage};

    fn redis_image() -> GenericImage {
        GenericImage::new("redis", "7-alpine")
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
    }

    fn unreachable_config() -> RedisCacheConfig {
        RedisCacheConfig {
            url: Some("redis://127.0.0.1:1/0".to_string()),
            connection_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_url() {
        let config = RedisCacheConfig {
            host: "cache.internal".into(),
            port: 6380,
            db: 2,
            password: Some("p@ss".into()),
            ..Default::default()
        };
        assert_eq!(config.connection_url(), "redis://:p%40ss@cache.internal:6380/2");

        let config = RedisCacheConfig::default();
        assert_eq!(config.connection_url(), "redis://localhost:6379/0");

        let config = RedisCacheConfig {
            url: Some("redis://other:1234/5".into()),
            ..Default::default()
        };
        assert_eq!(config.connection_url(), "redis://other:1234/5");
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error() {
        let cache = RedisCache::new(unreachable_config(), "edu").unwrap();

        assert!(cache.get("edu:k").await.is_err());
        assert!(cache.set("edu:k", b"v", None).await.is_err());
        assert!(!cache.health_check().await.unwrap());
        assert!(cache.stats().await.unwrap().errors > 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_fail_fast_while_unreachable() {
        let cache = std::sync::Arc::new(RedisCache::new(unreachable_config(), "edu").unwrap());

        let start = std::time::Instant::now();
        let results = futures::future::join_all((0..10).map(|i| {
            let cache = std::sync::Arc::clone(&cache);
            async move { cache.get(&format!("edu:k{}", i)).await }
        }))
        .await;

        assert!(results.iter().all(|result| result.is_err()));
        // one connection attempt, not ten in a row
        assert!(start.elapsed() < Duration::from_millis(600), "{:?}", start.elapsed());
    }

    #[tokio::test]
    #[ignore] // Requires Docker for Redis container
    async fn test_basic_operations() {
        let docker = Cli::default();
        let node = docker.run(redis_image());
        let config = RedisCacheConfig {
            url: Some(format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379))),
            ..Default::default()
        };
        let cache = RedisCache::new(config, "edu").unwrap();

        cache.set("edu:test_key", b"test_value", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(cache.get("edu:test_key").await.unwrap(), Some(b"test_value".to_vec()));
        assert!(cache.exists("edu:test_key").await.unwrap());
        assert_eq!(cache.size().await.unwrap(), 1);
        assert_eq!(cache.keys("edu:test_*").await.unwrap(), vec!["edu:test_key".to_string()]);

        assert!(cache.delete("edu:test_key").await.unwrap());
        assert!(!cache.exists("edu:test_key").await.unwrap());

        cache.set("edu:a", b"1", None).await.unwrap();
        cache.set("other:b", b"2", None).await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert!(cache.exists("other:b").await.unwrap());
        assert!(cache.health_check().await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Docker for Redis container
    async fn test_ttl_expiration() {
        let docker = Cli::default();
        let node = docker.run(redis_image());
        let config = RedisCacheConfig {
            url: Some(format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379))),
            ..Default::default()
        };
        let cache = RedisCache::new(config, "edu").unwrap();

        cache.set("edu:expire", b"v", Some(Duration::from_secs(1))).await.unwrap();
        assert!(cache.exists("edu:expire").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("edu:expire").await.unwrap(), None);
    }
}
