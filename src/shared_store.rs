//! Shared Backend
//!
//! The operations the revocation store and the rate limiter need from a
//! backend shared by every server instance. Redis is the production
//! implementation; every call is bounded by a short timeout so a dead
//! backend surfaces as an error instead of a stalled request.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Atomic sliding window: drop members older than the window, count the
/// rest, admit the request if under the limit.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)

local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window + 1000)
    return 1
end
return 0
"#;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Write `key` with a time-to-live; the backend expires it natively.
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Record one hit against the trailing window ending at `now_ms`.
    /// Returns whether the hit was admitted.
    async fn sliding_window_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed shared store.
///
/// The connection is established lazily so the server can start while
/// Redis is down; `ConnectionManager` reconnects on its own afterwards.
/// Only one caller connects at a time; the others fail immediately rather
/// than queue behind a dead host.
pub struct RedisStore {
    client: Client,
    manager: Mutex<Option<ConnectionManager>>,
    connecting: AtomicBool,
    window_script: Script,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Invalid REDIS_URL")?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
            connecting: AtomicBool::new(false),
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.manager.lock().as_ref() {
            return Ok(conn.clone());
        }

        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(anyhow!("Redis connect already in progress"));
        }
        // Cleared on every exit, including cancellation by a caller's timeout.
        let _connecting = ConnectingGuard(&self.connecting);

        let conn = timeout(CONNECT_TIMEOUT, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| anyhow!("Redis connect timed out"))?
            .context("Failed to connect to Redis")?;
        *self.manager.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
        T: Send,
    {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| anyhow!("Redis {op} timed out after {:?}", self.op_timeout))?
            .with_context(|| format!("Redis {op} failed"))
    }
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.bounded(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        self.bounded(
            "EXISTS",
            redis::cmd("EXISTS").arg(key).query_async::<_, bool>(&mut conn),
        )
        .await
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        // Members must be unique or two hits in the same millisecond collapse.
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        let admitted: i64 = self
            .bounded(
                "EVALSHA",
                self.window_script
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(limit)
                    .arg(member)
                    .invoke_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(admitted == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: String = self
            .bounded("PING", redis::cmd("PING").query_async::<_, String>(&mut conn))
            .await?;
        if pong != "PONG" {
            return Err(anyhow!("unexpected PING reply: {pong}"));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeSharedStore;
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisStore::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_redis_errors_instead_of_hanging() {
        // Port 1 is never a Redis server; the call must fail within the connect bound.
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();
        let started = std::time::Instant::now();
        assert!(store.ping().await.is_err());
        assert!(started.elapsed() < CONNECT_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_waiters_fail_fast_while_connect_in_flight() {
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();
        store.connecting.store(true, Ordering::SeqCst);

        let started = std::time::Instant::now();
        let err = store.exists("token:blacklist:abc").await.unwrap_err();
        assert!(err.to_string().contains("in progress"));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_failed_connect_releases_the_slot() {
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();
        assert!(store.ping().await.is_err());
        assert!(!store.connecting.load(Ordering::SeqCst));
        assert!(store.manager.lock().is_none());
    }

    #[tokio::test]
    async fn test_fake_sliding_window_is_trailing() {
        let store = FakeSharedStore::healthy();
        assert!(store.sliding_window_hit("k", 1_000, 60_000, 2).await.unwrap());
        assert!(store.sliding_window_hit("k", 30_000, 60_000, 2).await.unwrap());
        assert!(!store.sliding_window_hit("k", 59_000, 60_000, 2).await.unwrap());
        // First hit has left the trailing window, second has not.
        assert!(store.sliding_window_hit("k", 61_001, 60_000, 2).await.unwrap());
        assert!(!store.sliding_window_hit("k", 61_002, 60_000, 2).await.unwrap());
    }
}
