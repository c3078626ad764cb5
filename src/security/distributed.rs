//! Redis-backed enforcement with automatic local fallback.
//!
//! Both distributed variants perform exactly one atomic Redis operation per
//! call, bounded by a hard timeout. A transport error or timeout delegates
//! to an embedded local instance, so callers always get a boolean and never
//! observe infrastructure failures. The cached connection is dropped on
//! error; the next call reconnects, which restores remote enforcement as
//! soon as Redis becomes reachable again.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tokio::sync::Mutex;
use tracing::warn;

use super::backend::{DuplicateDetectorBackend, RateLimiterBackend};
use super::dedupe::DuplicateDetector;
use super::ratelimit::FixedWindowLimiter;

/// Hard bound on any single Redis operation, connection setup included.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(800);

/// Fixed-window check as one indivisible server-side operation. The expiry
/// is set only on the 0 -> 1 transition; doing the INCR and PEXPIRE in two
/// round trips would let two concurrent first-requests leak an unexpiring
/// counter.
const ALLOW_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
if current > tonumber(ARGV[1]) then
  return 0
end
return 1
"#;

/// Lazily-connected Redis handle shared by a component's calls.
struct RedisHandle {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisHandle {
    fn new(client: Client) -> Self {
        Self {
            client,
            conn: Mutex::new(None),
        }
    }

    /// Return the cached connection, establishing one if necessary.
    async fn connection(&self) -> redis::RedisResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }
}

/// Fixed-window rate limiter enforced through a shared Redis counter.
pub struct RedisFixedWindowLimiter {
    handle: RedisHandle,
    key_prefix: String,
    script: Script,
    fallback: FixedWindowLimiter,
}

impl RedisFixedWindowLimiter {
    /// Create a limiter writing under `key_prefix` with an embedded local
    /// fallback.
    pub fn new(client: Client, key_prefix: impl Into<String>) -> Self {
        Self {
            handle: RedisHandle::new(client),
            key_prefix: key_prefix.into(),
            script: Script::new(ALLOW_SCRIPT),
            fallback: FixedWindowLimiter::new(),
        }
    }

    async fn allow_remote(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> redis::RedisResult<bool> {
        let mut conn = self.handle.connection().await?;
        let full_key = format!("{}:rate:{}", self.key_prefix, key);
        let window_ms = window.as_millis().max(1) as u64;

        let allowed: i64 = self
            .script
            .key(full_key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }
}

#[async_trait]
impl RateLimiterBackend for RedisFixedWindowLimiter {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        if limit == 0 {
            return false;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, self.allow_remote(key, limit, window)).await {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Redis rate limit failed, enforcing locally");
                self.handle.invalidate().await;
                self.fallback.allow(key, limit, window)
            }
            Err(_) => {
                warn!(key = %key, "Redis rate limit timed out, enforcing locally");
                self.handle.invalidate().await;
                self.fallback.allow(key, limit, window)
            }
        }
    }
}

/// Duplicate detector enforced through Redis set-if-absent entries.
pub struct RedisDuplicateDetector {
    handle: RedisHandle,
    key_prefix: String,
    fallback: DuplicateDetector,
}

impl RedisDuplicateDetector {
    /// Create a detector writing under `key_prefix` with an embedded local
    /// fallback.
    pub fn new(client: Client, key_prefix: impl Into<String>) -> Self {
        Self {
            handle: RedisHandle::new(client),
            key_prefix: key_prefix.into(),
            fallback: DuplicateDetector::new(),
        }
    }

    async fn seen_remote(&self, key: &str, window: Duration) -> redis::RedisResult<bool> {
        let mut conn = self.handle.connection().await?;
        let full_key = format!("{}:dedupe:{}", self.key_prefix, key);
        let window_ms = window.as_millis().max(1) as u64;

        // SET NX PX is the atomic "record if absent, with TTL" primitive;
        // a nil reply means the fingerprint was already present.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(window_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_none())
    }
}

#[async_trait]
impl DuplicateDetectorBackend for RedisDuplicateDetector {
    async fn seen_recently(&self, key: &str, window: Duration) -> bool {
        match tokio::time::timeout(COMMAND_TIMEOUT, self.seen_remote(key, window)).await {
            Ok(Ok(seen)) => seen,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Redis dedupe failed, enforcing locally");
                self.handle.invalidate().await;
                self.fallback.seen_recently(key, window)
            }
            Err(_) => {
                warn!(key = %key, "Redis dedupe timed out, enforcing locally");
                self.handle.invalidate().await;
                self.fallback.seen_recently(key, window)
            }
        }
    }
}
