//! Windowed rate limiter backends
//!
//! Both backends count charged units per key in fixed windows. The memory
//! backend covers one process; the Redis backend shares the window across
//! every process pointed at the same server, using a server-side script so
//! the increment and the window expiry are atomic under concurrent
//! writers.

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::LimiterError;
use crate::limiter::{LimitCheck, RateLimiter};

/// Process-local fixed-window limiter
pub struct MemoryRateLimiter {
    limit: u64,
    window: Duration,
    slots: Mutex<HashMap<String, WindowSlot>>,
}

struct WindowSlot {
    started: Instant,
    charged: u64,
}

impl MemoryRateLimiter {
    /// Create a limiter allowing `limit` units per `window` per key
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, key: &str, amount: u64) -> Result<LimitCheck, LimiterError> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let slot = slots.entry(key.to_string()).or_insert(WindowSlot {
            started: now,
            charged: 0,
        });
        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.charged = 0;
        }
        slot.charged = slot.charged.saturating_add(amount);
        let current = slot.charged;

        Ok(LimitCheck {
            current,
            limit: self.limit,
            window: self.window,
            over: current > self.limit,
        })
    }
}

/// Atomically increments the window counter and starts the window expiry
/// on first touch. Returns the post-increment total.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCRBY', KEYS[1], ARGV[1])
if current == tonumber(ARGV[1]) then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return current
"#;

/// Cluster-shared fixed-window limiter backed by Redis
pub struct RedisRateLimiter {
    connection: ConnectionManager,
    key_prefix: String,
    limit: u64,
    window: Duration,
    script: redis::Script,
}

impl RedisRateLimiter {
    /// Create a limiter allowing `limit` units per `window` per key,
    /// namespaced under `key_prefix`
    pub fn new(connection: ConnectionManager, key_prefix: &str, limit: u64, window: Duration) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.to_string(),
            limit,
            window,
            script: redis::Script::new(WINDOW_SCRIPT),
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str, amount: u64) -> Result<LimitCheck, LimiterError> {
        let mut conn = self.connection.clone();
        let window_ms = self.window.as_millis() as u64;
        let current: u64 = self
            .script
            .key(format!("{}:window:{}", self.key_prefix, key))
            .arg(amount)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(LimitCheck {
            current,
            limit: self.limit,
            window: self.window,
            over: current > self.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_window_counts_and_flags_overage() {
        let limiter = MemoryRateLimiter::new(10, Duration::from_secs(60));

        let check = limiter.check("core", 4).await.unwrap();
        assert_eq!(check.current, 4);
        assert!(!check.over);
        assert_eq!(check.remaining(), 6);

        let check = limiter.check("core", 8).await.unwrap();
        assert_eq!(check.current, 12);
        assert!(check.over);
        assert_eq!(check.overage(), 2);
    }

    #[tokio::test]
    async fn test_memory_windows_are_keyed_independently() {
        let limiter = MemoryRateLimiter::new(5, Duration::from_secs(60));
        limiter.check("a", 5).await.unwrap();

        let check = limiter.check("b", 1).await.unwrap();
        assert_eq!(check.current, 1);
        assert!(!check.over);
    }

    #[tokio::test]
    async fn test_memory_window_resets_after_expiry() {
        let limiter = MemoryRateLimiter::new(5, Duration::from_millis(20));
        limiter.check("core", 5).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let check = limiter.check("core", 1).await.unwrap();
        assert_eq!(check.current, 1);
        assert!(!check.over);
    }

    #[tokio::test]
    async fn test_redis_window_shared_counter() {
        // Skip test if Redis is not available
        let client = match redis::Client::open("redis://127.0.0.1:6379") {
            Ok(c) => c,
            Err(_) => return,
        };
        let Ok(connection) = ConnectionManager::new(client).await else {
            println!("Redis not available, skipping test");
            return;
        };

        let prefix = format!("herder-test-{}", uuid::Uuid::new_v4());
        let limiter = RedisRateLimiter::new(connection, &prefix, 10, Duration::from_secs(5));

        let first = limiter.check("core", 6).await.unwrap();
        let second = limiter.check("core", 6).await.unwrap();
        assert_eq!(first.current, 6);
        assert!(!first.over);
        assert_eq!(second.current, 12);
        assert!(second.over);
    }
}
