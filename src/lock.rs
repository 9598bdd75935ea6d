//! Distributed lock providers
//!
//! Short-lived mutual exclusion keyed by string, used by the request
//! tracker to guard its check-then-act window. The Redis provider
//! coordinates across processes; the memory provider covers
//! single-process runs and tests behind the same contract.
//!
//! Every lock carries a TTL so a crashed holder cannot wedge a key, and
//! an owner value so release cannot delete a successor's lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LockError, LockResult};

/// Handle returned by a successful acquisition; required for release
#[derive(Debug, Clone)]
pub struct LockHandle {
    /// The locked key
    pub key: String,
    /// Owner value proving this holder acquired the lock
    owner: String,
}

/// Distributed mutual exclusion contract
#[async_trait::async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquire the lock for `key`, failing with [`LockError::Contended`]
    /// when another holder owns it
    async fn lock(&self, key: &str, ttl: Duration) -> LockResult<LockHandle>;

    /// Release a held lock; a no-op if the lock already expired and was
    /// taken over by someone else
    async fn unlock(&self, handle: LockHandle) -> LockResult<()>;
}

/// Deletes the key only when it still holds our owner value.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed lock provider using SET NX PX
pub struct RedisLockProvider {
    connection: ConnectionManager,
    key_prefix: String,
    release: redis::Script,
}

impl RedisLockProvider {
    pub fn new(connection: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.to_string(),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }
}

#[async_trait::async_trait]
impl LockProvider for RedisLockProvider {
    async fn lock(&self, key: &str, ttl: Duration) -> LockResult<LockHandle> {
        let mut conn = self.connection.clone();
        let owner = Uuid::new_v4().to_string();

        // SET NX PX is atomic and succeeds only if the key was absent
        let acquired: bool = redis::cmd("SET")
            .arg(self.storage_key(key))
            .arg(&owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if !acquired {
            return Err(LockError::Contended {
                key: key.to_string(),
            });
        }
        Ok(LockHandle {
            key: key.to_string(),
            owner,
        })
    }

    async fn unlock(&self, handle: LockHandle) -> LockResult<()> {
        let mut conn = self.connection.clone();
        let _released: i64 = self
            .release
            .key(self.storage_key(&handle.key))
            .arg(&handle.owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Process-local lock provider with the same TTL semantics
pub struct MemoryLockProvider {
    held: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LockProvider for MemoryLockProvider {
    async fn lock(&self, key: &str, ttl: Duration) -> LockResult<LockHandle> {
        let mut held = self.held.lock();
        let now = Utc::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Err(LockError::Contended {
                    key: key.to_string(),
                });
            }
        }
        let owner = Uuid::new_v4().to_string();
        let expires = now + ChronoDuration::milliseconds(ttl.as_millis() as i64);
        held.insert(key.to_string(), (owner.clone(), expires));
        Ok(LockHandle {
            key: key.to_string(),
            owner,
        })
    }

    async fn unlock(&self, handle: LockHandle) -> LockResult<()> {
        let mut held = self.held.lock();
        if let Some((owner, _)) = held.get(&handle.key) {
            if *owner == handle.owner {
                held.remove(&handle.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_acquire_contend_release() {
        let locks = MemoryLockProvider::new();

        let handle = locks.lock("repo:a", Duration::from_secs(5)).await.unwrap();
        let contended = locks.lock("repo:a", Duration::from_secs(5)).await;
        assert!(matches!(contended, Err(LockError::Contended { .. })));

        locks.unlock(handle).await.unwrap();
        assert!(locks.lock("repo:a", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_lock_expires() {
        let locks = MemoryLockProvider::new();
        let _held = locks.lock("repo:a", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(locks.lock("repo:a", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_stale_release_keeps_successor() {
        let locks = MemoryLockProvider::new();
        let stale = locks.lock("repo:a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let _successor = locks.lock("repo:a", Duration::from_secs(5)).await.unwrap();
        locks.unlock(stale).await.unwrap();

        // The successor's lock must survive the stale holder's release.
        assert!(matches!(
            locks.lock("repo:a", Duration::from_secs(5)).await,
            Err(LockError::Contended { .. })
        ));
    }

    #[tokio::test]
    async fn test_redis_lock_acquire_and_release() {
        // Skip test if Redis is not available
        let client = match redis::Client::open("redis://127.0.0.1:6379") {
            Ok(c) => c,
            Err(_) => return,
        };
        let Ok(connection) = ConnectionManager::new(client).await else {
            println!("Redis not available, skipping test");
            return;
        };

        let prefix = format!("herder-test-{}", Uuid::new_v4());
        let locks = RedisLockProvider::new(connection, &prefix);

        let handle = locks.lock("repo:a", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            locks.lock("repo:a", Duration::from_secs(5)).await,
            Err(LockError::Contended { .. })
        ));

        locks.unlock(handle).await.unwrap();
        let handle = locks.lock("repo:a", Duration::from_secs(5)).await.unwrap();
        locks.unlock(handle).await.unwrap();
    }
}
