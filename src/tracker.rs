//! Cluster-wide at-most-once request admission
//!
//! A request key is claimed by writing a TTL-tagged marker into a shared
//! store; the check-then-act window is guarded by a distributed lock so
//! concurrent claimants serialize and at most one executes the guarded
//! operation. Tag existence means "in flight or recently completed" —
//! later claimants bounce instead of repeating the work.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LockError, Result, TrackerError};
use crate::lock::LockProvider;
use crate::request::Request;

/// Options for the request tracker
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Namespace for tag and lock keys in the shared store
    pub key_prefix: String,
    /// TTL of the guard lock around check-then-act
    pub lock_ttl: Duration,
    /// How long a claimed key stays claimed
    pub tag_ttl: Duration,
    /// Pause between lock acquisition retries while a concurrent
    /// claimant holds the guard
    pub lock_retry_delay: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            key_prefix: "herder:track".to_string(),
            lock_ttl: Duration::from_secs(2),
            tag_ttl: Duration::from_secs(600),
            lock_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Outcome of a tracked execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked<T> {
    /// This caller won the claim and ran the operation
    Executed(T),
    /// Another claimant holds an unexpired tag for the key; the
    /// operation was not invoked. Not an error.
    Bounced,
}

/// Shared TTL-tag store contract
#[async_trait::async_trait]
pub trait TagStore: Send + Sync {
    /// Read the claim timestamp for a key, if present
    async fn get(&self, key: &str) -> std::result::Result<Option<i64>, TrackerError>;

    /// Write a claim timestamp if the key is absent; true when written
    async fn set_nx(
        &self,
        key: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> std::result::Result<bool, TrackerError>;

    /// Remove a claim
    async fn del(&self, key: &str) -> std::result::Result<(), TrackerError>;

    /// Atomically remove every key matching `pattern`; returns how many
    async fn del_matching(&self, pattern: &str) -> std::result::Result<u64, TrackerError>;
}

/// Guards units of work with a distributed lock plus TTL-tagged markers
pub struct DistributedRequestTracker {
    locks: Arc<dyn LockProvider>,
    tags: Arc<dyn TagStore>,
    options: TrackerOptions,
}

impl DistributedRequestTracker {
    pub fn new(
        locks: Arc<dyn LockProvider>,
        tags: Arc<dyn TagStore>,
        options: TrackerOptions,
    ) -> Self {
        Self {
            locks,
            tags,
            options,
        }
    }

    fn tag_key(&self, request: &Request) -> String {
        format!("{}:{}", self.options.key_prefix, request.identity())
    }

    /// Acquire the guard lock, waiting out a concurrent claimant.
    ///
    /// Contention is retried for up to two lock TTLs (the longest a
    /// healthy holder can keep the guard); persistent contention or a
    /// backend failure propagates to the caller.
    async fn acquire_guard(&self, lock_key: &str) -> std::result::Result<crate::lock::LockHandle, TrackerError> {
        let deadline = std::time::Instant::now() + self.options.lock_ttl * 2;
        loop {
            match self.locks.lock(lock_key, self.options.lock_ttl).await {
                Ok(handle) => return Ok(handle),
                Err(LockError::Contended { .. }) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(self.options.lock_retry_delay).await;
                }
                Err(e) => return Err(TrackerError::Lock(e)),
            }
        }
    }

    async fn release_guard(&self, handle: crate::lock::LockHandle) {
        let key = handle.key.clone();
        if let Err(e) = self.locks.unlock(handle).await {
            // The lock's own TTL bounds how long a failed release can
            // block other claimants.
            tracing::warn!(key = %key, error = %e, "failed to release tracker guard lock");
        }
    }

    /// Run `operation` for this request unless the key is already
    /// claimed cluster-wide.
    ///
    /// Holding the guard lock: an unexpired tag bounces the request
    /// without invoking `operation`; otherwise `operation` runs and, on
    /// success, the key is tagged. A failed tag write is logged and
    /// swallowed — duplicate admission is an acceptable degradation,
    /// losing the operation's result is not. The lock is released on
    /// every exit path.
    pub async fn track<T, F, Fut>(&self, request: &Request, operation: F) -> Result<Tracked<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tag_key = self.tag_key(request);
        let lock_key = format!("{tag_key}-lock");
        let guard = self.acquire_guard(&lock_key).await?;
        let outcome = self.guarded(&tag_key, operation).await;
        self.release_guard(guard).await;
        outcome
    }

    async fn guarded<T, F, Fut>(&self, tag_key: &str, operation: F) -> Result<Tracked<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let existing = self
            .tags
            .get(tag_key)
            .await
            .map_err(|e| TrackerError::TagRead {
                key: tag_key.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(stamp_ms) = existing {
            let expires = stamp_ms + self.options.tag_ttl.as_millis() as i64;
            if Utc::now().timestamp_millis() < expires {
                tracing::debug!(key = tag_key, "request already claimed, bouncing");
                return Ok(Tracked::Bounced);
            }
        }

        let value = operation().await?;

        let stamp = Utc::now().timestamp_millis();
        if let Err(e) = self.tags.set_nx(tag_key, stamp, self.options.tag_ttl).await {
            tracing::warn!(
                key = tag_key,
                error = %e,
                "tag write failed after successful operation; duplicate admission possible"
            );
        }
        Ok(Tracked::Executed(value))
    }

    /// Clear the claim for a completed request so the key can be
    /// legitimately reprocessed before the tag TTL runs out.
    ///
    /// A removal failure is propagated: a stale tag silently blocks
    /// future work for the whole TTL, so this is a correctness problem,
    /// not bookkeeping.
    pub async fn untrack(&self, request: &Request) -> Result<()> {
        let tag_key = self.tag_key(request);
        let lock_key = format!("{tag_key}-lock");
        let guard = self.acquire_guard(&lock_key).await?;
        let outcome = self
            .tags
            .del(&tag_key)
            .await
            .map_err(|e| TrackerError::TagRemove {
                key: tag_key.clone(),
                reason: e.to_string(),
            });
        self.release_guard(guard).await;

        if let Err(ref e) = outcome {
            tracing::error!(
                key = %tag_key,
                error = %e,
                "tag removal failed; key stays blocked until the tag expires"
            );
        }
        outcome.map_err(Into::into)
    }

    /// Administrative bulk delete of every tag under this tracker's
    /// prefix; returns how many were removed.
    pub async fn flush(&self) -> Result<u64> {
        let pattern = format!("{}:*", self.options.key_prefix);
        let removed = self
            .tags
            .del_matching(&pattern)
            .await
            .map_err(|e| TrackerError::Flush(e.to_string()))?;
        tracing::info!(removed, "flushed tracker tags");
        Ok(removed)
    }
}

/// Removes every key matching the pattern in one atomic server-side
/// pass, so concurrent writers never observe a partial flush.
const FLUSH_SCRIPT: &str = r#"
local cursor = '0'
local removed = 0
repeat
  local result = redis.call('SCAN', cursor, 'MATCH', ARGV[1], 'COUNT', 500)
  cursor = result[1]
  for _, key in ipairs(result[2]) do
    redis.call('DEL', key)
    removed = removed + 1
  end
until cursor == '0'
return removed
"#;

/// Redis-backed tag store
pub struct RedisTagStore {
    connection: ConnectionManager,
    flush: redis::Script,
}

impl RedisTagStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            flush: redis::Script::new(FLUSH_SCRIPT),
        }
    }
}

#[async_trait::async_trait]
impl TagStore for RedisTagStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<i64>, TrackerError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    async fn set_nx(
        &self,
        key: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> std::result::Result<bool, TrackerError> {
        let mut conn = self.connection.clone();
        let written: bool = redis::cmd("SET")
            .arg(key)
            .arg(timestamp)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(written)
    }

    async fn del(&self, key: &str) -> std::result::Result<(), TrackerError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> std::result::Result<u64, TrackerError> {
        let mut conn = self.connection.clone();
        let removed: u64 = self
            .flush
            .arg(pattern)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

/// Process-local tag store with the same TTL semantics
pub struct MemoryTagStore {
    tags: Mutex<HashMap<String, (i64, DateTime<Utc>)>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self {
            tags: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTagStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TagStore for MemoryTagStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<i64>, TrackerError> {
        let tags = self.tags.lock();
        Ok(tags
            .get(key)
            .filter(|(_, expires)| *expires > Utc::now())
            .map(|(stamp, _)| *stamp))
    }

    async fn set_nx(
        &self,
        key: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> std::result::Result<bool, TrackerError> {
        let mut tags = self.tags.lock();
        let now = Utc::now();
        if let Some((_, expires)) = tags.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        let expires = now + ChronoDuration::milliseconds(ttl.as_millis() as i64);
        tags.insert(key.to_string(), (timestamp, expires));
        Ok(true)
    }

    async fn del(&self, key: &str) -> std::result::Result<(), TrackerError> {
        self.tags.lock().remove(key);
        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> std::result::Result<u64, TrackerError> {
        let prefix = pattern.trim_end_matches('*');
        let mut tags = self.tags.lock();
        let before = tags.len();
        tags.retain(|key, _| !key.starts_with(prefix));
        Ok((before - tags.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Tag store double that fails selected operations
    struct FlakyTagStore {
        inner: MemoryTagStore,
        fail_get: bool,
        fail_set: bool,
        fail_del: bool,
    }

    impl FlakyTagStore {
        fn new() -> Self {
            Self {
                inner: MemoryTagStore::new(),
                fail_get: false,
                fail_set: false,
                fail_del: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl TagStore for FlakyTagStore {
        async fn get(&self, key: &str) -> std::result::Result<Option<i64>, TrackerError> {
            if self.fail_get {
                return Err(TrackerError::Store("injected get failure".into()));
            }
            self.inner.get(key).await
        }

        async fn set_nx(
            &self,
            key: &str,
            timestamp: i64,
            ttl: Duration,
        ) -> std::result::Result<bool, TrackerError> {
            if self.fail_set {
                return Err(TrackerError::Store("injected set failure".into()));
            }
            self.inner.set_nx(key, timestamp, ttl).await
        }

        async fn del(&self, key: &str) -> std::result::Result<(), TrackerError> {
            if self.fail_del {
                return Err(TrackerError::Store("injected del failure".into()));
            }
            self.inner.del(key).await
        }

        async fn del_matching(&self, pattern: &str) -> std::result::Result<u64, TrackerError> {
            self.inner.del_matching(pattern).await
        }
    }

    /// Lock provider double that counts acquisitions and releases
    struct CountingLockProvider {
        inner: MemoryLockProvider,
        locks: AtomicU32,
        unlocks: AtomicU32,
    }

    impl CountingLockProvider {
        fn new() -> Self {
            Self {
                inner: MemoryLockProvider::new(),
                locks: AtomicU32::new(0),
                unlocks: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LockProvider for CountingLockProvider {
        async fn lock(
            &self,
            key: &str,
            ttl: Duration,
        ) -> std::result::Result<crate::lock::LockHandle, LockError> {
            let handle = self.inner.lock(key, ttl).await?;
            self.locks.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        }

        async fn unlock(
            &self,
            handle: crate::lock::LockHandle,
        ) -> std::result::Result<(), LockError> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            self.inner.unlock(handle).await
        }
    }

    fn tracker_with(tags: Arc<dyn TagStore>) -> DistributedRequestTracker {
        DistributedRequestTracker::new(Arc::new(MemoryLockProvider::new()), tags, TrackerOptions::default())
    }

    fn request() -> Request {
        Request::new("repo", "https://api.example.com/repos/acme/widget")
    }

    #[tokio::test]
    async fn test_executes_then_bounces_within_ttl() {
        let tracker = tracker_with(Arc::new(MemoryTagStore::new()));
        let req = request();
        let calls = AtomicU32::new(0);

        let first = tracker
            .track(&req, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(41)
            })
            .await
            .unwrap();
        assert_eq!(first, Tracked::Executed(41));

        let second = tracker
            .track(&req, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(second, Tracked::Bounced);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_tracks_execute_exactly_once() {
        let locks = Arc::new(CountingLockProvider::new());
        let tracker = Arc::new(DistributedRequestTracker::new(
            locks.clone(),
            Arc::new(MemoryTagStore::new()),
            TrackerOptions::default(),
        ));
        let req = request();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let tracker = Arc::clone(&tracker);
            let req = req.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                tracker
                    .track(&req, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        let mut executed = 0;
        let mut bounced = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Tracked::Executed(()) => executed += 1,
                Tracked::Bounced => bounced += 1,
            }
        }
        assert_eq!(executed, 1);
        assert_eq!(bounced, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // One lock/unlock pair per track call.
        assert_eq!(locks.locks.load(Ordering::SeqCst), 2);
        assert_eq!(locks.unlocks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_read_failure_rejects_without_invoking() {
        let mut tags = FlakyTagStore::new();
        tags.fail_get = true;
        let tracker = tracker_with(Arc::new(tags));
        let calls = AtomicU32::new(0);

        let result = tracker
            .track(&request(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operation_failure_writes_no_tag() {
        let tags = Arc::new(MemoryTagStore::new());
        let tracker = tracker_with(tags.clone());
        let req = request();

        let result: Result<Tracked<()>> = tracker
            .track(&req, || async {
                Err(crate::error::HerderError::Processing {
                    key: "k".into(),
                    reason: "boom".into(),
                })
            })
            .await;
        assert!(result.is_err());

        // No tag written: the next claim executes.
        let retried = tracker.track(&req, || async { Ok(7) }).await.unwrap();
        assert_eq!(retried, Tracked::Executed(7));
    }

    #[tokio::test]
    async fn test_tag_write_failure_still_returns_result() {
        let mut tags = FlakyTagStore::new();
        tags.fail_set = true;
        let tracker = tracker_with(Arc::new(tags));

        let outcome = tracker.track(&request(), || async { Ok(9) }).await.unwrap();
        assert_eq!(outcome, Tracked::Executed(9));
    }

    #[tokio::test]
    async fn test_untrack_failure_propagates() {
        let mut tags = FlakyTagStore::new();
        tags.fail_del = true;
        let tracker = tracker_with(Arc::new(tags));

        let result = tracker.untrack(&request()).await;
        assert!(matches!(
            result,
            Err(crate::error::HerderError::Tracker(TrackerError::TagRemove { .. }))
        ));
    }

    #[tokio::test]
    async fn test_untrack_frees_the_key() {
        let tracker = tracker_with(Arc::new(MemoryTagStore::new()));
        let req = request();

        tracker.track(&req, || async { Ok(()) }).await.unwrap();
        tracker.untrack(&req).await.unwrap();

        let outcome = tracker.track(&req, || async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, Tracked::Executed(()));
    }

    #[tokio::test]
    async fn test_flush_clears_all_tags() {
        let tags = Arc::new(MemoryTagStore::new());
        let tracker = tracker_with(tags.clone());

        let a = Request::new("repo", "https://api.example.com/repos/a");
        let b = Request::new("repo", "https://api.example.com/repos/b");
        tracker.track(&a, || async { Ok(()) }).await.unwrap();
        tracker.track(&b, || async { Ok(()) }).await.unwrap();

        assert_eq!(tracker.flush().await.unwrap(), 2);
        let again = tracker.track(&a, || async { Ok(()) }).await.unwrap();
        assert_eq!(again, Tracked::Executed(()));
    }
}
