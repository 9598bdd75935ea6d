//! Redis-backed transport queue
//!
//! One Redis list per queue holds pending requests; popped requests move
//! into an in-flight hash keyed by delivery id until they are
//! acknowledged, abandoned, or deferred. Deferred requests wait in a
//! sorted set scored by their due time and are promoted back to the
//! pending list on pop.

use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueInfo, TransportQueue};
use crate::request::Request;

/// Default redelivery delay for deferred requests
const DEFAULT_DEFER_DELAY: Duration = Duration::from_secs(30);

/// Moves due entries from the deferred set back onto the pending list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, item in ipairs(due) do
  redis.call('ZREM', KEYS[1], item)
  redis.call('RPUSH', KEYS[2], item)
end
return #due
"#;

/// Cluster-shared transport queue backed by Redis
pub struct RedisQueue {
    name: String,
    connection: ConnectionManager,
    key_prefix: String,
    defer_delay: Duration,
    promote: redis::Script,
}

impl RedisQueue {
    pub fn new(name: &str, connection: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            connection,
            key_prefix: key_prefix.to_string(),
            defer_delay: DEFAULT_DEFER_DELAY,
            promote: redis::Script::new(PROMOTE_SCRIPT),
        }
    }

    /// Override the redelivery delay used by `defer`
    pub fn with_defer_delay(mut self, delay: Duration) -> Self {
        self.defer_delay = delay;
        self
    }

    fn pending_key(&self) -> String {
        format!("{}:{}:pending", self.key_prefix, self.name)
    }

    fn in_flight_key(&self) -> String {
        format!("{}:{}:working", self.key_prefix, self.name)
    }

    fn deferred_key(&self) -> String {
        format!("{}:{}:deferred", self.key_prefix, self.name)
    }

    fn encode(request: &Request) -> QueueResult<String> {
        serde_json::to_string(request).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn decode(payload: &str) -> QueueResult<Request> {
        serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    /// Remove a request from the in-flight hash, returning its payload
    async fn take_in_flight(&self, request: &Request) -> QueueResult<Option<String>> {
        let mut conn = self.connection.clone();
        let payload: Option<String> = redis::cmd("HGET")
            .arg(self.in_flight_key())
            .arg(&request.id)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("HDEL")
            .arg(self.in_flight_key())
            .arg(&request.id)
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }
}

#[async_trait::async_trait]
impl TransportQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, requests: Vec<Request>) -> QueueResult<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(self.pending_key());
        for request in &requests {
            cmd.arg(Self::encode(request)?);
        }
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn pop(&self) -> QueueResult<Option<Request>> {
        let mut conn = self.connection.clone();

        let _promoted: i64 = self
            .promote
            .key(self.deferred_key())
            .key(self.pending_key())
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let payload: Option<String> = redis::cmd("LPOP")
            .arg(self.pending_key())
            .query_async(&mut conn)
            .await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let request = Self::decode(&payload)?;

        let _: () = redis::cmd("HSET")
            .arg(self.in_flight_key())
            .arg(&request.id)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(Some(request))
    }

    async fn done(&self, request: &Request) -> QueueResult<()> {
        self.take_in_flight(request).await?;
        Ok(())
    }

    async fn abandon(&self, request: &Request) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        // Requeue the caller's view of the request (attempt count may
        // have moved on from the stored payload).
        self.take_in_flight(request).await?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.pending_key())
            .arg(Self::encode(request)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn defer(&self, request: &Request) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        self.take_in_flight(request).await?;
        let due = chrono::Utc::now().timestamp_millis() + self.defer_delay.as_millis() as i64;
        let _: i64 = redis::cmd("ZADD")
            .arg(self.deferred_key())
            .arg(due)
            .arg(Self::encode(request)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn flush(&self) -> QueueResult<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.pending_key())
            .arg(self.in_flight_key())
            .arg(self.deferred_key())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn info(&self) -> QueueResult<QueueInfo> {
        let mut conn = self.connection.clone();
        let pending: u64 = redis::cmd("LLEN")
            .arg(self.pending_key())
            .query_async(&mut conn)
            .await?;
        let deferred: u64 = redis::cmd("ZCARD")
            .arg(self.deferred_key())
            .query_async(&mut conn)
            .await?;
        Ok(QueueInfo {
            name: self.name.clone(),
            count: pending + deferred,
        })
    }
}
