//! Queue module for distributed work coordination
//!
//! Provides the transport queue abstraction crawl requests travel
//! through, backends for Redis (cluster-shared) and memory
//! (single-process), the decorators that give each named priority class
//! its delivery semantics, and the weighted set workers pop from.

mod attenuated;
mod memory;
mod redis_queue;
mod set;
mod tracked;

pub use attenuated::{AttenuatedQueue, AttenuationOptions};
pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;
pub use set::PriorityQueueSet;
pub use tracked::QueueChain;

use serde::{Deserialize, Serialize};

use crate::error::QueueResult;
use crate::request::Request;

/// Snapshot of a queue's depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Queue name
    pub name: String,
    /// Requests available or deferred, not counting in-flight ones
    pub count: u64,
}

/// Trait for transport queue implementations
#[async_trait::async_trait]
pub trait TransportQueue: Send + Sync {
    /// Name of the queue
    fn name(&self) -> &str;

    /// Enqueue a batch of requests
    async fn push(&self, requests: Vec<Request>) -> QueueResult<()>;

    /// Take the next available request, if any
    async fn pop(&self) -> QueueResult<Option<Request>>;

    /// Acknowledge successful processing
    async fn done(&self, request: &Request) -> QueueResult<()>;

    /// Return a request to the queue for immediate redelivery
    async fn abandon(&self, request: &Request) -> QueueResult<()>;

    /// Return a request to the queue for delayed redelivery
    async fn defer(&self, request: &Request) -> QueueResult<()>;

    /// Drop every request in the queue
    async fn flush(&self) -> QueueResult<()>;

    /// Get queue depth
    async fn info(&self) -> QueueResult<QueueInfo>;
}
