//! Short-window duplicate suppression for pushes
//!
//! The same edge is often discovered twice within moments (two source
//! documents pointing at one entity). A small local cache of recently
//! pushed identity keys absorbs those bursts before they cost a
//! transport round-trip or a tracker claim; the cluster-wide dedup
//! window stays the tracker's job.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::QueueResult;
use crate::queue::{QueueInfo, TransportQueue};
use crate::request::Request;

/// Options for push attenuation
#[derive(Debug, Clone)]
pub struct AttenuationOptions {
    /// Suppression window for a repeated identity key
    pub ttl: Duration,
}

impl Default for AttenuationOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3),
        }
    }
}

/// Transport decorator that drops recently pushed duplicates
pub struct AttenuatedQueue {
    inner: Arc<dyn TransportQueue>,
    options: AttenuationOptions,
    recent: Mutex<HashMap<String, Instant>>,
}

impl AttenuatedQueue {
    pub fn new(inner: Arc<dyn TransportQueue>, options: AttenuationOptions) -> Self {
        Self {
            inner,
            options,
            recent: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl TransportQueue for AttenuatedQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Push is a successful no-op for any request whose identity key was
    /// pushed within the attenuation window
    async fn push(&self, requests: Vec<Request>) -> QueueResult<()> {
        let kept = {
            let mut recent = self.recent.lock();
            let now = Instant::now();
            recent.retain(|_, pushed| now.duration_since(*pushed) < self.options.ttl);

            let mut kept = Vec::with_capacity(requests.len());
            for request in requests {
                let key = request.identity();
                if recent.contains_key(&key) {
                    tracing::debug!(key = %key, queue = self.inner.name(), "attenuated duplicate push");
                    continue;
                }
                recent.insert(key, now);
                kept.push(request);
            }
            kept
        };
        if kept.is_empty() {
            return Ok(());
        }
        self.inner.push(kept).await
    }

    async fn pop(&self) -> QueueResult<Option<Request>> {
        self.inner.pop().await
    }

    async fn done(&self, request: &Request) -> QueueResult<()> {
        self.inner.done(request).await
    }

    async fn abandon(&self, request: &Request) -> QueueResult<()> {
        self.inner.abandon(request).await
    }

    async fn defer(&self, request: &Request) -> QueueResult<()> {
        self.inner.defer(request).await
    }

    async fn flush(&self) -> QueueResult<()> {
        self.recent.lock().clear();
        self.inner.flush().await
    }

    async fn info(&self) -> QueueResult<QueueInfo> {
        self.inner.info().await
    }
}
