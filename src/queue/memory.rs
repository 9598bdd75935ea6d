//! In-memory transport queue
//!
//! Single-process backend with the same delivery semantics as the Redis
//! transport: popped requests stay in flight until `done`/`abandon`/
//! `defer`, and deferred requests become visible again after the delay.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::QueueResult;
use crate::queue::{QueueInfo, TransportQueue};
use crate::request::Request;

/// Default redelivery delay for deferred requests
pub const DEFAULT_DEFER_DELAY: Duration = Duration::from_secs(30);

struct MemoryState {
    pending: VecDeque<Request>,
    in_flight: HashMap<String, Request>,
    deferred: Vec<(DateTime<Utc>, Request)>,
}

/// Process-local transport queue
pub struct MemoryQueue {
    name: String,
    defer_delay: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        Self::with_defer_delay(name, DEFAULT_DEFER_DELAY)
    }

    pub fn with_defer_delay(name: &str, defer_delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            defer_delay,
            state: Mutex::new(MemoryState {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                deferred: Vec::new(),
            }),
        }
    }

    fn promote_due(state: &mut MemoryState) {
        let now = Utc::now();
        let mut still_deferred = Vec::new();
        for (due, request) in state.deferred.drain(..) {
            if due <= now {
                state.pending.push_back(request);
            } else {
                still_deferred.push((due, request));
            }
        }
        state.deferred = still_deferred;
    }
}

#[async_trait::async_trait]
impl TransportQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, requests: Vec<Request>) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.pending.extend(requests);
        Ok(())
    }

    async fn pop(&self) -> QueueResult<Option<Request>> {
        let mut state = self.state.lock();
        Self::promote_due(&mut state);
        let Some(request) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(request.id.clone(), request.clone());
        Ok(Some(request))
    }

    async fn done(&self, request: &Request) -> QueueResult<()> {
        self.state.lock().in_flight.remove(&request.id);
        Ok(())
    }

    async fn abandon(&self, request: &Request) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&request.id);
        state.pending.push_back(request.clone());
        Ok(())
    }

    async fn defer(&self, request: &Request) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&request.id);
        let due = Utc::now() + ChronoDuration::milliseconds(self.defer_delay.as_millis() as i64);
        state.deferred.push((due, request.clone()));
        Ok(())
    }

    async fn flush(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.in_flight.clear();
        state.deferred.clear();
        Ok(())
    }

    async fn info(&self) -> QueueResult<QueueInfo> {
        let state = self.state.lock();
        Ok(QueueInfo {
            name: self.name.clone(),
            count: (state.pending.len() + state.deferred.len()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_pop_and_done() {
        let queue = MemoryQueue::new("normal");
        let a = Request::new("repo", "https://api.example.com/repos/a");
        let b = Request::new("repo", "https://api.example.com/repos/b");
        queue.push(vec![a.clone(), b.clone()]).await.unwrap();

        let first = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        queue.done(&first).await.unwrap();

        assert_eq!(queue.info().await.unwrap().count, 1);
        let second = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.id, b.id);
    }

    #[tokio::test]
    async fn test_abandon_requeues_immediately() {
        let queue = MemoryQueue::new("normal");
        let req = Request::new("repo", "https://api.example.com/repos/a");
        queue.push(vec![req.clone()]).await.unwrap();

        let popped = queue.pop().await.unwrap().unwrap();
        queue.abandon(&popped).await.unwrap();

        assert_eq!(queue.pop().await.unwrap().unwrap().id, req.id);
    }

    #[tokio::test]
    async fn test_defer_hides_until_delay_elapses() {
        let queue = MemoryQueue::with_defer_delay("normal", Duration::from_millis(20));
        let req = Request::new("repo", "https://api.example.com/repos/a");
        queue.push(vec![req.clone()]).await.unwrap();

        let popped = queue.pop().await.unwrap().unwrap();
        queue.defer(&popped).await.unwrap();
        assert!(queue.pop().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.pop().await.unwrap().unwrap().id, req.id);
    }

    #[tokio::test]
    async fn test_flush_empties_everything() {
        let queue = MemoryQueue::new("normal");
        queue
            .push(vec![
                Request::new("repo", "https://api.example.com/repos/a"),
                Request::new("repo", "https://api.example.com/repos/b"),
            ])
            .await
            .unwrap();
        queue.flush().await.unwrap();
        assert_eq!(queue.info().await.unwrap().count, 0);
        assert!(queue.pop().await.unwrap().is_none());
    }
}
