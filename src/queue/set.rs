//! Weighted selection across named priority classes
//!
//! Workers see one logical pop surface; behind it each named queue chain
//! accrues credit proportional to its weight every selection round, and
//! the non-empty chain with the most credit is serviced. An empty
//! high-priority chain keeps its accrued credit, so a momentary lull
//! does not cost it future priority.

use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{QueueError, QueueResult};
use crate::queue::{QueueChain, QueueInfo};
use crate::request::Request;

struct WeightedChain {
    chain: Arc<QueueChain>,
    weight: i64,
    credit: i64,
}

/// Set of named queue chains serviced by weighted round-robin
pub struct PriorityQueueSet {
    queues: RwLock<Vec<WeightedChain>>,
}

impl PriorityQueueSet {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
        }
    }

    /// Admit a named queue chain with the given weight.
    ///
    /// Also used at runtime for classes that are not part of static
    /// configuration, like an event feed enabled after startup.
    pub async fn add_queue(&self, chain: Arc<QueueChain>, weight: u32) {
        let mut queues = self.queues.write().await;
        queues.push(WeightedChain {
            chain,
            weight: weight.max(1) as i64,
            credit: 0,
        });
    }

    /// Look up a chain by name
    pub async fn chain(&self, name: &str) -> Option<Arc<QueueChain>> {
        let queues = self.queues.read().await;
        queues
            .iter()
            .find(|q| q.chain.name() == name)
            .map(|q| Arc::clone(&q.chain))
    }

    /// Route a batch of requests to the named queue chain
    pub async fn push(&self, name: &str, requests: Vec<Request>) -> QueueResult<()> {
        let chain = self.chain(name).await.ok_or(QueueError::UnknownQueue {
            name: name.to_string(),
        })?;
        chain.push(requests).await
    }

    /// Pop the next unit of work according to the configured weights.
    ///
    /// Every call is one selection round: all chains accrue their
    /// weight, then chains are tried in descending credit order; the
    /// first with work is charged one round's worth of credit. Chains
    /// found empty keep what they accrued.
    pub async fn pop(&self) -> QueueResult<Option<(Arc<QueueChain>, Request)>> {
        let mut queues = self.queues.write().await;
        if queues.is_empty() {
            return Ok(None);
        }

        let round: i64 = queues.iter().map(|q| q.weight).sum();
        for queue in queues.iter_mut() {
            queue.credit += queue.weight;
        }

        let mut order: Vec<usize> = (0..queues.len()).collect();
        order.sort_by_key(|&i| Reverse(queues[i].credit));

        for &i in &order {
            if let Some(request) = queues[i].chain.pop().await? {
                queues[i].credit -= round;
                let chain = Arc::clone(&queues[i].chain);
                return Ok(Some((chain, request)));
            }
        }
        Ok(None)
    }

    /// Depth snapshot of every chain in the set
    pub async fn info_all(&self) -> QueueResult<Vec<QueueInfo>> {
        let queues = self.queues.read().await;
        let mut infos = Vec::with_capacity(queues.len());
        for queue in queues.iter() {
            infos.push(queue.chain.info().await?);
        }
        Ok(infos)
    }

    /// Drop every request from every chain
    pub async fn flush_all(&self) -> QueueResult<()> {
        let queues = self.queues.read().await;
        for queue in queues.iter() {
            queue.chain.flush().await?;
        }
        Ok(())
    }
}

impl Default for PriorityQueueSet {
    fn default() -> Self {
        Self::new()
    }
}
