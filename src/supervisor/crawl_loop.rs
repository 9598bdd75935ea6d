//! Worker loop
//!
//! One loop drives one unit of work at a time: pop from the weighted
//! queue set, borrow a credential, execute under the cluster-wide guard,
//! settle the request back into its chain, account the observed cost
//! against the compute budget. Stopping is cooperative: the supervisor
//! sets the delay to a negative sentinel and the loop unwinds between
//! iterations.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LoopError, Result};
use crate::limiter::ComputeBudgetLimiter;
use crate::processor::Processor;
use crate::queue::{PriorityQueueSet, QueueChain};
use crate::request::{Disposition, Request};
use crate::token::{RateLimitedTokenPool, TokenGrant};
use crate::tracker::Tracked;

/// Delay value that signals a loop to stop
pub const STOP_SENTINEL_MS: i64 = -1;

/// Lifecycle of a worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Unstarted,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Unstarted => write!(f, "unstarted"),
            LoopState::Running => write!(f, "running"),
            LoopState::Stopping => write!(f, "stopping"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared collaborators every loop drives
#[derive(Clone)]
pub struct LoopContext {
    pub queues: Arc<PriorityQueueSet>,
    pub tokens: Arc<RateLimitedTokenPool>,
    pub compute: Arc<ComputeBudgetLimiter>,
    pub processor: Arc<dyn Processor>,
    /// Pause when the queue set has no work
    pub idle_delay: Duration,
}

/// A single supervised worker loop
pub struct CrawlLoop {
    name: String,
    delay_ms: AtomicI64,
    state: parking_lot::Mutex<LoopState>,
}

impl CrawlLoop {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay_ms: AtomicI64::new(delay.as_millis() as i64),
            state: parking_lot::Mutex::new(LoopState::Unstarted),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    /// Current inter-iteration delay; negative means stop requested
    pub fn delay_ms(&self) -> i64 {
        self.delay_ms.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as i64, Ordering::SeqCst);
    }

    /// Request a cooperative stop; the loop observes the sentinel
    /// between iterations and unwinds on its own
    pub fn stop(&self) {
        self.delay_ms.store(STOP_SENTINEL_MS, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == LoopState::Running {
            *state = LoopState::Stopping;
        }
    }

    /// Drive the loop until stopped.
    ///
    /// Calling this on a loop that already left the unstarted state is a
    /// programmer error and fails before the first iteration.
    pub async fn run(self: Arc<Self>, ctx: LoopContext) -> std::result::Result<(), LoopError> {
        {
            let mut state = self.state.lock();
            if *state != LoopState::Unstarted {
                return Err(LoopError::AlreadyStarted {
                    name: self.name.clone(),
                });
            }
            *state = LoopState::Running;
        }
        tracing::info!(name = %self.name, "loop started");

        loop {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay < 0 {
                break;
            }
            if let Err(e) = self.iteration(&ctx).await {
                tracing::error!(name = %self.name, error = %e, "loop iteration failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
        }

        *self.state.lock() = LoopState::Stopped;
        tracing::info!(name = %self.name, "loop stopped");
        Ok(())
    }

    async fn iteration(&self, ctx: &LoopContext) -> Result<()> {
        match ctx.queues.pop().await? {
            Some((chain, request)) => self.process_one(ctx, &chain, request).await,
            None => {
                tokio::time::sleep(ctx.idle_delay).await;
                Ok(())
            }
        }
    }

    async fn process_one(
        &self,
        ctx: &LoopContext,
        chain: &Arc<QueueChain>,
        mut request: Request,
    ) -> Result<()> {
        let trait_sets = request.token_traits();
        let token = match ctx
            .tokens
            .get_token(request.traffic_class(), &trait_sets)
            .await?
        {
            TokenGrant::Granted(token) => token,
            TokenGrant::RetryAt(until) => {
                tracing::debug!(
                    name = %self.name,
                    key = %request.identity(),
                    %until,
                    "all matching credentials benched, deferring"
                );
                chain.defer(&request).await?;
                return Ok(());
            }
            TokenGrant::NoMatch => {
                tracing::error!(
                    name = %self.name,
                    key = %request.identity(),
                    "no credential carries the required traits, deferring"
                );
                chain.defer(&request).await?;
                return Ok(());
            }
        };

        let started = Instant::now();
        let outcome = chain
            .execute(&request, || ctx.processor.process(&request, &token))
            .await;
        let elapsed = started.elapsed();

        // Account the observed cost; a failure here degrades throttling
        // accuracy, never the outcome of the work itself.
        let pool = Arc::clone(ctx.tokens.pool());
        let charged = ctx
            .compute
            .consume(request.traffic_class(), elapsed, Duration::ZERO, |reset| {
                pool.exhaust(&token, reset).unwrap_or(reset)
            })
            .await;
        if let Err(e) = charged {
            tracing::warn!(name = %self.name, error = %e, "compute budget accounting failed");
        }

        match outcome {
            Ok(Tracked::Executed(Disposition::Completed)) => {
                chain.complete(&request).await?;
            }
            Ok(Tracked::Executed(Disposition::Requeue)) => {
                self.requeue(chain, &mut request).await?;
            }
            Ok(Tracked::Executed(Disposition::Defer)) => {
                chain.defer(&request).await?;
            }
            Ok(Tracked::Bounced) => {
                tracing::debug!(
                    name = %self.name,
                    key = %request.identity(),
                    "request already claimed elsewhere, discarding delivery"
                );
                chain.discard(&request).await?;
            }
            Err(e) => {
                tracing::warn!(
                    name = %self.name,
                    key = %request.identity(),
                    error = %e,
                    "processing failed"
                );
                self.requeue(chain, &mut request).await?;
            }
        }
        Ok(())
    }

    async fn requeue(&self, chain: &Arc<QueueChain>, request: &mut Request) -> Result<()> {
        request.mark_attempt();
        if request.attempts_exhausted() {
            // Deadletter capture hangs off this point in the full system.
            tracing::error!(
                name = %self.name,
                key = %request.identity(),
                attempts = request.attempt_count,
                "dropping request after repeated failures"
            );
            chain.discard(request).await?;
        } else {
            chain.abandon(request).await?;
        }
        Ok(())
    }
}
