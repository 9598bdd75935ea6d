//! Crawler supervisor
//!
//! Reconciles the running worker loops against the desired count,
//! applies live configuration changes, and rolls queue depths and loop
//! states up into an operator-facing status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{CrawlerOptions, CrawlerPatch};
use crate::error::{ConfigError, LoopError, Result};
use crate::queue::QueueInfo;
use crate::supervisor::crawl_loop::{CrawlLoop, LoopContext, LoopState};

/// Snapshot of one worker loop
#[derive(Debug, Clone, Serialize)]
pub struct LoopInfo {
    pub name: String,
    pub state: LoopState,
    pub delay_ms: i64,
}

/// System-wide status for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Queue depth per priority class
    pub queues: Vec<QueueInfo>,
    /// Worker loops owned by this supervisor
    pub loops: Vec<LoopInfo>,
    /// System health (idle, healthy, degraded, critical)
    pub health: String,
    /// Timestamp of this status
    pub timestamp: DateTime<Utc>,
    /// Messages/warnings for the operator
    pub messages: Vec<String>,
}

/// Subsystems with live connections re-provision through a hook instead
/// of having fields blindly patched
#[async_trait::async_trait]
pub trait Reconfigurable: Send + Sync {
    async fn reconfigure(&self, patch: Value) -> Result<()>;
}

struct LoopEntry {
    worker: Arc<CrawlLoop>,
    handle: JoinHandle<std::result::Result<(), LoopError>>,
}

/// Owns the pool of worker loops and their live configuration
pub struct CrawlerSupervisor {
    instance: String,
    ctx: LoopContext,
    options: RwLock<CrawlerOptions>,
    loops: Mutex<Vec<LoopEntry>>,
    loop_seq: AtomicU64,
    hooks: RwLock<HashMap<String, Arc<dyn Reconfigurable>>>,
    /// Raw option documents for subsystems without a reconfigure hook
    raw_options: RwLock<serde_json::Map<String, Value>>,
}

impl CrawlerSupervisor {
    pub fn new(instance: &str, ctx: LoopContext, options: CrawlerOptions) -> Self {
        Self {
            instance: instance.to_string(),
            ctx,
            options: RwLock::new(options),
            loops: Mutex::new(Vec::new()),
            loop_seq: AtomicU64::new(0),
            hooks: RwLock::new(HashMap::new()),
            raw_options: RwLock::new(serde_json::Map::new()),
        }
    }

    /// Current live options
    pub async fn options(&self) -> CrawlerOptions {
        self.options.read().await.clone()
    }

    /// Register a reconfigure hook for a named subsystem
    pub async fn register_hook(&self, subsystem: &str, hook: Arc<dyn Reconfigurable>) {
        self.hooks
            .write()
            .await
            .insert(subsystem.to_string(), hook);
    }

    /// Start (or scale up to) the desired number of loops
    pub async fn run(&self) -> Result<()> {
        self.ensure_loops().await
    }

    /// Stop every loop cooperatively and wait for natural completion
    pub async fn stop(&self) -> Result<()> {
        let entries: Vec<LoopEntry> = {
            let mut loops = self.loops.lock().await;
            loops.drain(..).collect()
        };
        for entry in &entries {
            entry.worker.stop();
        }
        for entry in entries {
            Self::join_loop(entry).await;
        }
        Ok(())
    }

    /// Reconcile running loops against the desired count.
    ///
    /// Idempotent; safe to invoke after every configuration change. A
    /// scale-down stops the excess oldest loops and waits for them to
    /// unwind on their own; a scale-up spawns the delta.
    pub async fn ensure_loops(&self) -> Result<()> {
        let (desired, delay) = {
            let options = self.options.read().await;
            (options.count, options.delay)
        };

        let mut loops = self.loops.lock().await;
        loops.retain(|entry| !entry.handle.is_finished());
        let running = loops.len();

        if running > desired {
            let excess: Vec<LoopEntry> = loops.drain(..running - desired).collect();
            drop(loops);
            tracing::info!(
                stopping = excess.len(),
                desired,
                "scaling down worker loops"
            );
            for entry in &excess {
                entry.worker.stop();
            }
            for entry in excess {
                Self::join_loop(entry).await;
            }
        } else if running < desired {
            tracing::info!(spawning = desired - running, desired, "scaling up worker loops");
            for _ in running..desired {
                let seq = self.loop_seq.fetch_add(1, Ordering::SeqCst);
                let name = format!("{}-loop-{}", self.instance, seq);
                let worker = Arc::new(CrawlLoop::new(&name, delay));
                let ctx = self.ctx.clone();
                let handle = tokio::spawn(Arc::clone(&worker).run(ctx));
                loops.push(LoopEntry { worker, handle });
            }
        }
        Ok(())
    }

    async fn join_loop(entry: LoopEntry) {
        let name = entry.worker.name().to_string();
        match entry.handle.await {
            Ok(Ok(())) => tracing::info!(name = %name, "loop completed"),
            Ok(Err(e)) => tracing::warn!(name = %name, error = %e, "loop ended with error"),
            Err(e) => tracing::warn!(name = %name, error = %e, "loop task failed to join"),
        }
    }

    /// Apply a field-level patch to the live crawler options.
    ///
    /// A count patch drives the loop pool: positive counts reconcile via
    /// `run`, zero stops the supervisor. Organization lists are
    /// case-folded on the way in.
    pub async fn reconfigure(&self, patch: CrawlerPatch) -> Result<()> {
        {
            let mut options = self.options.write().await;
            if let Some(delay_ms) = patch.delay_ms {
                options.delay = Duration::from_millis(delay_ms);
                let loops = self.loops.lock().await;
                for entry in loops.iter() {
                    entry.worker.set_delay(options.delay);
                }
            }
            if let Some(orgs) = &patch.org_list {
                options.org_list = orgs.iter().map(|o| o.to_lowercase()).collect();
            }
            if let Some(count) = patch.count {
                options.count = count;
            }
        }
        if let Some(count) = patch.count {
            if count > 0 {
                self.run().await?;
            } else {
                self.stop().await?;
            }
        }
        Ok(())
    }

    /// Apply a set of patches grouped by top-level subsystem name.
    ///
    /// Subsystems with a registered reconfigure hook re-provision
    /// through it; everything else gets its raw option document patched
    /// structurally.
    pub async fn update_configuration(
        &self,
        patches: serde_json::Map<String, Value>,
    ) -> Result<()> {
        for (subsystem, patch) in patches {
            if subsystem == "crawler" {
                let parsed: CrawlerPatch =
                    serde_json::from_value(patch).map_err(|e| ConfigError::InvalidPatch {
                        subsystem: subsystem.clone(),
                        reason: e.to_string(),
                    })?;
                self.reconfigure(parsed).await?;
                continue;
            }

            let hook = self.hooks.read().await.get(&subsystem).cloned();
            if let Some(hook) = hook {
                hook.reconfigure(patch).await?;
            } else {
                let mut raw = self.raw_options.write().await;
                let entry = raw
                    .entry(subsystem.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if let (Value::Object(existing), Value::Object(fields)) = (entry, patch) {
                    for (field, value) in fields {
                        existing.insert(field, value);
                    }
                }
                tracing::debug!(subsystem = %subsystem, "patched subsystem options structurally");
            }
        }
        Ok(())
    }

    /// Depth snapshot of the queue set
    pub async fn queue_info(&self) -> Result<Vec<QueueInfo>> {
        Ok(self.ctx.queues.info_all().await?)
    }

    /// Roll system state up for the control surface
    pub async fn status(&self) -> Result<SystemStatus> {
        let queues = self.queue_info().await?;
        let loops: Vec<LoopInfo> = {
            let entries = self.loops.lock().await;
            entries
                .iter()
                .map(|entry| LoopInfo {
                    name: entry.worker.name().to_string(),
                    state: entry.worker.state(),
                    delay_ms: entry.worker.delay_ms(),
                })
                .collect()
        };

        let queued: u64 = queues.iter().map(|q| q.count).sum();
        let running = loops
            .iter()
            .filter(|l| l.state == LoopState::Running)
            .count();
        let desired = self.options.read().await.count;

        let health = if running == 0 && queued == 0 {
            "idle"
        } else if running == 0 && queued > 0 {
            "critical"
        } else if running < desired {
            "degraded"
        } else {
            "healthy"
        };

        let mut messages = Vec::new();
        if running == 0 && queued > 0 {
            messages.push(
                "No running loops but requests are pending - run or reconfigure to start workers"
                    .to_string(),
            );
        }
        if self.ctx.tokens.pool().is_empty() {
            messages.push("Token pool is empty - configure credentials".to_string());
        }

        Ok(SystemStatus {
            queues,
            loops,
            health: health.to_string(),
            timestamp: Utc::now(),
            messages,
        })
    }
}
