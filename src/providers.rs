//! Backend provider registry
//!
//! One context object carries every shared backend a process needs
//! (locks, tags, rate windows, transports); it is built once at startup
//! by a named factory and passed into constructors — no module-level
//! singletons. Unknown provider names are a configuration error, not a
//! runtime lookup failure.

use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, QueueError, Result};
use crate::limiter::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use crate::lock::{LockProvider, MemoryLockProvider, RedisLockProvider};
use crate::queue::{MemoryQueue, RedisQueue, TransportQueue};
use crate::tracker::{MemoryTagStore, RedisTagStore, TagStore};

/// Options the factories build from
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Redis URL (unused by the memory provider)
    pub redis_url: String,
    /// Namespace for every shared key
    pub key_prefix: String,
    /// Named priority classes to provision transports for
    pub queue_names: Vec<String>,
    /// Per-credential call cap per window
    pub call_limit: u64,
    /// Per-credential call cap window
    pub call_window: Duration,
    /// Compute budget in charged milliseconds per window
    pub compute_limit_ms: u64,
    /// Compute budget window
    pub compute_window: Duration,
    /// Redelivery delay for deferred requests
    pub defer_delay: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "herder".to_string(),
            queue_names: Vec::new(),
            call_limit: 500,
            call_window: Duration::from_secs(60),
            compute_limit_ms: 30_000,
            compute_window: Duration::from_secs(60),
            defer_delay: Duration::from_secs(30),
        }
    }
}

/// Shared backends built once at startup
pub struct Providers {
    pub locks: Arc<dyn LockProvider>,
    pub tags: Arc<dyn TagStore>,
    /// Window limiter for per-credential call caps
    pub call_limiter: Arc<dyn RateLimiter>,
    /// Window limiter for the compute budget
    pub compute_limiter: Arc<dyn RateLimiter>,
    /// One raw transport per configured queue name, in order
    pub transports: Vec<Arc<dyn TransportQueue>>,
}

/// Builds a full provider set from options
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, options: &ProviderOptions) -> Result<Providers>;
}

/// Everything shared through Redis: the cluster configuration
pub struct RedisProviderFactory;

#[async_trait::async_trait]
impl ProviderFactory for RedisProviderFactory {
    async fn build(&self, options: &ProviderOptions) -> Result<Providers> {
        let client = redis::Client::open(options.redis_url.as_str()).map_err(|e| {
            QueueError::ConnectionFailed {
                url: options.redis_url.clone(),
                reason: e.to_string(),
            }
        })?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            QueueError::ConnectionFailed {
                url: options.redis_url.clone(),
                reason: e.to_string(),
            }
        })?;

        let transports = options
            .queue_names
            .iter()
            .map(|name| {
                Arc::new(
                    RedisQueue::new(name, connection.clone(), &options.key_prefix)
                        .with_defer_delay(options.defer_delay),
                ) as Arc<dyn TransportQueue>
            })
            .collect();

        Ok(Providers {
            locks: Arc::new(RedisLockProvider::new(
                connection.clone(),
                &options.key_prefix,
            )),
            tags: Arc::new(RedisTagStore::new(connection.clone())),
            call_limiter: Arc::new(RedisRateLimiter::new(
                connection.clone(),
                &format!("{}:calls", options.key_prefix),
                options.call_limit,
                options.call_window,
            )),
            compute_limiter: Arc::new(RedisRateLimiter::new(
                connection,
                &format!("{}:compute", options.key_prefix),
                options.compute_limit_ms,
                options.compute_window,
            )),
            transports,
        })
    }
}

/// Everything process-local: single-node runs and tests
pub struct MemoryProviderFactory;

#[async_trait::async_trait]
impl ProviderFactory for MemoryProviderFactory {
    async fn build(&self, options: &ProviderOptions) -> Result<Providers> {
        let transports = options
            .queue_names
            .iter()
            .map(|name| {
                Arc::new(MemoryQueue::with_defer_delay(name, options.defer_delay))
                    as Arc<dyn TransportQueue>
            })
            .collect();

        Ok(Providers {
            locks: Arc::new(MemoryLockProvider::new()),
            tags: Arc::new(MemoryTagStore::new()),
            call_limiter: Arc::new(MemoryRateLimiter::new(
                options.call_limit,
                options.call_window,
            )),
            compute_limiter: Arc::new(MemoryRateLimiter::new(
                options.compute_limit_ms,
                options.compute_window,
            )),
            transports,
        })
    }
}

/// Explicit name-to-factory map, populated at startup
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// Registry with the built-in providers
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("redis", Arc::new(RedisProviderFactory));
        registry.register("memory", Arc::new(MemoryProviderFactory));
        registry
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Resolve a factory by name; unknown names are a typed
    /// configuration error
    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<dyn ProviderFactory>, ConfigError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                name: name.to_string(),
                available: {
                    let mut names: Vec<&str> =
                        self.factories.keys().map(String::as_str).collect();
                    names.sort_unstable();
                    names.join(", ")
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_resolves_builtins() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.resolve("memory").is_ok());
        assert!(registry.resolve("redis").is_ok());

        let err = registry.resolve("etcd").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
        assert!(err.to_string().contains("memory"));
    }

    #[tokio::test]
    async fn test_memory_factory_builds_one_transport_per_queue() {
        let options = ProviderOptions {
            queue_names: vec!["events".to_string(), "normal".to_string()],
            ..Default::default()
        };
        let providers = MemoryProviderFactory.build(&options).await.unwrap();
        assert_eq!(providers.transports.len(), 2);
        assert_eq!(providers.transports[0].name(), "events");
        assert_eq!(providers.transports[1].name(), "normal");
    }
}
