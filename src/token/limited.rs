//! Rate-limited credential selection
//!
//! Wraps [`TokenPool`] with an external call-rate limiter. The pool's
//! bench state tracks credentials the upstream service has capped; this
//! layer independently stops one process from calling a healthy
//! credential too fast, benching it for a fraction of the call-cap
//! window when it trips.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::token::{TokenGrant, TokenPool};

/// Options for the per-credential call cap
#[derive(Debug, Clone)]
pub struct CallCapOptions {
    /// Fraction of the limiter window a tripped credential sits out
    pub cooldown_fraction: f64,
    /// How many leading characters of the token value form the limiter
    /// key; the full secret never leaves the process
    pub key_prefix_len: usize,
}

impl Default for CallCapOptions {
    fn default() -> Self {
        Self {
            cooldown_fraction: 0.25,
            key_prefix_len: 8,
        }
    }
}

/// Token pool with an outer call-rate limit per credential
pub struct RateLimitedTokenPool {
    pool: Arc<TokenPool>,
    limiter: Arc<dyn RateLimiter>,
    options: CallCapOptions,
}

impl RateLimitedTokenPool {
    pub fn new(
        pool: Arc<TokenPool>,
        limiter: Arc<dyn RateLimiter>,
        options: CallCapOptions,
    ) -> Self {
        Self {
            pool,
            limiter,
            options,
        }
    }

    /// The wrapped pool, for bench/replace operations
    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    /// Select a credential for one call in `traffic_class`.
    ///
    /// Delegates selection to the pool; `RetryAt`/`NoMatch` pass through
    /// unchanged since there is no real token to rate-check. A granted
    /// token is charged one call against the limiter; if that trips the
    /// cap, the token is benched for `cooldown_fraction` of the window
    /// and the resulting bench time is returned instead — the caller
    /// never receives an over-quota token.
    pub async fn get_token(
        &self,
        traffic_class: &str,
        desired_trait_sets: &[Vec<String>],
    ) -> Result<TokenGrant> {
        let grant = self.pool.get_token(desired_trait_sets);
        let TokenGrant::Granted(token) = grant else {
            return Ok(grant);
        };

        let prefix_len = self.options.key_prefix_len.min(token.len());
        let key = format!("{}:{}", &token[..prefix_len], traffic_class);
        let check = self.limiter.check(&key, 1).await?;
        if !check.over {
            return Ok(TokenGrant::Granted(token));
        }

        let cooldown_ms = (check.window.as_millis() as f64 * self.options.cooldown_fraction) as i64;
        let proposed = Utc::now() + ChronoDuration::milliseconds(cooldown_ms);
        let benched = self.pool.exhaust(&token, proposed).unwrap_or(proposed);
        tracing::debug!(
            token_prefix = &token[..prefix_len],
            traffic_class,
            ?benched,
            "credential call rate exceeded, benching"
        );
        Ok(TokenGrant::RetryAt(benched))
    }
}
