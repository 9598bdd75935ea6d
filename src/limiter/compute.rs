//! Compute budget metering with a self-calibrating baseline
//!
//! Upstream calls cost wall-clock time that is mostly unavoidable network
//! overhead. The budget limiter learns that overhead as a baseline and
//! charges only the surprising excess against the rolling window, so a
//! slow backend does not eat quota that throttling cannot win back.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LimiterError, Result};
use crate::limiter::RateLimiter;

/// One calibration round-trip against the external service.
///
/// The limiter times the call itself; implementations just perform a
/// cheap representative operation.
#[async_trait::async_trait]
pub trait BaselineProbe: Send + Sync {
    async fn round_trip(&self) -> std::result::Result<(), LimiterError>;
}

/// Options for baseline calibration
#[derive(Debug, Clone)]
pub struct ComputeOptions {
    /// Baseline assumed before the first calibration completes
    pub initial_baseline: Duration,
    /// How often the baseline is re-estimated from real round-trips
    pub calibration_interval: Duration,
    /// Round-trips sampled per calibration
    pub probe_count: u32,
    /// Stagger between successive probes
    pub probe_spacing: Duration,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            initial_baseline: Duration::from_millis(500),
            calibration_interval: Duration::from_secs(60),
            probe_count: 4,
            probe_spacing: Duration::from_millis(250),
        }
    }
}

/// Outcome of a budget charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    /// Under the window limit
    Proceed { remaining: u64 },
    /// Over the window limit; the key was benched until `reset`
    Exceeded {
        overage: u64,
        /// The effective reset instant reported by the exhaust callback
        reset: DateTime<Utc>,
        /// Whether this call pushed the reset out, or merely observed an
        /// existing later one
        updated: bool,
    },
}

struct BaselineState {
    baseline_ms: f64,
    next_update: Instant,
}

/// Meters cumulative cost per logical key against a rolling window
pub struct ComputeBudgetLimiter {
    limiter: Arc<dyn RateLimiter>,
    probe: Arc<dyn BaselineProbe>,
    options: ComputeOptions,
    state: Arc<Mutex<BaselineState>>,
}

impl ComputeBudgetLimiter {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        probe: Arc<dyn BaselineProbe>,
        options: ComputeOptions,
    ) -> Self {
        let state = BaselineState {
            baseline_ms: options.initial_baseline.as_millis() as f64,
            next_update: Instant::now() + options.calibration_interval,
        };
        Self {
            limiter,
            probe,
            options,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Current baseline estimate
    pub fn baseline(&self) -> Duration {
        Duration::from_millis(self.state.lock().baseline_ms as u64)
    }

    /// Charge `amount` of observed cost for `key`.
    ///
    /// The chargeable amount is `amount - baseline - preallocated`, never
    /// negative: the baseline ratchets downward whenever a cheaper sample
    /// is observed and is only reset upward by periodic recalibration,
    /// which samples real round-trips in the background without blocking
    /// this call. On overage, `exhaust` is invoked with the proposed
    /// reset instant (`now + window/4`) and returns the effective one.
    pub async fn consume<F>(
        &self,
        key: &str,
        amount: Duration,
        preallocated: Duration,
        exhaust: F,
    ) -> Result<BudgetVerdict>
    where
        F: FnOnce(DateTime<Utc>) -> DateTime<Utc>,
    {
        let amount_ms = amount.as_millis() as f64;
        let baseline_ms = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if now >= state.next_update {
                state.next_update = now + self.options.calibration_interval;
                self.spawn_recalibration();
            }
            if amount_ms < state.baseline_ms {
                state.baseline_ms = amount_ms;
            }
            state.baseline_ms
        };

        let chargeable =
            (amount_ms - baseline_ms - preallocated.as_millis() as f64).max(0.0) as u64;
        let check = self.limiter.check(key, chargeable).await?;
        if !check.over {
            return Ok(BudgetVerdict::Proceed {
                remaining: check.remaining(),
            });
        }

        let proposed =
            Utc::now() + ChronoDuration::milliseconds((check.window.as_millis() / 4) as i64);
        let actual = exhaust(proposed);
        tracing::info!(
            key,
            overage = check.overage(),
            reset = %actual,
            "compute budget exceeded"
        );
        Ok(BudgetVerdict::Exceeded {
            overage: check.overage(),
            reset: actual,
            updated: actual == proposed,
        })
    }

    fn spawn_recalibration(&self) {
        let probe = Arc::clone(&self.probe);
        let state = Arc::clone(&self.state);
        let count = self.options.probe_count;
        let spacing = self.options.probe_spacing;
        tokio::spawn(async move {
            let mut samples = Vec::new();
            for i in 0..count {
                if i > 0 {
                    tokio::time::sleep(spacing).await;
                }
                let started = Instant::now();
                match probe.round_trip().await {
                    Ok(()) => samples.push(started.elapsed().as_millis() as f64),
                    Err(e) => tracing::debug!(error = %e, "baseline probe failed"),
                }
            }
            if samples.is_empty() {
                tracing::warn!("baseline recalibration produced no successful samples");
                return;
            }
            let estimate = samples.iter().sum::<f64>() / samples.len() as f64;
            state.lock().baseline_ms = estimate;
            tracing::debug!(baseline_ms = estimate, "baseline recalibrated");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::MemoryRateLimiter;

    struct SleepProbe(Duration);

    #[async_trait::async_trait]
    impl BaselineProbe for SleepProbe {
        async fn round_trip(&self) -> std::result::Result<(), LimiterError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn budget(limit_ms: u64, options: ComputeOptions) -> ComputeBudgetLimiter {
        let limiter = Arc::new(MemoryRateLimiter::new(limit_ms, Duration::from_secs(60)));
        ComputeBudgetLimiter::new(limiter, Arc::new(SleepProbe(Duration::ZERO)), options)
    }

    #[test]
    fn test_default_options() {
        let options = ComputeOptions::default();
        assert_eq!(options.initial_baseline, Duration::from_millis(500));
        assert_eq!(options.probe_count, 4);
    }

    #[tokio::test]
    async fn test_baseline_ratchets_downward_only() {
        let limiter = budget(10_000, ComputeOptions::default());

        for amount_ms in [400u64, 150, 300, 90, 250] {
            limiter
                .consume("repo", Duration::from_millis(amount_ms), Duration::ZERO, |r| r)
                .await
                .unwrap();
        }
        // Non-increasing regardless of call order: min of everything seen.
        assert_eq!(limiter.baseline(), Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_only_excess_over_baseline_is_charged() {
        let limiter = budget(100, ComputeOptions::default());

        // Establishes a 100ms baseline, charging nothing.
        let verdict = limiter
            .consume("repo", Duration::from_millis(100), Duration::ZERO, |r| r)
            .await
            .unwrap();
        assert_eq!(verdict, BudgetVerdict::Proceed { remaining: 100 });

        // 160ms observed, 100ms baseline, 20ms preallocated: 40ms charged.
        let verdict = limiter
            .consume(
                "repo",
                Duration::from_millis(160),
                Duration::from_millis(20),
                |r| r,
            )
            .await
            .unwrap();
        assert_eq!(verdict, BudgetVerdict::Proceed { remaining: 60 });
    }

    #[tokio::test]
    async fn test_overage_benches_and_reports_reset() {
        let limiter = budget(50, ComputeOptions::default());
        limiter
            .consume("repo", Duration::from_millis(10), Duration::ZERO, |r| r)
            .await
            .unwrap();

        let verdict = limiter
            .consume("repo", Duration::from_millis(200), Duration::ZERO, |r| r)
            .await
            .unwrap();
        let BudgetVerdict::Exceeded {
            overage,
            reset,
            updated,
        } = verdict
        else {
            panic!("expected overage, got {verdict:?}");
        };
        assert!(overage > 0);
        assert!(reset > Utc::now());
        assert!(updated);
    }

    #[tokio::test]
    async fn test_existing_later_reset_reports_not_updated() {
        let limiter = budget(10, ComputeOptions::default());
        limiter
            .consume("repo", Duration::from_millis(5), Duration::ZERO, |r| r)
            .await
            .unwrap();

        let later = Utc::now() + ChronoDuration::minutes(30);
        let verdict = limiter
            .consume("repo", Duration::from_millis(500), Duration::ZERO, |_| later)
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            BudgetVerdict::Exceeded { updated: false, reset, .. } if reset == later
        ));
    }

    #[tokio::test]
    async fn test_recalibration_resets_baseline_upward() {
        let options = ComputeOptions {
            initial_baseline: Duration::from_millis(100),
            calibration_interval: Duration::ZERO,
            probe_count: 2,
            probe_spacing: Duration::from_millis(1),
        };
        let limiter = Arc::new(MemoryRateLimiter::new(10_000, Duration::from_secs(60)));
        let limiter =
            ComputeBudgetLimiter::new(limiter, Arc::new(SleepProbe(Duration::from_millis(20))), options);

        // Ratchet the baseline to ~1ms and trigger recalibration.
        limiter
            .consume("repo", Duration::from_millis(1), Duration::ZERO, |r| r)
            .await
            .unwrap();
        assert!(limiter.baseline() <= Duration::from_millis(1));

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Probes took ~20ms each; the estimate replaced the ratcheted floor.
        assert!(limiter.baseline() >= Duration::from_millis(10));
    }
}
