//! Adaptive poll-until-true waits.
//!
//! A wait polls its condition roughly every `poll_interval` until the
//! condition holds, the budget runs out, or the token is cancelled. The
//! budget comes from the label's history in the [`StatsTracker`] and falls
//! back to the caller's nominal timeout while history is thin or unreliable.
//! Completed and timed-out waits each append exactly one timing sample;
//! cancelled waits append nothing.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::{CancelExt, CancellationToken};
use crate::config::TimingConfig;
use crate::device::DeviceId;
use crate::stats::{SampleOutcome, StatsTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Met,
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    #[must_use]
    pub fn is_met(self) -> bool {
        self == Self::Met
    }
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Met => f.write_str("met"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

pub struct AdaptiveTimer {
    stats: Arc<StatsTracker>,
    poll_interval: Duration,
}

impl AdaptiveTimer {
    #[must_use]
    pub fn new(stats: Arc<StatsTracker>, config: &TimingConfig) -> Self {
        Self {
            stats,
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Budget a wait on `label` would use right now.
    #[must_use]
    pub fn effective_budget(&self, label: &str, nominal: Duration) -> Duration {
        self.stats.effective_budget(label, nominal)
    }

    /// Poll `condition` until it holds or the adaptive budget elapses.
    ///
    /// The condition is evaluated once before the first sleep, so an already
    /// true condition returns `Met` without waiting. Conditions are async so
    /// screen checks can run off the worker thread.
    pub async fn wait_until<C, Fut>(
        &self,
        device: &DeviceId,
        mut condition: C,
        nominal: Duration,
        label: &str,
        token: &CancellationToken,
    ) -> WaitOutcome
    where
        C: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let budget = self.effective_budget(label, nominal);
        let start = Instant::now();
        let deadline = start + budget;
        let mut polls = 0u32;

        let outcome = loop {
            if token.is_cancelled() {
                break WaitOutcome::Cancelled;
            }
            polls += 1;
            if condition().await {
                break WaitOutcome::Met;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::TimedOut;
            }
            let nap = self.poll_interval.min(deadline - now);
            if !token.sleep(nap).await {
                break WaitOutcome::Cancelled;
            }
        };

        let elapsed = start.elapsed();
        match outcome {
            WaitOutcome::Met => self.stats.record_timing(label, elapsed, SampleOutcome::Success),
            WaitOutcome::TimedOut => self.stats.record_timing(label, elapsed, SampleOutcome::Timeout),
            WaitOutcome::Cancelled => {}
        }
        debug!(
            device = %device,
            label,
            %outcome,
            polls,
            elapsed_ms = elapsed.as_millis() as u64,
            budget_ms = budget.as_millis() as u64,
            "Wait finished"
        );
        outcome
    }

    /// `wait_until` collapsed to a boolean.
    pub async fn wait_until_ok<C, Fut>(
        &self,
        device: &DeviceId,
        condition: C,
        nominal: Duration,
        label: &str,
        token: &CancellationToken,
    ) -> bool
    where
        C: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        self.wait_until(device, condition, nominal, label, token)
            .await
            .is_met()
    }
}

/// Sleep `base` plus or minus up to `variation`, cut short by cancellation.
///
/// Returns `false` if the token fired.
pub async fn sleep_jittered(
    base: Duration,
    variation: Duration,
    token: &CancellationToken,
) -> bool {
    let duration = jittered(base, variation);
    trace!(ms = duration.as_millis() as u64, "Interval sleep");
    token.sleep(duration).await
}

/// `base` shifted uniformly within `[-variation, +variation]`, never negative.
#[must_use]
pub fn jittered(base: Duration, variation: Duration) -> Duration {
    if variation.is_zero() {
        return base;
    }
    let j = variation.as_millis() as i64;
    let offset = rand::rng().random_range(-j..=j);
    let ms = (base.as_millis() as i64 + offset).max(0);
    Duration::from_millis(ms as u64)
}
