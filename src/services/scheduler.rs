//! Periodic drivers for the migration sweep and the reconciliation pass.
//!
//! Each `PeriodicTask` owns its interval and backoff policy; nothing about
//! scheduling lives in process-wide state. A task never overlaps with itself:
//! the job is awaited to completion before the next tick is taken.

use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded exponential backoff applied when a job reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total tries per tick, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed try number `attempt` (1-based): base, 2×base, 4×base…
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            name,
            interval,
            backoff,
        }
    }

    /// Run `job` until it succeeds or the attempt budget is spent. Backoff
    /// sleeps end early on shutdown; a running job is never interrupted.
    pub async fn run_with_backoff<F, Fut, T, E>(
        &self,
        job: &mut F,
        shutdown: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match job().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.name, attempt, max_attempts, delay, err
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(err),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        "{} failed after {} attempts, waiting for next interval: {}",
                        self.name, attempt, err
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Tick forever until `shutdown` is cancelled.
    pub async fn run<F, Fut, T, E>(self, shutdown: CancellationToken, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: std::fmt::Debug,
        E: Display,
    {
        info!("{} scheduled every {:?}", self.name, self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Ok(summary) = self.run_with_backoff(&mut job, &shutdown).await {
                debug!("{} finished: {:?}", self.name, summary);
            }
            if shutdown.is_cancelled() {
                break;
            }
        }
        info!("{} stopped", self.name);
    }
}
