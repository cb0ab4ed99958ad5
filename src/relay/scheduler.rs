//! Per-publisher scan timer.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drives one publisher's periodic scans.
///
/// Ticks never overlap: a scan that runs longer than the period makes the
/// missed ticks collapse into one.
#[derive(Debug, Clone, Copy)]
pub struct PublishScheduler {
    period: Duration,
}

impl PublishScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Call `tick` every period, starting one period from now, until
    /// `cancel` fires.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    }
}
