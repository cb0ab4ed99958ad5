//! Retry policies for broker calls.
//!
//! Connection establishment retries on a fixed cadence; publish-path calls
//! back off exponentially. Only transient errors are retried.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::RelayError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same wait before every retry
    Fixed(Duration),
    /// `base * 2^attempt`, attempt starting at 1
    Exponential { base: Duration, max: Duration },
}

/// Bounded retry policy: one initial attempt plus `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed interval policy used for connection establishment.
    pub fn fixed(max_retries: u32, wait: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(wait),
        }
    }

    /// Exponential policy used on the publish path.
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                base,
                max: Duration::from_secs(300),
            },
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(wait) => wait,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// The last error is returned when the policy gives up.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Broker call failed, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(20), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        let started = Instant::now();

        let result = policy
            .execute("publish", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RelayError::Broker(BrokerError::Unreachable("down".into())))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 200ms + 400ms
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(2, Duration::from_secs(1));

        let result: Result<(), _> = policy
            .execute("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::NotConnected)
            })
            .await;

        assert!(matches!(result, Err(RelayError::NotConnected)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));

        let result: Result<(), _> = policy
            .execute("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::Broker(BrokerError::AccessRefused("no".into())))
            })
            .await;

        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
