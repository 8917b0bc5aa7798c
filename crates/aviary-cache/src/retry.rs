//! Bounded retry with backoff
//!
//! A retry run is a small state machine: attempt `1..=max_attempts`, and
//! between attempts either wait `delay_for(attempt)` or continue immediately,
//! depending on what the attempt reported.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry bounds and backoff schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// What a single attempt asks the retry loop to do next
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished with a value; stop
    Done(T),
    /// Failed; wait for the backoff delay and try again
    Retry,
    /// Failed in a way that does not warrant waiting; try again immediately
    RetryNow,
    /// Failed permanently; stop without further attempts
    Abort,
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial backoff
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor).round() as u64;
        Duration::from_nanos(nanos).min(self.max_backoff)
    }

    /// Drive `op` until it finishes, aborts, or attempts run out
    ///
    /// `op` receives the 1-based attempt number. Returns `None` when no
    /// attempt produced a value.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Attempt::Done(value) => return Some(value),
                Attempt::Abort => {
                    tracing::debug!("{label}: attempt {attempt} aborted");
                    return None;
                }
                Attempt::RetryNow if attempt < max_attempts => {
                    tracing::warn!("{label}: attempt {attempt}/{max_attempts} failed, retrying");
                }
                Attempt::Retry if attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{label}: attempt {attempt}/{max_attempts} failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Retry | Attempt::RetryNow => {}
            }
        }

        tracing::warn!("{label}: giving up after {max_attempts} attempts");
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(300));
    }

    #[test]
    fn test_delay_progression_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_failure_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let start = Instant::now();
        let result: Option<()> = policy
            .run("test", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Retry }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One backoff between the two attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_now_skips_backoff() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let start = Instant::now();

        let result = policy
            .run("test", |attempt| async move {
                if attempt < 3 {
                    Attempt::RetryNow
                } else {
                    Attempt::Done(attempt)
                }
            })
            .await;

        assert_eq!(result, Some(3));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_immediately() {
        let policy = RetryPolicy::default().with_max_attempts(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Option<()> = policy
            .run("test", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Abort }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let policy = RetryPolicy::default();
        let result = policy
            .run("test", |attempt| async move {
                if attempt == 1 {
                    Attempt::Retry
                } else {
                    Attempt::Done("ok")
                }
            })
            .await;
        assert_eq!(result, Some("ok"));
    }
}
