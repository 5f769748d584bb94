//! Bounded retry with jittered exponential backoff.
//!
//! The policy is a first-class configuration object shared by producer and
//! consumer. Retryability is decided by the cluster error taxonomy
//! ([`rangestream_core::Error::is_retryable`]): leadership churn and
//! transient unavailability retry, terminal conditions (`DataLoss`, fetch
//! offset bugs, corruption) fail immediately.
//!
//! ```text
//! backoff = min(initial * multiplier^attempt, max) * jitter(0.75..1.25)
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rangestream_core::{Error, Result};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (total attempts = retries + 1).
    pub max_retries: usize,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Backoff cap.
    pub max_backoff: Duration,

    /// Exponential growth factor.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Backoff for a 0-indexed attempt, before jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    /// Backoff with ±25% jitter, to spread thundering herds after a
    /// failover.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + rand::thread_rng().gen::<f64>() * 0.5;
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}

/// Run `operation` under the policy. Each attempt is expected to
/// re-resolve anything it cached (the operation sees the attempt number).
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                warn!(error = %e, "non-retryable error, giving up");
                return Err(e);
            }
            Err(e) => {
                if attempt >= policy.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        error = %e,
                        "retry budget exhausted"
                    );
                    return Err(Error::Unavailable(format!(
                        "retries exhausted after {} attempts: {e}",
                        attempt + 1
                    )));
                }
                let backoff = policy.jittered_backoff(attempt);
                debug!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retryable error, backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    #[test]
    fn backoff_growth_and_cap() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        );
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(100), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = policy.backoff(attempt).as_millis() as f64;
            for _ in 0..50 {
                let jittered = policy.jittered_backoff(attempt).as_millis() as f64;
                assert!(jittered >= base * 0.74 && jittered <= base * 1.26);
            }
        }
    }

    #[tokio::test]
    async fn immediate_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = retry_with_backoff(&fast_policy(5), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eventual_success_after_transient_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = retry_with_backoff(&fast_policy(5), |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Unavailable("leader down".into()))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<()> = retry_with_backoff(&fast_policy(5), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::DataLoss {
                    requested: 3,
                    low_watermark: 10,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(Error::DataLoss { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_unavailable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<()> = retry_with_backoff(&fast_policy(2), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::StaleEpoch { current: 9 })
            }
        })
        .await;
        match result {
            Err(Error::Unavailable(message)) => {
                assert!(message.contains("3 attempts"), "got: {message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn operation_sees_attempt_numbers() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _ = retry_with_backoff(&fast_policy(2), |attempt| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().unwrap().push(attempt);
                Err::<(), _>(Error::Unavailable("nope".into()))
            }
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
