//! Exponential backoff for resending requests the engine could not take.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Wait before the first resend.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Wait before resend number `retry` (1-based): doubles each time, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or fails with a non-transient error.
///
/// There is no attempt limit. A transient error is returned as is once the
/// next wait would end more than `give_up_after` past the first attempt.
/// Returns the final result together with the number of attempts made.
pub async fn retry_transient<F, Fut, T>(
    policy: &BackoffPolicy,
    give_up_after: Duration,
    label: &str,
    mut operation: F,
) -> (Result<T, EngineError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let first_attempt = Instant::now();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() => {
                let delay = policy.delay(attempt);
                if first_attempt.elapsed() + delay > give_up_after {
                    tracing::warn!(
                        "{} attempt {} failed: {}, giving up after {:?}",
                        label,
                        attempt,
                        e,
                        first_attempt.elapsed()
                    );
                    return (Err(e), attempt);
                }
                tracing::warn!(
                    "{} attempt {} failed: {}, retrying after {:?}",
                    label,
                    attempt,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(300));
        assert_eq!(policy.delay(60), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let (result, made) = retry_transient(&BackoffPolicy::default(), Duration::from_secs(60), "test", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(EngineError::Transport("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(made, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let (result, made) = retry_transient(&BackoffPolicy::default(), Duration::from_secs(60), "test", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::from_status(400, "action_request_validation_exception"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(made, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_when_window_closes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let started = Instant::now();

        // Waits of 50, 100, 200, 400, 800, 1600 ms fit in 5 s; 3200 ms does not.
        let (result, made) = retry_transient(&BackoffPolicy::default(), Duration::from_secs(5), "test", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::Transport("connection refused".into()))
            }
        })
        .await;

        assert_eq!(result, Err(EngineError::Transport("connection refused".into())));
        assert_eq!(made, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 7);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }
}
