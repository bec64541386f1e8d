use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::FetchError;

/// Total attempts per sub-window fetch, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubles on each subsequent retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based): `initial * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }

    /// Sum of every delay the policy can sleep through before giving up.
    pub fn total_backoff(&self) -> Duration {
        (1..self.attempts())
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Runs `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. No delay follows the final
/// attempt. Cancellation interrupts a pending backoff sleep.
pub async fn run_with_backoff<T, F, Fut>(
    source_name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                source_name: source_name.to_string(),
            });
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(FetchError::Exhausted {
                source_name: source_name.to_string(),
                attempts: attempt,
                cause: err,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            source = source_name,
            attempt,
            max_attempts,
            delay = %humantime::format_duration(delay),
            error = %format!("{err:#}"),
            "range query failed, retrying",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled {
                    source_name: source_name.to_string(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.total_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(40), Duration::from_secs(2).saturating_mul(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fifth_attempt_after_thirty_seconds() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let result = run_with_backoff("prom-a", &RetryPolicy::default(), &cancel, |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 5 {
                    Err(anyhow!("connection refused"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should succeed"), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_sleeps_exactly_four_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            run_with_backoff("prom-a", &RetryPolicy::default(), &cancel, |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("503 Service Unavailable"))
                }
            })
            .await;

        let err = result.expect_err("should exhaust");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 2 + 4 + 8 + 16; a fifth sleep would add 32s more.
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        match &err {
            FetchError::Exhausted {
                source_name,
                attempts,
                ..
            } => {
                assert_eq!(source_name, "prom-a");
                assert_eq!(*attempts, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("503 Service Unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_sleep() {
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let result = run_with_backoff("prom-a", &RetryPolicy::default(), &cancel, |_| async {
            Ok::<_, anyhow::Error>("ok")
        })
        .await;

        assert_eq!(result.expect("ok"), "ok");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> =
            run_with_backoff("prom-a", &RetryPolicy::default(), &cancel, |_| {
                let calls = Arc::clone(&calls);
                let trigger = trigger.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    trigger.cancel();
                    Err(anyhow!("timeout"))
                }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_still_tries_once() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_backoff: Duration::from_secs(2),
        };

        let result: Result<(), _> =
            run_with_backoff("prom-a", &policy, &cancel, |_| async { Err(anyhow!("boom")) })
                .await;

        assert!(matches!(
            result,
            Err(FetchError::Exhausted { attempts: 1, .. })
        ));
    }
}
