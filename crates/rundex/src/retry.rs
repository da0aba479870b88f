//! Retry with exponential backoff and jitter.
//!
//! Retries wrap *around* the circuit breaker, never inside it: a retried
//! attempt is a fresh breaker-gated call. Only failures classified
//! transient ([`EngineError::is_transient`]) are retried, and the whole
//! retry loop respects the caller's deadline.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Result;

/// Retry policy: attempt count and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retry).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Apply full jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter: 100ms, 200ms, 400ms, ...
    /// capped at 5s.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based retry index).
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter && exp > Duration::ZERO {
            let max_ms = exp.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        } else {
            exp
        }
    }
}

/// Run `op`, retrying transient failures per `policy` until `deadline`.
///
/// The last error is returned when attempts or the deadline are exhausted.
/// Permanent failures return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_transient() || attempt >= policy.max_attempts {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt - 1);
                if let Some(deadline) = deadline {
                    let now = Instant::now();
                    if now + delay >= deadline {
                        tracing::debug!(
                            attempt,
                            "retry abandoned: deadline would elapse during backoff"
                        );
                        return Err(err);
                    }
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        };

        let result = with_retry(&policy, None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(4);

        let result: Result<()> = with_retry(&policy, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Permanent("401".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: false,
        };

        let result: Result<()> = with_retry(&policy, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Transient("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_stops_backoff() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        let deadline = Instant::now() + Duration::from_millis(50);

        let result: Result<()> = with_retry(&policy, Some(deadline), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Transient("slow".into())) }
        })
        .await;

        assert!(result.is_err());
        // First attempt runs; the 5s backoff would cross the deadline.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
