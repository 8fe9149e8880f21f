//! Jittered exponential backoff for transient storage contention.
//!
//! One reusable policy, parameterized by a failure classifier, applied only
//! around the store's atomic unit. Business rejections must classify as
//! fatal so they propagate on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Outcome of a retried operation that never succeeded.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier marked the failure non-transient; no retry happened
    /// after it.
    Fatal(E),
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
}

/// Retry policy: `max_retries` additional attempts after the first, with
/// delay `base_delay * 2^attempt + uniform_jitter(0, base_delay)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Backoff before retrying attempt `attempt + 1` (zero-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = 2u64.saturating_pow(attempt);
        let backoff = base_ms.saturating_mul(exp);
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..=base_ms)
        } else {
            0
        };
        Duration::from_millis(backoff.saturating_add(jitter)).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// `is_transient` decides which errors are worth another attempt. The
    /// closure receives the zero-based attempt number.
    pub async fn run<T, E, C, F, Fut>(&self, is_transient: C, mut op: F) -> Result<T, RetryError<E>>
    where
        C: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(RetryError::Fatal(err)),
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        for attempt in 0..4u32 {
            let floor = Duration::from_millis(100 * 2u64.pow(attempt));
            let ceiling = floor + Duration::from_millis(100);
            for _ in 0..32 {
                let d = policy.delay_for(attempt);
                assert!(d >= floor, "attempt {attempt}: {d:?} below {floor:?}");
                assert!(d <= ceiling, "attempt {attempt}: {d:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        assert!(policy.delay_for(8) <= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<&str, RetryError<&str>> = policy
            .run(
                |_| true,
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("lock timeout")
                        } else {
                            Ok("committed")
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "committed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_short_circuit() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = policy
            .run(
                |e: &&str| *e == "transient",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("insufficient stock") }
                },
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal("insufficient stock"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_total_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = policy
            .run(
                |_| true,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("still locked") }
                },
            )
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4); // 1 initial + 3 retries
                assert_eq!(last, "still locked");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
