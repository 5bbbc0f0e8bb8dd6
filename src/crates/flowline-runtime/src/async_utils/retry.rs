//! Retry policy for node execution
//!
//! A node's `exec` phase may be attempted several times before its fallback
//! handler runs. The wait between attempts is a fixed interval by default and
//! can be made exponential with a backoff factor.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How often, and how patiently, a failing operation is re-attempted
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Wait before the first retry
    pub wait: Duration,

    /// Multiplier applied to the wait after each retry (1.0 = fixed wait)
    pub backoff_factor: f64,

    /// Upper bound for a single wait
    pub max_wait: Duration,

    /// Randomize each wait by a factor in `0.5..=1.5`
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy with the given number of attempts and no wait
    ///
    /// ```rust
    /// use flowline_runtime::async_utils::retry::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(3);
    /// assert_eq!(policy.max_attempts, 3);
    /// assert!(policy.should_retry(2));
    /// assert!(!policy.should_retry(3));
    /// ```
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait: Duration::ZERO,
            backoff_factor: 1.0,
            max_wait: Duration::from_secs(60),
            jitter: false,
        }
    }

    /// A policy that never retries
    pub fn once() -> Self {
        Self::new(1)
    }

    /// Set the wait between attempts
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum wait between attempts
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep after the given failed attempt (0-indexed)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts || self.wait.is_zero() {
            return Duration::ZERO;
        }

        let base = self.wait.as_secs_f64() * self.backoff_factor.max(0.0).powi(attempt as i32);
        let capped = base.min(self.max_wait.as_secs_f64());

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Whether another attempt is allowed after `attempts` attempts
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Run `operation` until it succeeds or the policy is exhausted
///
/// Returns the last error when every attempt failed.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    return Err(error);
                }

                let delay = policy.calculate_delay(attempt - 1);
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "Attempt failed: {}. Retrying",
                    error
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[test]
    fn test_fixed_wait() {
        let policy = RetryPolicy::new(4).with_wait(Duration::from_millis(100));

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(4), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_wait(Duration::from_secs(1))
            .with_backoff_factor(2.0)
            .with_max_wait(Duration::from_secs(5));

        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5)
            .with_wait(Duration::from_secs(2))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = policy.calculate_delay(0).as_secs_f64();
            assert!((1.0..=3.0).contains(&delay), "delay out of range: {}", delay);
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3);

        let result: Result<&str, String> = with_retry(&policy, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("failure {}", n))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_returns_last_error() {
        let policy = RetryPolicy::new(2);

        let result: Result<(), String> =
            with_retry(&policy, |attempt| async move { Err(format!("attempt {}", attempt)) }).await;

        assert_eq!(result.unwrap_err(), "attempt 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_waits_between_attempts() {
        let policy = RetryPolicy::new(3).with_wait(Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let _: Result<(), &str> = with_retry(&policy, |_| async { Err("nope") }).await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
