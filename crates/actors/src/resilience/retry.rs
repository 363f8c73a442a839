//! Retry logic with exponential backoff and optional jitter.
//!
//! Only transient failures are retried. Permanent errors and cancellation
//! return immediately, and the final attempt's error propagates unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use citadel_core::RetrySettings;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default retry configuration.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Errors that know whether they are worth retrying.
pub trait Retryable: Sized {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// The error reported when a retry loop is cancelled.
    fn cancelled() -> Self;
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Jitter factor to add randomness (0.0 - 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy without jitter and with the default delay cap.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS).max(base_delay),
            jitter_factor: 0.0,
        }
    }

    /// Build a policy from configuration.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor,
        }
    }

    /// Override the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    ///
    /// Delay formula: `min(base_delay * 2^(attempt - 1), max_delay) + jitter`
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2_u32.saturating_pow(exponent);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter_factor > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor.min(1.0));
            capped.saturating_add(capped.mul_f64(jitter))
        } else {
            capped
        }
    }
}

/// Runs an async operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this executor applies.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the error of the final
    /// attempt.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_cancel(name, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`RetryExecutor::execute`], but stops between attempts once
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Retryable::cancelled`] when cancelled, otherwise as
    /// [`RetryExecutor::execute`].
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..max_attempts {
            if cancel.is_cancelled() {
                return Err(E::cancelled());
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    let delay = self.policy.calculate_delay(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after transient failure"
                    );

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            debug!(operation = name, attempt, "Retry cancelled during backoff");
                            return Err(E::cancelled());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if cancel.is_cancelled() {
            return Err(E::cancelled());
        }
        operation().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::ActorError;

    fn counting_op(
        calls: &Arc<AtomicU32>,
        failures: u32,
        error: ActorError,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, ActorError>> {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                std::future::ready(Err(error.clone()))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(40, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000));
        assert_eq!(policy.calculate_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.calculate_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));

        let result = executor
            .execute("flaky", counting_op(&calls, 2, ActorError::timeout("slow")))
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_error_propagates_unwrapped() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(10)));

        let result = executor
            .execute(
                "down",
                counting_op(&calls, 10, ActorError::unavailable("db")),
            )
            .await;

        assert_eq!(result.unwrap_err(), ActorError::unavailable("db"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::new(5, Duration::from_millis(10)));

        let result = executor
            .execute(
                "bad-input",
                counting_op(&calls, 10, ActorError::invalid_argument("empty")),
            )
            .await;

        assert!(matches!(result, Err(ActorError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::new(0, Duration::from_millis(10)));

        let result = executor
            .execute("once", counting_op(&calls, 10, ActorError::timeout("t")))
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::new(5, Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = executor
            .execute_with_cancel(
                "cancelled",
                &cancel,
                counting_op(&calls, 10, ActorError::timeout("t")),
            )
            .await;

        assert_eq!(result.unwrap_err(), ActorError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .execute_with_cancel("never", &cancel, counting_op(&calls, 0, ActorError::Cancelled))
            .await;

        assert_eq!(result.unwrap_err(), ActorError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(base_ms in 1u64..5_000, cap_ms in 1u64..20_000, attempt in 1u32..64) {
            let policy = RetryPolicy::new(10, Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(cap_ms));
            prop_assert!(policy.calculate_delay(attempt) <= Duration::from_millis(cap_ms));
        }

        #[test]
        fn prop_delay_is_monotonic(base_ms in 1u64..5_000, attempt in 1u32..40) {
            let policy = RetryPolicy::new(10, Duration::from_millis(base_ms));
            prop_assert!(policy.calculate_delay(attempt) <= policy.calculate_delay(attempt + 1));
        }
    }
}
