//! Activation/deactivation hooks and the per-actor resilience context.
//!
//! Concrete actors compose an [`ActorContext`] into their state and
//! implement [`ActorLifecycle`]; `pre_start` calls
//! [`ActorLifecycle::activate`] and `post_stop` calls
//! [`ActorLifecycle::deactivate`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citadel_core::CitadelConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ActorError;
use crate::identity::{ActorIdentity, DeactivationReason};
use crate::resilience::{CircuitBreakerError, CircuitBreakerRegistry, RetryExecutor, RetryPolicy};

const DEFAULT_SLOW_OPERATION: Duration = Duration::from_millis(500);

/// Identity plus the shared resilience services an actor uses.
#[derive(Debug, Clone)]
pub struct ActorContext {
    identity: ActorIdentity,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    slow_operation: Duration,
    cancel: CancellationToken,
}

impl ActorContext {
    /// Create a context with default retry and timing settings.
    #[must_use]
    pub fn new(identity: ActorIdentity, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            identity,
            breakers,
            retry: RetryPolicy::default(),
            slow_operation: DEFAULT_SLOW_OPERATION,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a context configured from `config`.
    #[must_use]
    pub fn from_config(
        identity: ActorIdentity,
        breakers: Arc<CircuitBreakerRegistry>,
        config: &CitadelConfig,
    ) -> Self {
        Self {
            identity,
            breakers,
            retry: RetryPolicy::from_settings(&config.retry),
            slow_operation: config.lifecycle.slow_operation_threshold(),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort retries when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the slow operation threshold.
    #[must_use]
    pub const fn with_slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation = threshold;
        self
    }

    #[must_use]
    pub const fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time `operation`, logging it when slow and when it fails.
    ///
    /// # Errors
    ///
    /// Returns the operation's error unchanged.
    pub async fn track_performance<T, E, Fut>(&self, name: &str, operation: Fut) -> Result<T, E>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = operation.await;
        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) if elapsed > self.slow_operation => {
                info!(actor = %self.identity, operation = name, elapsed_ms, "Slow operation");
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    actor = %self.identity,
                    operation = name,
                    elapsed_ms,
                    error = %e,
                    "Operation failed"
                );
            }
        }
        result
    }

    /// Run `operation` through the retry executor with `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, the final attempt's error, or
    /// [`ActorError::Cancelled`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
        max_attempts: u32,
    ) -> Result<T, ActorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let executor = RetryExecutor::new(self.retry.clone().with_max_attempts(max_attempts));
        executor
            .execute_with_cancel(&format!("{}.{name}", self.identity), &self.cancel, operation)
            .await
    }

    /// Run `operation` with retries inside the breaker named `circuit`.
    ///
    /// The breaker sees one outcome per retried execution.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::CircuitOpen`] without invoking `operation` when
    /// the circuit is open, otherwise as
    /// [`ActorContext::execute_with_retry`].
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        name: &str,
        circuit: &str,
        operation: F,
        max_attempts: u32,
    ) -> Result<T, ActorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let breaker = self.breakers.get_or_create(circuit);
        match breaker
            .execute(|| self.execute_with_retry(name, operation, max_attempts))
            .await
        {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open { circuit }) => {
                warn!(actor = %self.identity, operation = name, %circuit, "Circuit open, call rejected");
                Err(ActorError::CircuitOpen(circuit))
            }
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        }
    }
}

/// Activation and deactivation hooks.
#[async_trait]
pub trait ActorLifecycle: Send {
    /// The actor's resilience context.
    fn context(&self) -> &ActorContext;

    /// Restore state during activation.
    async fn recover_state(&mut self) -> Result<(), ActorError> {
        Ok(())
    }

    /// Release resources during deactivation.
    async fn cleanup_resources(&mut self) -> Result<(), ActorError> {
        Ok(())
    }

    /// Log the activation and run [`ActorLifecycle::recover_state`].
    ///
    /// # Errors
    ///
    /// Returns the recovery error, which aborts activation.
    async fn activate(&mut self) -> Result<(), ActorError> {
        info!(actor = %self.context().identity(), "Actor activating");
        self.recover_state().await
    }

    /// Log the deactivation and run [`ActorLifecycle::cleanup_resources`].
    ///
    /// Cleanup failures are logged and never block deactivation.
    async fn deactivate(&mut self, reason: &DeactivationReason) {
        info!(actor = %self.context().identity(), %reason, "Actor deactivating");
        if let Err(e) = self.cleanup_resources().await {
            error!(actor = %self.context().identity(), error = %e, "Resource cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};

    fn context() -> ActorContext {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::new(
            2,
            Duration::from_secs(30),
        )));
        ActorContext::new(ActorIdentity::new("Recorder", "p-1"), registry)
    }

    struct Recorder {
        context: ActorContext,
        recovered: bool,
        fail_cleanup: bool,
        cleaned: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ActorLifecycle for Recorder {
        fn context(&self) -> &ActorContext {
            &self.context
        }

        async fn recover_state(&mut self) -> Result<(), ActorError> {
            self.recovered = true;
            Ok(())
        }

        async fn cleanup_resources(&mut self) -> Result<(), ActorError> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup {
                Err(ActorError::internal("socket already closed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_activate_runs_recovery() {
        let mut recorder = Recorder {
            context: context(),
            recovered: false,
            fail_cleanup: false,
            cleaned: Arc::new(AtomicU32::new(0)),
        };
        recorder.activate().await.unwrap();
        assert!(recorder.recovered);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_block_deactivation() {
        let cleaned = Arc::new(AtomicU32::new(0));
        let mut recorder = Recorder {
            context: context(),
            recovered: false,
            fail_cleanup: true,
            cleaned: Arc::clone(&cleaned),
        };
        recorder.deactivate(&DeactivationReason::Idle).await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_performance_passes_results_through() {
        let ctx = context();
        let ok: Result<u32, ActorError> = ctx
            .track_performance("slow", async {
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok(1)
            })
            .await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u32, ActorError> = ctx
            .track_performance("broken", async { Err(ActorError::not_found("x")) })
            .await;
        assert_eq!(err.unwrap_err(), ActorError::not_found("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_uses_attempt_budget() {
        let ctx = context();
        let calls = AtomicU32::new(0);
        let result: Result<(), ActorError> = ctx
            .execute_with_retry(
                "flaky",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ActorError::timeout("slow")) }
                },
                4,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_counts_one_failure_per_execution() {
        let ctx = context();
        let calls = AtomicU32::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ActorError::unavailable("db")) }
        };

        for _ in 0..2 {
            let err = ctx
                .execute_with_circuit_breaker("load", "db", failing, 2)
                .await
                .unwrap_err();
            assert_eq!(err, ActorError::unavailable("db"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.breakers().get_or_create("db").state(), CircuitState::Open);

        let err = ctx
            .execute_with_circuit_breaker("load", "db", failing, 2)
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits_retry() {
        let cancel = CancellationToken::new();
        let ctx = context().with_cancellation(cancel.clone());
        cancel.cancel();

        let result: Result<(), ActorError> = ctx
            .execute_with_retry("never", || async { Ok(()) }, 3)
            .await;
        assert_eq!(result.unwrap_err(), ActorError::Cancelled);
    }
}
