//! Circuit breaker pattern implementation.
//!
//! Prevents cascading failures by automatically stopping requests to a failing
//! service. Tracks failures in a sliding window and transitions between states:
//! - Closed: Normal operation, requests pass through
//! - Open: Circuit is tripped, requests fail immediately
//! - Half-Open: Testing if service has recovered
//!
//! A breaker is a cheap handle over shared state; clones observe the same
//! circuit. When the circuit opens a reset timer is armed, and an expired
//! Open circuit also moves to Half-Open on the next admission check.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use citadel_core::CircuitBreakerSettings;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default circuit breaker configuration.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RESET_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HALF_OPEN_MAX_ATTEMPTS: u32 = 3;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - rejecting requests
    Open,
    /// Circuit is half-open - testing recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the circuit.
    pub failure_threshold: u32,
    /// Open cool-down; also the failure window length.
    pub reset_timeout: Duration,
    /// Half-open failures that re-open the circuit.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config.
    #[must_use]
    pub const fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
        }
    }

    /// Build a config from settings.
    #[must_use]
    pub const fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: settings.reset_timeout(),
            half_open_max_attempts: settings.half_open_max_attempts,
        }
    }

    /// Set the half-open failure limit.
    #[must_use]
    pub const fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts;
        self
    }
}

/// Circuit breaker error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    Open { circuit: String },
    /// Inner error from the wrapped function
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { circuit } => write!(f, "circuit '{circuit}' is open"),
            Self::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Failures still inside the window (Closed only).
    pub window_failures: usize,
    pub half_open_failures: u32,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_failures: u32,
    open_until: Option<Instant>,
    reset_timer: Option<JoinHandle<()>>,
}

impl BreakerCore {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_failures: 0,
            open_until: None,
            reset_timer: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_failures = 0;
        self.open_until = None;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.half_open_failures = 0;
        self.open_until = None;
        self.cancel_timer();
    }
}

/// A named Closed/Open/Half-Open circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    core: Arc<Mutex<BreakerCore>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config,
            core: Arc::new(Mutex::new(BreakerCore::new())),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the lazy reset check.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Current state and counters.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut core = self.core.lock();
        core.prune(Instant::now(), self.config.reset_timeout);
        CircuitSnapshot {
            name: self.name.to_string(),
            state: core.state,
            window_failures: core.failures.len(),
            half_open_failures: core.half_open_failures,
        }
    }

    /// Force the circuit closed and forget all failures.
    pub fn reset(&self) {
        self.core.lock().close();
        info!(circuit = %self.name, "Circuit breaker reset");
    }

    /// Cancel the armed reset timer, if any.
    pub(crate) fn shutdown(&self) {
        self.core.lock().cancel_timer();
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// The operation is never invoked while the circuit is open. Every
    /// completed call is recorded; the breaker never retries.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] when rejected, otherwise wraps
    /// the operation's own error.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_admit() {
            debug!(circuit = %self.name, "Call rejected by open circuit");
            return Err(CircuitBreakerError::Open {
                circuit: self.name.to_string(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn try_admit(&self) -> bool {
        let mut core = self.core.lock();
        if core.state != CircuitState::Open {
            return true;
        }
        match core.open_until {
            Some(deadline) if Instant::now() >= deadline => {
                core.cancel_timer();
                core.enter_half_open();
                info!(circuit = %self.name, "Circuit breaker half-open");
                true
            }
            _ => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut core = self.core.lock();
        if core.state == CircuitState::HalfOpen {
            core.close();
            info!(circuit = %self.name, "Circuit breaker closed");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut core = self.core.lock();
        let now = Instant::now();
        match core.state {
            CircuitState::Closed => {
                core.failures.push_back(now);
                core.prune(now, self.config.reset_timeout);
                let failures = u32::try_from(core.failures.len()).unwrap_or(u32::MAX);
                debug!(circuit = %self.name, failures, "Circuit failure recorded");
                if failures >= self.config.failure_threshold {
                    self.open(&mut core, now);
                }
            }
            CircuitState::HalfOpen => {
                core.half_open_failures = core.half_open_failures.saturating_add(1);
                if core.half_open_failures >= self.config.half_open_max_attempts {
                    self.open(&mut core, now);
                }
            }
            // A call admitted before the circuit opened; nothing to add.
            CircuitState::Open => {}
        }
    }

    fn open(&self, core: &mut BreakerCore, now: Instant) {
        core.state = CircuitState::Open;
        core.failures.clear();
        core.half_open_failures = 0;
        core.open_until = Some(now + self.config.reset_timeout);
        core.cancel_timer();
        core.reset_timer = self.arm_reset_timer();
        warn!(
            circuit = %self.name,
            reset_timeout_ms = u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker opened"
        );
    }

    fn arm_reset_timer(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let core: Weak<Mutex<BreakerCore>> = Arc::downgrade(&self.core);
        let name = Arc::clone(&self.name);
        let timeout = self.config.reset_timeout;

        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(core) = core.upgrade() else {
                return;
            };
            let mut core = core.lock();
            let due = core
                .open_until
                .is_some_and(|deadline| Instant::now() >= deadline);
            if core.state == CircuitState::Open && due {
                core.reset_timer = None;
                core.enter_half_open();
                info!(circuit = %name, "Circuit breaker half-open");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(threshold, Duration::from_millis(reset_ms)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[test]
    fn test_circuit_breaker_default() {
        let breaker = CircuitBreaker::new("db", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.config().failure_threshold, 5);
        assert_eq!(breaker.config().reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_record_failure_without_runtime_still_opens() {
        let breaker = breaker(2, 1_000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_skips_operation() {
        let breaker = breaker(3, 1_000);
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { ref circuit }) if circuit == "test"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = breaker(3, 1_000);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(1_100)).await;
        fail(&breaker).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timer_moves_to_half_open() {
        let breaker = breaker(1, 500);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(501)).await;
        tokio::task::yield_now().await;

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_expired_open_circuit_admits_lazily() {
        let breaker = breaker(1, 200);
        // Opened outside the runtime: no timer armed.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            tokio::time::advance(Duration::from_millis(250)).await;
            assert_eq!(succeed(&breaker).await.unwrap(), 7);
        });
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failures_reopen_after_limit() {
        let breaker = breaker(1, 100);
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_failures, 2);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_clears_failure_state() {
        let breaker = breaker(2, 100);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.window_failures, 0);
        assert_eq!(snapshot.half_open_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let breaker = breaker(1, 60_000);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_state() {
        let breaker = breaker(1, 1_000);
        let clone = breaker.clone();
        fail(&clone).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_error_display() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Open {
            circuit: "payments".to_string(),
        };
        assert_eq!(err.to_string(), "circuit 'payments' is open");
    }
}
