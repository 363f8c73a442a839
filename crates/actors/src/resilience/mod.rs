//! Resilience primitives shared by every actor.
//!
//! - [`RetryExecutor`]: re-runs transient failures with exponential backoff
//! - [`CircuitBreaker`]: short-circuits calls to a failing dependency
//! - [`CircuitBreakerRegistry`]: process-wide lookup of named breakers

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitSnapshot, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryExecutor, RetryPolicy, Retryable};
