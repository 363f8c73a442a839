//! Actor-specific error types.
//!
//! These are business logic errors returned in RPC replies.
//! They are NOT actor crashes - they're normal error responses.

use std::time::Duration;

use ractor::SpawnErr;
use thiserror::Error;

use crate::resilience::{CircuitBreakerError, Retryable};
use crate::store::StoreError;

/// Errors surfaced by resilient actors and their helpers.
///
/// The actor keeps running after returning any of these to a caller, except
/// [`ActorError::StateUnrecoverable`], which aborts activation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    /// An operation or RPC call timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A transport-level failure talking to a dependency.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A dependency reported itself unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A permanent storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The durable store holds a newer version than the writer expected.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// The named circuit is open and the call was rejected.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Durable state could not be loaded or repaired.
    #[error("state unrecoverable: {0}")]
    StateUnrecoverable(String),

    /// The lease lock for this key is held by someone else.
    #[error("lock '{0}' is unavailable")]
    LockUnavailable(String),

    /// The operation was cancelled between attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// The actor is not available (stopped or not started).
    #[error("actor not available")]
    ActorUnavailable,

    /// Failed to spawn an actor.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// State could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal actor error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ActorError {
    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an RPC timeout error.
    #[must_use]
    pub fn rpc_timeout(duration: Duration) -> Self {
        Self::Timeout(format!("no reply within {duration:?}"))
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a circuit open error.
    pub fn circuit_open(circuit: impl Into<String>) -> Self {
        Self::CircuitOpen(circuit.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a state unrecoverable error.
    pub fn state_unrecoverable(msg: impl Into<String>) -> Self {
        Self::StateUnrecoverable(msg.into())
    }

    /// Create a lock unavailable error.
    pub fn lock_unavailable(key: impl Into<String>) -> Self {
        Self::LockUnavailable(key.into())
    }

    /// Create an actor unavailable error.
    #[must_use]
    pub const fn actor_unavailable() -> Self {
        Self::ActorUnavailable
    }

    /// Create a spawn failed error.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Timeouts, transport failures and unavailable dependencies are
    /// transient. Everything else fails fast.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::Unavailable(_)
        )
    }

    /// Whether this error came from an open circuit.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl Retryable for ActorError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl From<StoreError> for ActorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { expected, actual } => Self::VersionConflict { expected, actual },
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            StoreError::Timeout(msg) => Self::Timeout(msg),
            StoreError::Corrupted(msg) => Self::Serialization(msg),
            StoreError::Backend(msg) => Self::Storage(msg),
        }
    }
}

impl From<CircuitBreakerError<Self>> for ActorError {
    fn from(e: CircuitBreakerError<Self>) -> Self {
        match e {
            CircuitBreakerError::Open { circuit } => Self::CircuitOpen(circuit),
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

/// Convert a ractor spawn failure, keeping typed activation errors.
pub(crate) fn from_spawn_err(actor: &str, err: SpawnErr) -> ActorError {
    if let SpawnErr::StartupFailed(inner) = &err {
        if let Some(actor_err) = inner.downcast_ref::<ActorError>() {
            return actor_err.clone();
        }
    }
    ActorError::spawn_failed(format!("{actor}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_transient_errors_as_retryable() {
        assert!(ActorError::timeout("read").is_retryable());
        assert!(ActorError::transport("reset by peer").is_retryable());
        assert!(ActorError::unavailable("store").is_retryable());
    }

    #[test]
    fn should_fail_fast_on_permanent_errors() {
        let permanent = [
            ActorError::invalid_argument("empty owner"),
            ActorError::circuit_open("db"),
            ActorError::VersionConflict {
                expected: 1,
                actual: 2,
            },
            ActorError::not_found("user-1"),
            ActorError::Cancelled,
            ActorError::internal("bug"),
            ActorError::storage("disk full"),
        ];
        for err in permanent {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }

    #[test]
    fn should_map_store_conflict_to_version_conflict() {
        let err: ActorError = StoreError::Conflict {
            expected: 3,
            actual: 5,
        }
        .into();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "version conflict: expected 3, found 5");
    }

    #[test]
    fn should_keep_store_transience() {
        let err: ActorError = StoreError::Timeout("slow disk".to_string()).into();
        assert!(err.is_retryable());
        let err: ActorError = StoreError::Backend("schema".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn should_unwrap_circuit_breaker_errors() {
        let open: ActorError = CircuitBreakerError::<ActorError>::Open {
            circuit: "payments".to_string(),
        }
        .into();
        assert!(open.is_circuit_open());
        assert!(open.to_string().contains("payments"));

        let inner: ActorError =
            CircuitBreakerError::Inner(ActorError::not_found("order-9")).into();
        assert_eq!(inner, ActorError::not_found("order-9"));
    }

    #[test]
    fn should_create_rpc_timeout_error() {
        let err = ActorError::rpc_timeout(Duration::from_secs(5));
        assert!(matches!(err, ActorError::Timeout(_)));
        assert!(err.to_string().contains("5s"));
    }
}
