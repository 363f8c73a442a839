//! Citadel actors: resilience and state consistency for ractor actors.
//!
//! # Components
//!
//! - [`resilience`]: retry executor, circuit breaker and breaker registry
//! - [`lifecycle`]: activation hooks and the per-actor [`ActorContext`]
//! - [`store`]: the versioned [`DurableStore`] contract and [`MemoryStore`]
//! - [`state`]: [`StatefulActor`] with read-with-repair, conflict-aware
//!   writes and coalesced persistence
//! - [`lock`]: [`LeaseLockActor`] and the [`LockManager`] client
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use citadel_actors::{CircuitBreakerRegistry, LockManager};
//! use citadel_core::CitadelConfig;
//!
//! let config = CitadelConfig::default();
//! let breakers = CircuitBreakerRegistry::from_settings(&config.circuit_breaker);
//! let locks = LockManager::new(breakers, config);
//!
//! let total = locks
//!     .with_lock("invoice-7", "worker-1", Duration::from_secs(5), || async {
//!         Ok(42)
//!     })
//!     .await?;
//! ```

pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod resilience;
pub mod state;
pub mod store;

pub use error::ActorError;
pub use identity::{ActorIdentity, DeactivationReason};
pub use lifecycle::{ActorContext, ActorLifecycle};
pub use lock::{LeaseLockActor, LockGuard, LockHandle, LockManager, LockMessage};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitSnapshot, CircuitState, RetryExecutor, RetryPolicy, Retryable,
};
pub use state::{
    PersistenceStrategy, StatefulActor, StatefulArguments, StatefulHandle, spawn_stateful,
};
pub use store::{DurableStore, MemoryStore, StoreError, VersionedRecord};
