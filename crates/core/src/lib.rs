//! Citadel core: shared configuration and error types.

pub mod config;
pub mod error;

pub use config::{
    CircuitBreakerSettings, CitadelConfig, LeaseSettings, LifecycleSettings, PersistenceSettings,
    RecoveryMode, RetrySettings,
};
pub use error::{Error, Result};
