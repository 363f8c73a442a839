//! Configuration for the resilience layer.
//!
//! Every section deserializes from TOML with per-field defaults, so an empty
//! file yields the same values as [`CitadelConfig::default`]. Durations are
//! expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitadelConfig {
    /// Circuit breaker defaults used by the registry.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Retry executor defaults.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Durable state persistence settings.
    #[serde(default)]
    pub persistence: PersistenceSettings,

    /// Lease lock settings.
    #[serde(default)]
    pub lease: LeaseSettings,

    /// Actor lifecycle settings.
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

impl CitadelConfig {
    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or a value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read_failed(path, e.to_string()))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&raw)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.persistence.validate()?;
        self.lease.validate()?;
        self.lifecycle.validate()?;
        Ok(())
    }
}

/// Circuit breaker defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Failures within the window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before an open circuit admits trial calls; also the
    /// length of the failure window.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Half-open failures that re-open the circuit.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Reset timeout as a [`Duration`].
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid_config(
                "circuit_breaker.failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "circuit_breaker.reset_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(Error::invalid_config(
                "circuit_breaker.half_open_max_attempts",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Retry executor defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random jitter added to each delay, as a fraction of it (0.0 - 1.0).
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config(
                "retry.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::invalid_config(
                "retry.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::invalid_config(
                "retry.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

/// What to do when durable state cannot be loaded or repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Replace unrecoverable state with a fresh default and keep serving.
    #[default]
    Degrade,
    /// Refuse to activate the actor.
    FailLoudly,
}

/// Durable state persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// Attempts when reading state during activation.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Base delay between read attempts; doubles each time.
    #[serde(default = "default_read_base_delay_ms")]
    pub read_base_delay_ms: u64,

    /// Write attempts when the store reports a version conflict.
    #[serde(default = "default_conflict_attempts")]
    pub conflict_attempts: u32,

    /// Delay unit between conflict retries (multiplied by the attempt).
    #[serde(default = "default_conflict_delay_ms")]
    pub conflict_delay_ms: u64,

    /// Window during which queued writes collapse into one.
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Behaviour when state is unrecoverable.
    #[serde(default)]
    pub recovery_mode: RecoveryMode,

    /// Run durable writes behind a per-actor-type circuit breaker.
    #[serde(default)]
    pub guard_writes: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            read_attempts: default_read_attempts(),
            read_base_delay_ms: default_read_base_delay_ms(),
            conflict_attempts: default_conflict_attempts(),
            conflict_delay_ms: default_conflict_delay_ms(),
            coalesce_window_ms: default_coalesce_window_ms(),
            recovery_mode: RecoveryMode::default(),
            guard_writes: false,
        }
    }
}

impl PersistenceSettings {
    /// Read retry base delay.
    #[must_use]
    pub const fn read_base_delay(&self) -> Duration {
        Duration::from_millis(self.read_base_delay_ms)
    }

    /// Conflict retry delay unit.
    #[must_use]
    pub const fn conflict_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_delay_ms)
    }

    /// Coalescing window.
    #[must_use]
    pub const fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.read_attempts == 0 {
            return Err(Error::invalid_config(
                "persistence.read_attempts",
                "must be greater than 0",
            ));
        }
        if self.conflict_attempts == 0 {
            return Err(Error::invalid_config(
                "persistence.conflict_attempts",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Lease lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Lease length used when a caller passes a zero timeout.
    #[serde(default = "default_lease_ms")]
    pub default_lease_ms: u64,

    /// How long an unheld lock actor lingers before deactivating.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_lease_ms: default_lease_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl LeaseSettings {
    /// Default lease as a [`Duration`].
    #[must_use]
    pub const fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }

    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.default_lease_ms == 0 {
            return Err(Error::invalid_config(
                "lease.default_lease_ms",
                "must be greater than 0",
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "lease.idle_timeout_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Actor lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Operations slower than this are logged.
    #[serde(default = "default_slow_operation_ms")]
    pub slow_operation_ms: u64,

    /// How long clients wait for an actor to reply.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            slow_operation_ms: default_slow_operation_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl LifecycleSettings {
    /// Slow operation threshold as a [`Duration`].
    #[must_use]
    pub const fn slow_operation_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_operation_ms)
    }

    /// Client call timeout as a [`Duration`].
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.call_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "lifecycle.call_timeout_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    30_000
}

const fn default_half_open_max_attempts() -> u32 {
    3
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    100
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_read_attempts() -> u32 {
    5
}

const fn default_read_base_delay_ms() -> u64 {
    200
}

const fn default_conflict_attempts() -> u32 {
    3
}

const fn default_conflict_delay_ms() -> u64 {
    100
}

const fn default_coalesce_window_ms() -> u64 {
    50
}

const fn default_lease_ms() -> u64 {
    30_000
}

const fn default_idle_timeout_ms() -> u64 {
    60_000
}

const fn default_call_timeout_ms() -> u64 {
    5_000
}

const fn default_slow_operation_ms() -> u64 {
    500
}
