//! Core error types for Citadel configuration and I/O.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for Citadel operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read config '{path}': {reason}")]
    ConfigReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    // Validation errors
    #[error("invalid config value for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config read error.
    pub fn config_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = Error::invalid_config("retry.max_attempts", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid config value for 'retry.max_attempts': must be greater than 0"
        );
    }

    #[test]
    fn test_config_read_failed_keeps_path() {
        let err = Error::config_read_failed("/etc/citadel.toml", "not found");
        assert!(matches!(err, Error::ConfigReadFailed { .. }));
        assert!(err.to_string().contains("/etc/citadel.toml"));
    }
}
