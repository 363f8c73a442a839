//! Durable store contract.
//!
//! Stateful actors persist through [`DurableStore`], a versioned
//! get/put/clear interface with optimistic concurrency. Version `0` means
//! "no record"; every successful write returns the previous version plus one.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// A stored payload together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Encoded state bytes.
    pub payload: Vec<u8>,
    /// Monotonic version, starting at 1 for the first write.
    pub version: u64,
}

/// Failures reported by a [`DurableStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The record changed since the writer last read it.
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// The backend cannot be reached right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time.
    #[error("store timeout: {0}")]
    Timeout(String),

    /// The stored bytes are damaged.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// Any other permanent backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the failure is expected to clear up on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Versioned key/value persistence used by stateful actors.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Read the record stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backend fails.
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Write `payload` if the stored version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the stored version differs.
    async fn write(
        &self,
        key: &str,
        payload: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Remove the record stored under `key`. Clearing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backend fails.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}
