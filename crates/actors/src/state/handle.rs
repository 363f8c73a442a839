//! Binding between an actor's in-memory state and its durable record.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::ActorError;
use crate::store::{DurableStore, StoreError};

/// State payload plus the version it was last persisted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState<S> {
    pub payload: S,
    pub version: u64,
}

/// Result of reading the durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedState<S> {
    /// No record exists yet.
    Absent,
    /// A record exists. `payload` is `None` when its bytes cannot be decoded.
    Present { payload: Option<S>, version: u64 },
}

/// Encodes state with bincode and moves it to and from a [`DurableStore`].
pub struct StateHandle<S> {
    key: String,
    store: Arc<dyn DurableStore>,
    current: Option<PersistedState<S>>,
}

impl<S> fmt::Debug for StateHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("key", &self.key)
            .field("version", &self.current.as_ref().map_or(0, |c| c.version))
            .finish_non_exhaustive()
    }
}

impl<S> StateHandle<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create an empty handle for `key`.
    pub fn new(key: impl Into<String>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            key: key.into(),
            store,
            current: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current in-memory state.
    #[must_use]
    pub fn get(&self) -> Option<&S> {
        self.current.as_ref().map(|c| &c.payload)
    }

    /// Mutable access to the in-memory state.
    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.current.as_mut().map(|c| &mut c.payload)
    }

    /// Version of the last successful durable write (0 if none).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.version)
    }

    /// Replace the in-memory state, keeping `version` as the write base.
    pub fn set(&mut self, payload: S, version: u64) {
        self.current = Some(PersistedState { payload, version });
    }

    /// Record a successful durable write.
    pub fn set_version(&mut self, version: u64) {
        if let Some(current) = self.current.as_mut() {
            current.version = version;
        }
    }

    /// Drop the in-memory state.
    pub fn clear_local(&mut self) {
        self.current = None;
    }

    /// Read and decode the durable record.
    ///
    /// # Errors
    ///
    /// Returns the store's error; undecodable bytes are not an error.
    pub async fn read(&self) -> Result<LoadedState<S>, StoreError> {
        let Some(record) = self.store.read(&self.key).await? else {
            return Ok(LoadedState::Absent);
        };
        let payload = match decode::<S>(&record.payload) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key = %self.key, version = record.version, error = %e, "Stored state is undecodable");
                None
            }
        };
        Ok(LoadedState::Present {
            payload,
            version: record.version,
        })
    }

    /// Write already-encoded bytes at `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns the store's error, including conflicts.
    pub async fn write_encoded(&self, bytes: Vec<u8>, expected_version: u64) -> Result<u64, StoreError> {
        self.store.write(&self.key, bytes, expected_version).await
    }

    /// Remove the durable record.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear(&self.key).await
    }

    /// Shared store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }
}

/// Encode state for the store.
///
/// # Errors
///
/// Returns [`ActorError::Serialization`] when encoding fails.
pub fn encode<S: Serialize>(state: &S) -> Result<Vec<u8>, ActorError> {
    bincode::serde::encode_to_vec(state, bincode::config::standard())
        .map_err(|e| ActorError::serialization(e.to_string()))
}

/// Decode state read from the store.
///
/// # Errors
///
/// Returns [`ActorError::Serialization`] when the bytes are not valid state.
pub fn decode<S: DeserializeOwned>(bytes: &[u8]) -> Result<S, ActorError> {
    let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ActorError::serialization(e.to_string()))?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde::Deserialize;

    use super::*;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[tokio::test]
    async fn test_read_absent_record() {
        let handle: StateHandle<Profile> = StateHandle::new("p-1", Arc::new(MemoryStore::new()));
        assert_eq!(handle.read().await.unwrap(), LoadedState::Absent);
        assert_eq!(handle.version(), 0);
    }

    #[tokio::test]
    async fn test_written_state_reads_back() {
        let store = Arc::new(MemoryStore::new());
        let handle: StateHandle<Profile> = StateHandle::new("p-1", store);
        let profile = Profile {
            name: "ada".into(),
            visits: 3,
        };

        let version = handle.write_encoded(encode(&profile).unwrap(), 0).await.unwrap();
        assert_eq!(
            handle.read().await.unwrap(),
            LoadedState::Present {
                payload: Some(profile),
                version
            }
        );
    }

    #[tokio::test]
    async fn test_garbage_bytes_read_as_undecodable() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("p-1", vec![0xff, 0xff, 0xff], 4);
        let handle: StateHandle<Profile> = StateHandle::new("p-1", store);

        assert_eq!(
            handle.read().await.unwrap(),
            LoadedState::Present {
                payload: None,
                version: 4
            }
        );
    }

    #[test]
    fn test_debug_shows_key_and_version() {
        let mut handle: StateHandle<Profile> =
            StateHandle::new("p-1", Arc::new(MemoryStore::new()));
        assert_eq!(format!("{handle:?}"), r#"StateHandle { key: "p-1", version: 0, .. }"#);

        handle.set(
            Profile {
                name: "ada".into(),
                visits: 1,
            },
            6,
        );
        assert!(format!("{handle:?}").contains("version: 6"));
    }

    #[test]
    fn test_set_version_only_touches_existing_state() {
        let mut handle: StateHandle<Profile> =
            StateHandle::new("p-1", Arc::new(MemoryStore::new()));
        handle.set_version(9);
        assert_eq!(handle.version(), 0);

        handle.set(
            Profile {
                name: "bob".into(),
                visits: 0,
            },
            2,
        );
        handle.set_version(3);
        assert_eq!(handle.version(), 3);
        assert_eq!(handle.get().map(|p| p.visits), Some(0));
    }
}
