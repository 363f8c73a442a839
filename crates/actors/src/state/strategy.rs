//! Per-actor-type persistence capabilities.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ActorError;

/// How a stateful actor validates, repairs and reconciles its state.
///
/// Only [`PersistenceStrategy::type_name`] and
/// [`PersistenceStrategy::default_state`] are required.
#[async_trait]
pub trait PersistenceStrategy: Send + Sync + 'static {
    /// The durable state.
    type State: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Actor type name used for identity, registry names and the write
    /// circuit (`"{type_name}-state"`).
    fn type_name(&self) -> &'static str;

    /// Fresh state for a new or unrecoverable actor.
    fn default_state(&self) -> Self::State;

    /// Whether a loaded record is usable. `None` means the stored bytes
    /// could not be decoded.
    fn validate(&self, state: Option<&Self::State>) -> bool {
        state.is_some()
    }

    /// Attempt to turn an invalid record into a usable one.
    fn repair(&self, _state: Option<Self::State>) -> Option<Self::State> {
        None
    }

    /// Merge local state with the newer stored state after a version
    /// conflict. The default keeps the local payload.
    async fn resolve_conflict(
        &self,
        local: &Self::State,
        _stored: Option<&Self::State>,
    ) -> Result<Self::State, ActorError> {
        Ok(local.clone())
    }

    /// Called once activation has settled on a state.
    async fn on_state_recovered(&self, _state: &Self::State) {}
}
