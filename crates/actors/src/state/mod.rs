//! Durable state management for stateful actors.
//!
//! - [`StateHandle`]: encodes state and talks to the [`crate::store::DurableStore`]
//! - [`PersistenceStrategy`]: per-type validation, repair and conflict hooks
//! - [`WriteBehindQueue`]: coalesces persist requests
//! - [`StatefulActor`]: the ractor actor tying them together

pub mod actor;
pub mod handle;
pub mod queue;
pub mod strategy;

pub use actor::{
    Mutation, StatefulActor, StatefulArguments, StatefulHandle, StatefulMessage, StatefulState,
    spawn_stateful,
};
pub use handle::{LoadedState, PersistedState, StateHandle};
pub use queue::{PersistRequest, WriteBehindQueue};
pub use strategy::PersistenceStrategy;
