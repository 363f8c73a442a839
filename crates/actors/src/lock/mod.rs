//! Lease-based distributed mutual exclusion.

pub mod actor;
pub mod manager;

pub use actor::{
    LOCK_TYPE_NAME, LeaseLockActor, LeaseLockArguments, LeaseLockState, LeaseRecord, LockMessage,
};
pub use manager::{LockGuard, LockHandle, LockManager};
