//! Lease-based mutual exclusion actor.
//!
//! One actor per lock key. A lease is held by an owner id until it is
//! released, force-released, or its expiry passes. Expiry is enforced two
//! ways: a timer delivers `Expire` to the actor's own mailbox, and every
//! request treats an expired lease as free.
//!
//! A lock that stays unheld for the configured idle timeout stops itself;
//! the next request for its key activates a fresh one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citadel_core::CitadelConfig;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ActorError;
use crate::identity::{ActorIdentity, DeactivationReason};
use crate::lifecycle::{ActorContext, ActorLifecycle};
use crate::resilience::CircuitBreakerRegistry;

/// Actor type name for lease locks.
pub const LOCK_TYPE_NAME: &str = "LeaseLock";

/// Messages for [`LeaseLockActor`].
#[derive(Debug)]
pub enum LockMessage {
    /// Take the lease for `lease` (zero means the default lease).
    TryAcquire {
        owner: String,
        lease: Duration,
        reply: RpcReplyPort<bool>,
    },

    /// Give the lease back; only its owner may.
    Release {
        owner: String,
        reply: RpcReplyPort<bool>,
    },

    /// Push the owner's expiry forward.
    Extend {
        owner: String,
        additional: Duration,
        reply: RpcReplyPort<bool>,
    },

    /// Clear the lease regardless of owner.
    ForceRelease { reply: RpcReplyPort<bool> },

    IsLocked { reply: RpcReplyPort<bool> },

    GetOwner { reply: RpcReplyPort<Option<String>> },

    /// Expiry timer fired. Ignored unless `generation` is current.
    Expire { generation: u64 },

    /// Idle timer fired. Stops the actor if the lease is still free.
    Idle { generation: u64 },
}

/// Current lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    pub owner: Option<String>,
    pub expires_at: Option<Instant>,
}

impl LeaseRecord {
    /// Held iff an owner is set and the expiry is unset or in the future.
    #[must_use]
    pub fn is_held(&self, now: Instant) -> bool {
        self.owner.is_some() && self.expires_at.is_none_or(|at| at > now)
    }

    /// Held by exactly `owner`.
    #[must_use]
    pub fn is_held_by(&self, owner: &str, now: Instant) -> bool {
        self.is_held(now) && self.owner.as_deref() == Some(owner)
    }

    /// Owner set but expiry passed.
    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        self.owner.is_some() && !self.is_held(now)
    }
}

/// Arguments for spawning a [`LeaseLockActor`].
#[derive(Debug, Clone)]
pub struct LeaseLockArguments {
    pub key: String,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub config: CitadelConfig,
}

impl LeaseLockArguments {
    pub fn new(key: impl Into<String>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            key: key.into(),
            breakers,
            config: CitadelConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CitadelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn identity(&self) -> ActorIdentity {
        ActorIdentity::new(LOCK_TYPE_NAME, self.key.clone())
    }
}

#[derive(Clone, Default)]
pub struct LeaseLockActor;

/// Runtime state of a [`LeaseLockActor`].
pub struct LeaseLockState {
    context: ActorContext,
    default_lease: Duration,
    idle_timeout: Duration,
    lease: LeaseRecord,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
    reason: DeactivationReason,
}

impl LeaseLockState {
    fn new(args: LeaseLockArguments) -> Self {
        let default_lease = args.config.lease.default_lease();
        let idle_timeout = args.config.lease.idle_timeout();
        Self {
            context: ActorContext::from_config(args.identity(), args.breakers, &args.config),
            default_lease,
            idle_timeout,
            lease: LeaseRecord::default(),
            generation: 0,
            timer: None,
            idle_timer: None,
            reason: DeactivationReason::Shutdown,
        }
    }

    /// Drop a lease whose expiry has passed.
    fn expire_if_stale(&mut self, now: Instant) {
        if self.lease.is_stale(now) {
            warn!(
                actor = %self.context.identity(),
                owner = ?self.lease.owner,
                "Lease expired, force releasing"
            );
            self.clear();
        }
    }

    fn clear(&mut self) -> Option<String> {
        self.cancel_timer();
        self.generation = self.generation.wrapping_add(1);
        self.lease.expires_at = None;
        self.lease.owner.take()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Start the idle countdown if the lease is free and none is running.
    fn arm_idle_timer_if_free(&mut self, myself: &ActorRef<LockMessage>) {
        if self.idle_timer.is_some() || self.lease.is_held(Instant::now()) {
            return;
        }
        let generation = self.generation;
        let after = self.idle_timeout;
        let actor = myself.clone();
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = actor.send_message(LockMessage::Idle { generation });
        }));
    }

    fn arm_timer(&mut self, myself: &ActorRef<LockMessage>, after: Duration) {
        self.cancel_timer();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let actor = myself.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = actor.send_message(LockMessage::Expire { generation });
        }));
    }

    fn try_acquire(&mut self, myself: &ActorRef<LockMessage>, owner: String, lease: Duration) -> bool {
        if owner.trim().is_empty() {
            warn!(actor = %self.context.identity(), "Lock acquire rejected: empty owner id");
            return false;
        }

        let now = Instant::now();
        self.expire_if_stale(now);
        if self.lease.is_held(now) {
            debug!(
                actor = %self.context.identity(),
                holder = ?self.lease.owner,
                requester = %owner,
                "Lock already held"
            );
            return false;
        }

        let lease = if lease.is_zero() { self.default_lease } else { lease };
        let Some(expires_at) = now.checked_add(lease) else {
            warn!(
                actor = %self.context.identity(),
                requester = %owner,
                lease_secs = lease.as_secs(),
                "Lock acquire rejected: lease out of range"
            );
            return false;
        };
        self.lease.expires_at = Some(expires_at);
        self.cancel_idle_timer();
        info!(
            actor = %self.context.identity(),
            owner = %owner,
            lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
            "Lock acquired"
        );
        self.lease.owner = Some(owner);
        self.arm_timer(myself, lease);
        true
    }

    fn release(&mut self, owner: &str) -> bool {
        let now = Instant::now();
        self.expire_if_stale(now);
        if !self.lease.is_held_by(owner, now) {
            warn!(
                actor = %self.context.identity(),
                holder = ?self.lease.owner,
                requester = owner,
                "Lock release rejected: not the owner"
            );
            return false;
        }
        self.clear();
        info!(actor = %self.context.identity(), owner, "Lock released");
        true
    }

    fn extend(&mut self, myself: &ActorRef<LockMessage>, owner: &str, additional: Duration) -> bool {
        let now = Instant::now();
        self.expire_if_stale(now);
        if !self.lease.is_held_by(owner, now) {
            warn!(actor = %self.context.identity(), requester = owner, "Lock extend rejected: not the owner");
            return false;
        }
        let Some(expires_at) = self.lease.expires_at else {
            return false;
        };

        let Some(extended) = expires_at.checked_add(additional) else {
            warn!(
                actor = %self.context.identity(),
                requester = owner,
                additional_secs = additional.as_secs(),
                "Lock extend rejected: lease out of range"
            );
            return false;
        };
        self.lease.expires_at = Some(extended);
        self.arm_timer(myself, extended.saturating_duration_since(now));
        info!(
            actor = %self.context.identity(),
            owner,
            additional_ms = u64::try_from(additional.as_millis()).unwrap_or(u64::MAX),
            "Lock extended"
        );
        true
    }

    fn force_release(&mut self) -> bool {
        match self.clear() {
            Some(previous) => {
                warn!(actor = %self.context.identity(), previous_owner = %previous, "Lock force released");
                true
            }
            None => false,
        }
    }

    fn on_expire(&mut self, generation: u64) {
        if generation != self.generation || self.lease.owner.is_none() {
            debug!(actor = %self.context.identity(), generation, "Ignoring superseded expiry timer");
            return;
        }
        self.timer = None;
        let previous = self.clear();
        info!(actor = %self.context.identity(), previous_owner = ?previous, "Lease expired");
    }

    /// Whether the idle timer tagged `generation` should stop the actor.
    fn on_idle(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.idle_timer = None;
        !self.lease.is_held(Instant::now())
    }

    fn is_locked(&self) -> bool {
        self.lease.is_held(Instant::now())
    }

    fn owner(&self) -> Option<String> {
        if self.lease.is_held(Instant::now()) {
            self.lease.owner.clone()
        } else {
            None
        }
    }
}

#[async_trait]
impl ActorLifecycle for LeaseLockState {
    fn context(&self) -> &ActorContext {
        &self.context
    }

    async fn cleanup_resources(&mut self) -> Result<(), ActorError> {
        self.cancel_timer();
        self.cancel_idle_timer();
        Ok(())
    }
}

impl Actor for LeaseLockActor {
    type Msg = LockMessage;
    type State = LeaseLockState;
    type Arguments = LeaseLockArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut state = LeaseLockState::new(args);
        state.activate().await?;
        state.arm_idle_timer_if_free(&myself);
        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let reason = state.reason.clone();
        state.deactivate(&reason).await;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            LockMessage::TryAcquire {
                owner,
                lease,
                reply,
            } => {
                let _ = reply.send(state.try_acquire(&myself, owner, lease));
            }

            LockMessage::Release { owner, reply } => {
                let _ = reply.send(state.release(&owner));
            }

            LockMessage::Extend {
                owner,
                additional,
                reply,
            } => {
                let _ = reply.send(state.extend(&myself, &owner, additional));
            }

            LockMessage::ForceRelease { reply } => {
                let _ = reply.send(state.force_release());
            }

            LockMessage::IsLocked { reply } => {
                let _ = reply.send(state.is_locked());
            }

            LockMessage::GetOwner { reply } => {
                let _ = reply.send(state.owner());
            }

            LockMessage::Expire { generation } => state.on_expire(generation),

            LockMessage::Idle { generation } => {
                if state.on_idle(generation) {
                    info!(actor = %state.context.identity(), "Lock idle, deactivating");
                    state.reason = DeactivationReason::Idle;
                    myself.stop(None);
                    return Ok(());
                }
            }
        }
        state.arm_idle_timer_if_free(&myself);
        Ok(())
    }
}
