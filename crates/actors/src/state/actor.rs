//! Stateful actor with durable, conflict-aware, write-behind persistence.
//!
//! # Activation
//!
//! The stored record is read with retries. A valid record is used as-is, an
//! invalid one is repaired if the strategy can, and anything else falls back
//! according to [`RecoveryMode`].
//!
//! # Writes
//!
//! Mutations update memory immediately and enqueue a persist request. The
//! first request schedules a `Flush` message after the coalescing window; the
//! flush performs one durable write of the full state. Critical updates and
//! [`StatefulHandle::force_persist`] write synchronously. A failed write
//! leaves the state dirty: a failed flush is retried with backoff, and any
//! dirty state is written on deactivation.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citadel_core::{CitadelConfig, PersistenceSettings, RecoveryMode};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::{LoadedState, StateHandle, encode};
use super::queue::WriteBehindQueue;
use super::strategy::PersistenceStrategy;
use crate::error::{ActorError, from_spawn_err};
use crate::identity::{ActorIdentity, DeactivationReason};
use crate::lifecycle::{ActorContext, ActorLifecycle};
use crate::resilience::{CircuitBreakerError, CircuitBreakerRegistry, RetryPolicy};
use crate::store::DurableStore;

/// A state mutation shipped to the actor.
pub type Mutation<S> = Box<dyn FnOnce(&mut S) -> Result<(), ActorError> + Send>;

/// Messages for [`StatefulActor`].
///
/// Queries and commands both reply; `Flush` is sent by the actor to itself.
pub enum StatefulMessage<S> {
    /// Current in-memory state (`None` after a delete).
    Get { reply: RpcReplyPort<Option<S>> },

    /// Apply a mutation. Critical updates persist before replying.
    Update {
        mutation: Mutation<S>,
        critical: bool,
        reply: RpcReplyPort<Result<S, ActorError>>,
    },

    /// Clear durable and in-memory state.
    Delete {
        reply: RpcReplyPort<Result<bool, ActorError>>,
    },

    /// Write the current state now.
    ForcePersist {
        reply: RpcReplyPort<Result<u64, ActorError>>,
    },

    /// Version of the last successful durable write.
    Version { reply: RpcReplyPort<u64> },

    /// Number of persist requests not yet flushed.
    PendingWrites { reply: RpcReplyPort<usize> },

    /// Coalescing window elapsed.
    Flush,

    /// Stop the actor, persisting pending writes first.
    Deactivate { reason: DeactivationReason },
}

impl<S> fmt::Debug for StatefulMessage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get { .. } => "Get",
            Self::Update { critical: true, .. } => "Update(critical)",
            Self::Update { .. } => "Update",
            Self::Delete { .. } => "Delete",
            Self::ForcePersist { .. } => "ForcePersist",
            Self::Version { .. } => "Version",
            Self::PendingWrites { .. } => "PendingWrites",
            Self::Flush => "Flush",
            Self::Deactivate { .. } => "Deactivate",
        };
        f.write_str(name)
    }
}

/// Arguments for spawning a [`StatefulActor`].
pub struct StatefulArguments<P> {
    pub key: String,
    pub strategy: P,
    pub store: Arc<dyn DurableStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub config: CitadelConfig,
    pub cancel: CancellationToken,
}

impl<P: PersistenceStrategy> StatefulArguments<P> {
    /// Arguments with default configuration.
    pub fn new(
        key: impl Into<String>,
        strategy: P,
        store: Arc<dyn DurableStore>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            key: key.into(),
            strategy,
            store,
            breakers,
            config: CitadelConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CitadelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Identity the actor will run under.
    #[must_use]
    pub fn identity(&self) -> ActorIdentity {
        ActorIdentity::new(self.strategy.type_name(), self.key.clone())
    }
}

/// Actor definition for state managed by `P`.
pub struct StatefulActor<P>(PhantomData<fn() -> P>);

impl<P> Default for StatefulActor<P> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// Runtime state of a [`StatefulActor`].
pub struct StatefulState<P: PersistenceStrategy> {
    context: ActorContext,
    strategy: P,
    handle: StateHandle<P::State>,
    settings: PersistenceSettings,
    write_attempts: u32,
    queue: WriteBehindQueue,
    flush_timer: Option<JoinHandle<()>>,
    flush_failures: u32,
    reason: DeactivationReason,
}

impl<P: PersistenceStrategy> StatefulState<P> {
    fn new(args: StatefulArguments<P>) -> Self {
        let identity = args.identity();
        let context = ActorContext::from_config(identity.clone(), args.breakers, &args.config)
            .with_cancellation(args.cancel);
        Self {
            context,
            handle: StateHandle::new(identity.registry_name(), args.store),
            strategy: args.strategy,
            settings: args.config.persistence.clone(),
            write_attempts: args.config.retry.max_attempts,
            queue: WriteBehindQueue::new(),
            flush_timer: None,
            flush_failures: 0,
            reason: DeactivationReason::Shutdown,
        }
    }

    fn write_circuit(&self) -> String {
        format!("{}-state", self.strategy.type_name())
    }

    async fn recover(&mut self) -> Result<(), ActorError> {
        let identity = self.context.identity().clone();
        match self.read_with_retry().await {
            Ok(LoadedState::Absent) => {
                debug!(actor = %identity, "No stored state, starting from default");
                self.handle.set(self.strategy.default_state(), 0);
            }
            Ok(LoadedState::Present { payload, version })
                if self.strategy.validate(payload.as_ref()) =>
            {
                let payload = payload.unwrap_or_else(|| self.strategy.default_state());
                debug!(actor = %identity, version, "State loaded");
                self.handle.set(payload, version);
            }
            Ok(LoadedState::Present { payload, version }) => match self.strategy.repair(payload) {
                Some(repaired) => {
                    warn!(actor = %identity, version, "Stored state invalid, repaired");
                    self.handle.set(repaired, version);
                    self.persist_recovered().await;
                }
                None => {
                    self.fall_back(version, "stored state is invalid and cannot be repaired")
                        .await?;
                }
            },
            Err(ActorError::Cancelled) => return Err(ActorError::Cancelled),
            Err(e) => {
                self.fall_back(0, &format!("state read failed: {e}")).await?;
            }
        }

        if let Some(state) = self.handle.get() {
            self.strategy.on_state_recovered(state).await;
        }
        Ok(())
    }

    async fn fall_back(&mut self, version: u64, cause: &str) -> Result<(), ActorError> {
        let identity = self.context.identity().clone();
        match self.settings.recovery_mode {
            RecoveryMode::FailLoudly => {
                error!(actor = %identity, cause, "State unrecoverable, refusing activation");
                Err(ActorError::state_unrecoverable(format!("{identity}: {cause}")))
            }
            RecoveryMode::Degrade => {
                warn!(actor = %identity, cause, "State unrecoverable, using default state");
                self.handle.set(self.strategy.default_state(), version);
                self.persist_recovered().await;
                Ok(())
            }
        }
    }

    /// Persist state chosen during recovery; a failure leaves it dirty.
    async fn persist_recovered(&mut self) {
        if let Err(e) = self.write_state().await {
            error!(actor = %self.context.identity(), error = %e, "Failed to persist recovered state");
            self.queue.mark_dirty();
        }
    }

    async fn read_with_retry(&self) -> Result<LoadedState<P::State>, ActorError> {
        let policy = RetryPolicy::new(self.settings.read_attempts, self.settings.read_base_delay());
        let max_attempts = policy.max_attempts.max(1);
        let cancel = self.context.cancellation();
        let mut attempt = 1;

        loop {
            match self.handle.read().await {
                Ok(loaded) => return Ok(loaded),
                Err(e) if attempt < max_attempts => {
                    let delay = policy.calculate_delay(attempt);
                    warn!(
                        actor = %self.context.identity(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "State read failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(ActorError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        actor = %self.context.identity(),
                        attempts = max_attempts,
                        error = %e,
                        "State read failed"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// One durable write of the current state, behind the write circuit
    /// when guarded.
    async fn write_state(&mut self) -> Result<u64, ActorError> {
        if !self.settings.guard_writes {
            return self.write_with_conflict_retry().await;
        }

        let breaker = self.context.breakers().get_or_create(&self.write_circuit());
        match breaker.execute(|| self.write_with_conflict_retry()).await {
            Ok(version) => Ok(version),
            Err(CircuitBreakerError::Open { circuit }) => {
                warn!(actor = %self.context.identity(), %circuit, "State write rejected by open circuit");
                Err(ActorError::CircuitOpen(circuit))
            }
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        }
    }

    async fn write_with_conflict_retry(&mut self) -> Result<u64, ActorError> {
        let max_attempts = self.settings.conflict_attempts.max(1);
        let mut attempt = 1;

        loop {
            let Some(payload) = self.handle.get() else {
                return Ok(self.handle.version());
            };
            let bytes = encode(payload)?;
            let expected = self.handle.version();

            match self.write_once(bytes, expected).await {
                Ok(version) => {
                    self.handle.set_version(version);
                    return Ok(version);
                }
                Err(ActorError::VersionConflict { expected, actual }) if attempt < max_attempts => {
                    warn!(
                        actor = %self.context.identity(),
                        attempt,
                        expected,
                        actual,
                        "Version conflict, reconciling with stored state"
                    );
                    self.reconcile().await?;
                    tokio::time::sleep(self.settings.conflict_delay().saturating_mul(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(&self, bytes: Vec<u8>, expected: u64) -> Result<u64, ActorError> {
        let handle = &self.handle;
        self.context
            .execute_with_retry(
                "state.write",
                || {
                    let bytes = bytes.clone();
                    async move {
                        handle
                            .write_encoded(bytes, expected)
                            .await
                            .map_err(ActorError::from)
                    }
                },
                self.write_attempts,
            )
            .await
    }

    async fn reconcile(&mut self) -> Result<(), ActorError> {
        let (stored, version) = match self.handle.read().await? {
            LoadedState::Absent => (None, 0),
            LoadedState::Present { payload, version } => (payload, version),
        };
        let Some(local) = self.handle.get() else {
            return Ok(());
        };
        let merged = self.strategy.resolve_conflict(local, stored.as_ref()).await?;
        self.handle.set(merged, version);
        Ok(())
    }

    async fn update(
        &mut self,
        myself: &ActorRef<StatefulMessage<P::State>>,
        mutation: Mutation<P::State>,
        critical: bool,
    ) -> Result<P::State, ActorError> {
        let mut next = match self.handle.get() {
            Some(state) => state.clone(),
            None => self.strategy.default_state(),
        };
        mutation(&mut next)?;
        self.handle.set(next.clone(), self.handle.version());

        if critical {
            self.force_persist().await?;
        } else {
            self.request_persist(myself);
        }
        Ok(next)
    }

    fn request_persist(&mut self, myself: &ActorRef<StatefulMessage<P::State>>) {
        if self.queue.enqueue() {
            self.schedule_flush(myself, self.settings.coalesce_window());
        }
    }

    fn schedule_flush(&mut self, myself: &ActorRef<StatefulMessage<P::State>>, after: Duration) {
        let actor = myself.clone();
        self.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = actor.send_message(StatefulMessage::Flush);
        }));
    }

    /// Coalescing window doubled per consecutive failed flush, capped at
    /// the retry policy's maximum delay.
    fn flush_retry_delay(&self) -> Duration {
        let window = self.settings.coalesce_window();
        let max = self.context.retry_policy().max_delay.max(window);
        window
            .saturating_mul(2u32.saturating_pow(self.flush_failures.min(16)))
            .min(max)
    }

    fn cancel_flush_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }

    async fn flush(&mut self, myself: &ActorRef<StatefulMessage<P::State>>) {
        self.flush_timer = None;
        let drained = self.queue.drain();
        if drained.is_empty() {
            return;
        }

        let context = self.context.clone();
        match context.track_performance("flush", self.write_state()).await {
            Ok(version) => {
                self.flush_failures = 0;
                debug!(actor = %context.identity(), coalesced = drained.len(), version, "Pending writes flushed");
            }
            Err(e) => {
                self.flush_failures = self.flush_failures.saturating_add(1);
                self.queue.restore(drained);
                let retry_in = self.flush_retry_delay();
                warn!(
                    actor = %context.identity(),
                    pending = self.queue.len(),
                    failures = self.flush_failures,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Flush failed, state stays dirty"
                );
                if self.queue.claim_flush() {
                    self.schedule_flush(myself, retry_in);
                }
            }
        }
    }

    async fn force_persist(&mut self) -> Result<u64, ActorError> {
        self.cancel_flush_timer();
        let drained = self.queue.drain();

        let context = self.context.clone();
        let result = context.track_performance("force_persist", self.write_state()).await;
        match &result {
            Ok(_) => self.flush_failures = 0,
            Err(e) => {
                self.queue.restore(drained);
                if self.queue.is_empty() {
                    self.queue.mark_dirty();
                }
                warn!(
                    actor = %context.identity(),
                    error = %e,
                    "Synchronous persist failed, state stays dirty"
                );
            }
        }
        result
    }

    async fn delete(&mut self) -> Result<bool, ActorError> {
        self.cancel_flush_timer();
        let existed = self.handle.version() > 0 || !self.queue.is_empty();
        self.queue.clear();

        let handle = &self.handle;
        self.context
            .execute_with_retry(
                "state.clear",
                || async move { handle.clear().await.map_err(ActorError::from) },
                self.write_attempts,
            )
            .await?;
        self.handle.clear_local();

        info!(actor = %self.context.identity(), existed, "State deleted");
        Ok(existed)
    }
}

#[async_trait]
impl<P: PersistenceStrategy> ActorLifecycle for StatefulState<P> {
    fn context(&self) -> &ActorContext {
        &self.context
    }

    async fn recover_state(&mut self) -> Result<(), ActorError> {
        self.recover().await
    }

    async fn cleanup_resources(&mut self) -> Result<(), ActorError> {
        self.cancel_flush_timer();
        if self.queue.is_empty() {
            return Ok(());
        }
        self.force_persist().await.map(|_| ())
    }
}

impl<P: PersistenceStrategy> Actor for StatefulActor<P> {
    type Msg = StatefulMessage<P::State>;
    type State = StatefulState<P>;
    type Arguments = StatefulArguments<P>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut state = StatefulState::new(args);
        state.activate().await?;
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
            StatefulMessage::Get { reply } => {
                let _ = reply.send(state.handle.get().cloned());
            }

            StatefulMessage::Update {
                mutation,
                critical,
                reply,
            } => {
                let result = state.update(&myself, mutation, critical).await;
                let _ = reply.send(result);
            }

            StatefulMessage::Delete { reply } => {
                let result = state.delete().await;
                let _ = reply.send(result);
            }

            StatefulMessage::ForcePersist { reply } => {
                let result = state.force_persist().await;
                let _ = reply.send(result);
            }

            StatefulMessage::Version { reply } => {
                let _ = reply.send(state.handle.version());
            }

            StatefulMessage::PendingWrites { reply } => {
                let _ = reply.send(state.queue.len());
            }

            StatefulMessage::Flush => state.flush(&myself).await,

            StatefulMessage::Deactivate { reason } => {
                state.reason = reason;
                myself.stop(None);
            }
        }
        Ok(())
    }
}

/// Spawn a stateful actor registered as `Type:key`.
///
/// # Errors
///
/// Returns [`ActorError::StateUnrecoverable`] when activation refuses the
/// stored state, or [`ActorError::SpawnFailed`] for other spawn failures
/// (including an actor already running for the same key).
pub async fn spawn_stateful<P: PersistenceStrategy>(
    args: StatefulArguments<P>,
) -> Result<StatefulHandle<P::State>, ActorError> {
    let identity = args.identity();
    let call_timeout = args.config.lifecycle.call_timeout();
    let (actor, join) = Actor::spawn(
        Some(identity.registry_name()),
        StatefulActor::<P>::default(),
        args,
    )
    .await
    .map_err(|e| from_spawn_err(&identity.to_string(), e))?;

    Ok(StatefulHandle {
        identity,
        actor,
        join: Arc::new(Mutex::new(Some(join))),
        call_timeout,
    })
}

/// Typed client for a running [`StatefulActor`].
pub struct StatefulHandle<S> {
    identity: ActorIdentity,
    actor: ActorRef<StatefulMessage<S>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
    call_timeout: Duration,
}

impl<S> Clone for StatefulHandle<S> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            actor: self.actor.clone(),
            join: Arc::clone(&self.join),
            call_timeout: self.call_timeout,
        }
    }
}

impl<S> fmt::Debug for StatefulHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulHandle")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl<S: Clone + Send + 'static> StatefulHandle<S> {
    #[must_use]
    pub const fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn actor(&self) -> &ActorRef<StatefulMessage<S>> {
        &self.actor
    }

    async fn request<T: Send + 'static>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> StatefulMessage<S>,
    ) -> Result<T, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send_message(build(tx.into()))
            .map_err(|_| ActorError::actor_unavailable())?;

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ActorError::actor_unavailable()),
            Err(_) => Err(ActorError::rpc_timeout(self.call_timeout)),
        }
    }

    /// Current state, `None` after a delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor is unreachable.
    pub async fn get(&self) -> Result<Option<S>, ActorError> {
        self.request(|reply| StatefulMessage::Get { reply }).await
    }

    /// Apply `mutation` and schedule a coalesced write.
    ///
    /// # Errors
    ///
    /// Returns the mutation's error, in which case state is unchanged.
    pub async fn update<F>(&self, mutation: F) -> Result<S, ActorError>
    where
        F: FnOnce(&mut S) -> Result<(), ActorError> + Send + 'static,
    {
        self.send_update(Box::new(mutation), false).await
    }

    /// Apply `mutation` and persist before returning.
    ///
    /// # Errors
    ///
    /// Returns the mutation's error or the durable write's error.
    pub async fn update_critical<F>(&self, mutation: F) -> Result<S, ActorError>
    where
        F: FnOnce(&mut S) -> Result<(), ActorError> + Send + 'static,
    {
        self.send_update(Box::new(mutation), true).await
    }

    async fn send_update(&self, mutation: Mutation<S>, critical: bool) -> Result<S, ActorError> {
        self.request(|reply| StatefulMessage::Update {
            mutation,
            critical,
            reply,
        })
        .await?
    }

    /// Clear durable and in-memory state. Returns whether state existed.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the record cannot be cleared.
    pub async fn delete(&self) -> Result<bool, ActorError> {
        self.request(|reply| StatefulMessage::Delete { reply }).await?
    }

    /// Write the current state now and return the new version.
    ///
    /// # Errors
    ///
    /// Returns the durable write's error.
    pub async fn force_persist(&self) -> Result<u64, ActorError> {
        self.request(|reply| StatefulMessage::ForcePersist { reply })
            .await?
    }

    /// Version of the last successful durable write.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor is unreachable.
    pub async fn version(&self) -> Result<u64, ActorError> {
        self.request(|reply| StatefulMessage::Version { reply }).await
    }

    /// Persist requests waiting for the next flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor is unreachable.
    pub async fn pending_writes(&self) -> Result<usize, ActorError> {
        self.request(|reply| StatefulMessage::PendingWrites { reply })
            .await
    }

    /// Stop the actor after persisting pending writes, and wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor is unreachable or does not stop within
    /// the call timeout.
    pub async fn deactivate(&self, reason: DeactivationReason) -> Result<(), ActorError> {
        self.actor
            .send_message(StatefulMessage::Deactivate { reason })
            .map_err(|_| ActorError::actor_unavailable())?;

        let join = self.join.lock().await.take();
        if let Some(join) = join {
            tokio::time::timeout(self.call_timeout, join)
                .await
                .map_err(|_| ActorError::rpc_timeout(self.call_timeout))?
                .map_err(|e| ActorError::internal(e.to_string()))?;
        }
        Ok(())
    }
}
