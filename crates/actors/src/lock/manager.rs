//! Client side of lease locks: per-key handles, guards and a manager that
//! activates one lock actor per key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use citadel_core::CitadelConfig;
use futures::future::join_all;
use ractor::{Actor, ActorRef, ActorStatus, RpcReplyPort, SpawnErr};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::actor::{LeaseLockActor, LeaseLockArguments, LockMessage};
use crate::error::{ActorError, from_spawn_err};
use crate::resilience::CircuitBreakerRegistry;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Typed client for one lock actor.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    actor: ActorRef<LockMessage>,
    call_timeout: Duration,
}

impl LockHandle {
    #[must_use]
    pub fn new(key: impl Into<String>, actor: ActorRef<LockMessage>, call_timeout: Duration) -> Self {
        Self {
            key: key.into(),
            actor,
            call_timeout,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn request<T: Send + 'static>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> LockMessage,
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

    /// Take the lease for `lease` (zero selects the default lease).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn try_acquire(&self, owner: &str, lease: Duration) -> Result<bool, ActorError> {
        self.request(|reply| LockMessage::TryAcquire {
            owner: owner.to_string(),
            lease,
            reply,
        })
        .await
    }

    /// Release the lease held by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn release(&self, owner: &str) -> Result<bool, ActorError> {
        self.request(|reply| LockMessage::Release {
            owner: owner.to_string(),
            reply,
        })
        .await
    }

    /// Extend the lease held by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn extend(&self, owner: &str, additional: Duration) -> Result<bool, ActorError> {
        self.request(|reply| LockMessage::Extend {
            owner: owner.to_string(),
            additional,
            reply,
        })
        .await
    }

    /// Clear the lease regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn force_release(&self) -> Result<bool, ActorError> {
        self.request(|reply| LockMessage::ForceRelease { reply })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn is_locked(&self) -> Result<bool, ActorError> {
        self.request(|reply| LockMessage::IsLocked { reply }).await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn get_owner(&self) -> Result<Option<String>, ActorError> {
        self.request(|reply| LockMessage::GetOwner { reply }).await
    }

    fn release_detached(&self, owner: &str) {
        let (tx, _rx) = oneshot::channel::<bool>();
        let _ = self.actor.send_message(LockMessage::Release {
            owner: owner.to_string(),
            reply: tx.into(),
        });
    }
}

/// Proof of a successful acquire.
///
/// Call [`LockGuard::release`] to release and observe the outcome. A guard
/// dropped without releasing sends a best-effort release.
pub struct LockGuard {
    owner: String,
    handle: LockHandle,
    released: bool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.handle.key)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        self.handle.key()
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extend the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn extend(&self, additional: Duration) -> Result<bool, ActorError> {
        self.handle.extend(&self.owner, additional).await
    }

    /// Release the lease. Returns `false` if it had already expired or been
    /// taken away.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn release(mut self) -> Result<bool, ActorError> {
        self.released = true;
        self.handle.release(&self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(key = %self.handle.key, owner = %self.owner, "Releasing dropped lock guard");
            self.handle.release_detached(&self.owner);
        }
    }
}

/// Activates lock actors on demand, one per key in this process.
///
/// Lock actors deactivate themselves after sitting unheld for the idle
/// timeout; their entries are pruned on the next lookup.
pub struct LockManager {
    breakers: Arc<CircuitBreakerRegistry>,
    config: CitadelConfig,
    actors: Mutex<HashMap<String, ActorRef<LockMessage>>>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}

impl LockManager {
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, config: CitadelConfig) -> Self {
        Self {
            breakers,
            config,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for the lock actor of `key`, activating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::SpawnFailed`] if the actor cannot be started.
    pub async fn handle(&self, key: &str) -> Result<LockHandle, ActorError> {
        let mut actors = self.actors.lock().await;
        actors.retain(|_, actor| is_live(actor));
        if let Some(actor) = actors.get(key) {
            if matches!(actor.get_status(), ActorStatus::Running) {
                return Ok(self.wrap(key, actor.clone()));
            }
        }

        let args = LeaseLockArguments::new(key, Arc::clone(&self.breakers))
            .with_config(self.config.clone());
        let name = args.identity().registry_name();
        let actor = match Actor::spawn(Some(name.clone()), LeaseLockActor, args).await {
            Ok((actor, _join)) => actor,
            Err(SpawnErr::ActorAlreadyRegistered(_)) => ractor::registry::where_is(name.clone())
                .map(ActorRef::<LockMessage>::from)
                .ok_or_else(|| ActorError::spawn_failed(format!("{name}: registered actor vanished")))?,
            Err(e) => return Err(from_spawn_err(&name, e)),
        };
        actors.insert(key.to_string(), actor.clone());
        drop(actors);

        Ok(self.wrap(key, actor))
    }

    fn wrap(&self, key: &str, actor: ActorRef<LockMessage>) -> LockHandle {
        LockHandle::new(key, actor, self.config.lifecycle.call_timeout())
    }

    /// Number of lock actors currently active for this manager.
    pub async fn active_locks(&self) -> usize {
        let mut actors = self.actors.lock().await;
        actors.retain(|_, actor| is_live(actor));
        actors.len()
    }

    /// Run `op` against the actor for `key`, reactivating once if the actor
    /// went idle between lookup and delivery.
    async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T, ActorError>
    where
        F: Fn(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        match op(self.handle(key).await?).await {
            Err(ActorError::ActorUnavailable) => {
                debug!(key, "Lock actor stopped mid-call, reactivating");
                op(self.handle(key).await?).await
            }
            other => other,
        }
    }

    /// Try to take the lock. `None` means someone else holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<LockGuard>, ActorError> {
        self.call(key, |handle| async move {
            let acquired = handle.try_acquire(owner, lease).await;
            acquired.map(|acquired| {
                acquired.then(|| LockGuard {
                    owner: owner.to_string(),
                    handle,
                    released: false,
                })
            })
        })
        .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool, ActorError> {
        self.call(key, |handle| async move { handle.release(owner).await })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn extend(&self, key: &str, owner: &str, additional: Duration) -> Result<bool, ActorError> {
        self.call(key, |handle| async move { handle.extend(owner, additional).await })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn force_release(&self, key: &str) -> Result<bool, ActorError> {
        self.call(key, |handle| async move { handle.force_release().await })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn is_locked(&self, key: &str) -> Result<bool, ActorError> {
        self.call(key, |handle| async move { handle.is_locked().await })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the lock actor is unreachable.
    pub async fn get_owner(&self, key: &str) -> Result<Option<String>, ActorError> {
        self.call(key, |handle| async move { handle.get_owner().await })
            .await
    }

    /// Run `action` while holding the lock, releasing it afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::LockUnavailable`] without running `action`
    /// when the lock is held, otherwise the action's own result.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        action: F,
    ) -> Result<T, ActorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let Some(guard) = self.try_acquire(key, owner, lease).await? else {
            return Err(ActorError::lock_unavailable(key));
        };

        let result = action().await;
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => warn!(key, owner, "Lease lapsed before release"),
            Err(e) => warn!(key, owner, error = %e, "Lock release failed"),
        }
        result
    }

    /// Stop every lock actor started by this manager and wait for them.
    pub async fn shutdown(&self) {
        let actors: Vec<_> = self.actors.lock().await.drain().collect();
        let stops = actors.into_iter().map(|(key, actor)| async move {
            debug!(key = %key, "Stopping lock actor");
            if let Err(e) = actor.stop_and_wait(None, Some(SHUTDOWN_TIMEOUT)).await {
                warn!(key = %key, error = %e, "Lock actor did not stop cleanly");
            }
        });
        join_all(stops).await;
    }
}

fn is_live(actor: &ActorRef<LockMessage>) -> bool {
    !matches!(
        actor.get_status(),
        ActorStatus::Stopping | ActorStatus::Stopped
    )
}
