//! # Citadel - demo entry point
//!
//! Wires the resilience layer together against the in-memory store:
//!
//! 1. **Configuration** - load `citadel.toml` (or defaults) and validate it
//! 2. **Breaker registry** - one process-wide registry shared by every actor
//! 3. **Stateful counter** - apply coalesced updates, then force a durable write
//! 4. **Lease lock** - run a critical section under a lock owned by this run
//! 5. **Summary** - print what happened as JSON, then deactivate everything
//!
//! Set `RUST_LOG=debug` to watch retries, flushes and lease transitions.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use citadel_actors::{
    ActorError, CircuitBreakerRegistry, CircuitSnapshot, DeactivationReason, DurableStore,
    LockManager, MemoryStore, PersistenceStrategy, StatefulArguments, spawn_stateful,
};
use citadel_core::CitadelConfig;

use crate::cli::Cli;

/// Counter state persisted by the demo actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: u64,
    last_owner: Option<String>,
}

struct CounterStrategy;

impl PersistenceStrategy for CounterStrategy {
    type State = Counter;

    fn type_name(&self) -> &'static str {
        "Counter"
    }

    fn default_state(&self) -> Counter {
        Counter::default()
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    counter: Counter,
    version: u64,
    durable_writes: u64,
    lock_key: String,
    lock_owner: String,
    critical_section_ran: bool,
    circuits: Vec<CircuitSummary>,
    elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
struct CircuitSummary {
    name: String,
    state: String,
    window_failures: usize,
}

impl From<CircuitSnapshot> for CircuitSummary {
    fn from(snapshot: CircuitSnapshot) -> Self {
        Self {
            name: snapshot.name,
            state: snapshot.state.to_string(),
            window_failures: snapshot.window_failures,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(updates = cli.updates, lock_key = %cli.lock_key, "Citadel demo starting");

    let breakers = CircuitBreakerRegistry::from_settings(&config.circuit_breaker);
    let store = Arc::new(MemoryStore::new());

    let counter = spawn_stateful(
        StatefulArguments::new(
            "demo",
            CounterStrategy,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::clone(&breakers),
        )
        .with_config(config.clone()),
    )
    .await
    .context("Failed to activate counter actor")?;

    for _ in 0..cli.updates {
        counter
            .update(|c: &mut Counter| {
                c.value += 1;
                Ok(())
            })
            .await
            .context("Counter update failed")?;
    }
    let version = counter
        .force_persist()
        .await
        .context("Failed to persist counter")?;
    info!(version, "Counter persisted");

    let owner = format!("citadel-{}", uuid::Uuid::new_v4());
    let locks = LockManager::new(Arc::clone(&breakers), config.clone());
    let critical_owner = owner.clone();
    let counter_in_lock = counter.clone();
    let critical_section_ran = locks
        .with_lock(&cli.lock_key, &owner, Duration::ZERO, || async move {
            counter_in_lock
                .update_critical(move |c: &mut Counter| {
                    c.last_owner = Some(critical_owner);
                    Ok(())
                })
                .await
                .map(|_| true)
        })
        .await
        .or_else(|e| match e {
            ActorError::LockUnavailable(_) => Ok(false),
            other => Err(other),
        })
        .context("Critical section failed")?;

    let summary = Summary {
        counter: counter
            .get()
            .await
            .context("Failed to read counter")?
            .unwrap_or_default(),
        version: counter.version().await.context("Failed to read version")?,
        durable_writes: store.write_count(),
        lock_key: cli.lock_key.clone(),
        lock_owner: owner,
        critical_section_ran,
        circuits: breakers.snapshots().into_iter().map(CircuitSummary::from).collect(),
        elapsed_ms: u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
    };

    counter
        .deactivate(DeactivationReason::Shutdown)
        .await
        .context("Failed to deactivate counter actor")?;
    locks.shutdown().await;
    breakers.shutdown();

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to render summary")?
    );
    info!("Citadel demo finished");
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<CitadelConfig> {
    let config = match &cli.config {
        Some(path) => CitadelConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CitadelConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
