//! CLI argument definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::Parser;

/// Citadel - resilient stateful actors
#[derive(Parser, Debug)]
#[command(name = "citadel")]
#[command(version)]
#[command(about = "Exercise Citadel's stateful and lease lock actors against an in-memory store")]
#[command(
    long_about = "Citadel activates a stateful counter actor and a lease lock actor, applies coalesced updates, forces a durable write, runs a critical section under the lock and prints a JSON summary."
)]
pub struct Cli {
    /// Path to a citadel.toml configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Key of the lease lock guarding the critical section
    #[arg(short, long, default_value = "citadel-demo")]
    pub lock_key: String,

    /// Number of coalesced updates to apply to the counter
    #[arg(short, long, default_value_t = 10)]
    pub updates: u32,
}
