//! Burrow - resilient SSH tunnels
//!
//! A reconnecting SSH client transport with forward and reverse tunnels on
//! top, plus the SSH server side that serves those tunnels.

pub mod config;
pub mod forwarding;
pub mod registry;
pub mod server;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins; otherwise `info`, or `warn` when quiet.
pub fn init_logging(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
