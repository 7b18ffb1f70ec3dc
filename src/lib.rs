//! Named, cached, filterable aggregate statistics over relational models.
//!
//! The engine lives in [`stats`]; [`config`] declares models and statistics
//! in TOML; [`cli`] drives both from the `mstat` binary.

pub mod cli;
pub mod config;
pub mod stats;

pub use cli::{Cli, Commands, run};
pub use config::{ConfigError, StatsConfig};

use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
