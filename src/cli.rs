//! CLI / entrypoint wiring.
//!
//! A single `serve` mode (also the default when no subcommand is given),
//! since the core is a long-running server rather than a one-shot batch
//! tool. Flags mirror `AppConfig` fields for operational convenience.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ha-eink-screenshot-engine")]
#[command(about = "Home Assistant e-ink screenshot serving and scheduling engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, help = "JSON configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "HTTP listening port (overrides config/env)")]
    pub port: Option<u16>,

    #[arg(long, help = "Never destroy the browser on idle timeout or proactive restart")]
    pub keep_browser_open: bool,

    #[arg(long, help = "Run against a synthetic Home Assistant page instead of a real instance")]
    pub mock_ha: bool,

    #[arg(long, help = "Enable verbose (debug-level) logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server, scheduler, and browser facade (default).
    Serve,
}

/// One `tracing` subscriber configured once at process start, honoring
/// `RUST_LOG` when set and otherwise falling back to the verbosity implied
/// by `--verbose`. No other module configures logging independently.
pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;

    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}
