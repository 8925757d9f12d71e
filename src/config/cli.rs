//! Command-line argument definitions for botbox.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Command-line interface for botbox.
#[derive(Debug, Parser)]
#[command(name = "botbox")]
#[command(
    author,
    version,
    about = "Sandboxed multi-runtime supervisor for user scripts"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Tracing filter directive (overrides `RUST_LOG`).
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Bridge TCP port.
    #[arg(long, global = true)]
    pub bridge_port: Option<u16>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision the guest filesystem and install runtimes.
    Provision,

    /// Delete the guest filesystem so the next run re-provisions it.
    Reset,

    /// Show guest readiness and configured bots.
    Status,

    /// Run one bot in the foreground until it exits.
    Run(BotArgs),

    /// Start the bridge and every enabled bot; read inbound events from stdin.
    Serve,

    /// Stop a bot and clear its enabled flag.
    Stop(StopArgs),
}

/// Arguments naming a single bot.
#[derive(Debug, Parser)]
pub struct BotArgs {
    /// Bot identifier as listed in the bots file.
    #[arg(long, required = true)]
    pub bot: String,
}

/// Arguments for the `stop` subcommand.
#[derive(Debug, Parser)]
pub struct StopArgs {
    /// Bot identifier as listed in the bots file.
    #[arg(long, required = true)]
    pub bot: String,

    /// Keep the bot enabled so the next `serve` restarts it.
    #[arg(long)]
    pub pause: bool,
}
