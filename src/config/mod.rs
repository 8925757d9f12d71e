//! Configuration system for botbox.
//!
//! Configuration structures, CLI definitions and the layered loader. CLI flags
//! override environment variables, which override the configuration file,
//! which overrides the defaults.
//!
//! The configuration file is expected at `~/.config/botbox/config.toml` by
//! default.
//!
//! # Example Configuration
//!
//! ```toml
//! log_filter = "botbox=debug"
//!
//! [guest]
//! root_dir = "/var/lib/botbox/rootfs"
//! setup_version = 2
//!
//! [runtime]
//! node_major = 22
//! install_attempts = 3
//!
//! [sandbox]
//! proot_binary = "/usr/lib/botbox/proot"
//! stop_grace_ms = 300
//!
//! [bridge]
//! port = 17235
//!
//! [supervisor]
//! max_tenants = 16
//! bots_file = "/var/lib/botbox/bots.toml"
//! ```

mod cli;
mod loader;
mod types;

#[cfg(test)]
mod tests;

pub use cli::{BotArgs, Cli, Commands, StopArgs};
pub use loader::{env_var_names, load_config};
pub use types::{
    AppConfig, BridgeConfig, GuestConfig, ReleaseChannelConfig, RuntimeConfig, SandboxConfig,
    SupervisorConfig,
};
