//! Configuration data types for botbox.

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoResult, PostMergeContext, PostMergeHook};
use serde::{Deserialize, Serialize};

/// Guest filesystem provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Host directory that becomes the guest root.
    pub root_dir: Utf8PathBuf,

    /// Directory where downloaded archives are cached.
    pub cache_dir: Utf8PathBuf,

    /// Setup version recorded in the readiness marker. Bumping it wipes the
    /// guest on the next provisioning run.
    pub setup_version: u32,

    /// Bundled images in preference order (pre-optimised image first).
    pub local_images: Vec<Utf8PathBuf>,

    /// Mirror URLs tried in order when no bundled image exists.
    pub mirrors: Vec<String>,

    /// Leading path segments removed from every archive entry.
    pub strip_components: u32,

    /// Nameservers written to the guest `/etc/resolv.conf`.
    pub nameservers: Vec<String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            root_dir: Utf8PathBuf::from("/var/lib/botbox/rootfs"),
            cache_dir: Utf8PathBuf::from("/var/lib/botbox/cache"),
            setup_version: 1,
            local_images: vec![
                Utf8PathBuf::from("/usr/share/botbox/rootfs-optimized.tar.gz"),
                Utf8PathBuf::from("/usr/share/botbox/rootfs-base.tar.gz"),
            ],
            mirrors: vec![
                String::from(
                    "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/aarch64/alpine-minirootfs-3.20.3-aarch64.tar.gz",
                ),
                String::from(
                    "https://mirrors.tuna.tsinghua.edu.cn/alpine/v3.20/releases/aarch64/alpine-minirootfs-3.20.3-aarch64.tar.gz",
                ),
            ],
            strip_components: 0,
            nameservers: vec![String::from("8.8.8.8"), String::from("1.1.1.1")],
        }
    }
}

/// A Node.js release channel publishing a `SHASUMS256.txt` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReleaseChannelConfig {
    /// Channel name used in logs.
    pub name: String,

    /// Directory URL containing the manifest and archives. `{major}` is
    /// replaced with the pinned major version.
    pub base_url: String,

    /// Whether the channel publishes musl builds (`-musl` suffix).
    #[serde(default)]
    pub musl: bool,
}

/// Guest runtime installation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pinned Node.js major version.
    pub node_major: u32,

    /// Architecture label used in Node.js archive names. Derived from the
    /// host when unset.
    pub node_arch: Option<String>,

    /// Release channels in trust order.
    pub node_channels: Vec<ReleaseChannelConfig>,

    /// Package-manager attempts before giving up.
    pub install_attempts: u32,

    /// Fixed delay between package-manager attempts in milliseconds.
    pub install_backoff_ms: u64,

    /// Alpine package mirrors rotated between attempts.
    pub package_mirrors: Vec<String>,

    /// Alpine release branch used in the repository configuration.
    pub alpine_branch: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_major: 22,
            node_arch: None,
            node_channels: vec![
                ReleaseChannelConfig {
                    name: String::from("release"),
                    base_url: String::from("https://nodejs.org/dist/latest-v{major}.x"),
                    musl: false,
                },
                ReleaseChannelConfig {
                    name: String::from("unofficial"),
                    base_url: String::from(
                        "https://unofficial-builds.nodejs.org/download/release/latest-v{major}.x",
                    ),
                    musl: true,
                },
                ReleaseChannelConfig {
                    name: String::from("nightly"),
                    base_url: String::from("https://nodejs.org/download/nightly/latest-v{major}.x"),
                    musl: false,
                },
            ],
            install_attempts: 3,
            install_backoff_ms: 2_000,
            package_mirrors: vec![
                String::from("https://dl-cdn.alpinelinux.org/alpine"),
                String::from("https://mirrors.tuna.tsinghua.edu.cn/alpine"),
            ],
            alpine_branch: String::from("v3.20"),
        }
    }
}

/// Isolation-layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to the `proot` binary on the host.
    pub proot_binary: Utf8PathBuf,

    /// Directory holding the loader and helper libraries `proot` needs.
    pub loader_dir: Utf8PathBuf,

    /// Explicit `proot` loader path. Resolved from the host environment when
    /// unset.
    pub loader: Option<Utf8PathBuf>,

    /// Host directory bound to the guest `/tmp`.
    pub tmp_dir: Option<Utf8PathBuf>,

    /// Kernel release reported inside the guest.
    pub kernel_release: String,

    /// Export `PROOT_NO_SECCOMP=1` to the isolation process. When false the
    /// host environment's value, if any, is passed through.
    pub no_seccomp: bool,

    /// Grace period between the graceful and forceful stop signals.
    pub stop_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            proot_binary: Utf8PathBuf::from("/usr/lib/botbox/proot"),
            loader_dir: Utf8PathBuf::from("/usr/lib/botbox"),
            loader: None,
            tmp_dir: None,
            kernel_release: String::from("6.2.0-botbox"),
            no_seccomp: false,
            stop_grace_ms: 300,
        }
    }
}

/// Bridge server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the bridge listens on.
    pub bind_address: String,

    /// TCP port guests connect to.
    pub port: u16,

    /// Minimum gap between identical replies in milliseconds.
    pub reply_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1"),
            port: 17_235,
            reply_interval_ms: 1_000,
        }
    }
}

/// Tenant supervision configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum number of concurrently running tenants.
    pub max_tenants: usize,

    /// TOML file listing the bots.
    pub bots_file: Utf8PathBuf,

    /// Directory holding one workspace per bot alias.
    pub workspaces_dir: Utf8PathBuf,

    /// JSON-lines file receiving error records.
    pub error_log: Utf8PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_tenants: 16,
            bots_file: Utf8PathBuf::from("/var/lib/botbox/bots.toml"),
            workspaces_dir: Utf8PathBuf::from("/var/lib/botbox/workspaces"),
            error_log: Utf8PathBuf::from("/var/lib/botbox/errors.jsonl"),
        }
    }
}

/// Root application configuration.
///
/// Loaded with layered precedence (lowest to highest): defaults,
/// configuration file, environment variables, command-line arguments.
///
/// Configuration files are discovered in this order:
/// 1. Path specified via `BOTBOX_CONFIG_PATH`
/// 2. `.botbox.toml` in the current working directory
/// 3. `.botbox.toml` in the home directory
/// 4. `~/.config/botbox/config.toml` (XDG default)
#[derive(Debug, Clone, Default, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(
    prefix = "BOTBOX",
    post_merge_hook,
    discovery(
        app_name = "botbox",
        env_var = "BOTBOX_CONFIG_PATH",
        config_file_name = "config.toml",
        dotfile_name = ".botbox.toml",
        config_cli_long = "config",
        config_cli_visible = true,
    )
)]
pub struct AppConfig {
    /// Tracing filter directive, e.g. `botbox=debug`.
    pub log_filter: Option<String>,

    /// Guest filesystem configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub guest: GuestConfig,

    /// Runtime installation configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub runtime: RuntimeConfig,

    /// Isolation-layer configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub sandbox: SandboxConfig,

    /// Bridge configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub bridge: BridgeConfig,

    /// Supervisor configuration.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub supervisor: SupervisorConfig,
}

impl AppConfig {
    /// Check cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |field: &str, reason: &str| -> crate::error::Result<()> {
            Err(crate::error::ConfigError::InvalidValue {
                field: String::from(field),
                reason: String::from(reason),
            }
            .into())
        };

        if self.guest.root_dir.as_str().trim().is_empty() {
            return invalid("guest.root_dir", "cannot be empty");
        }
        if self.runtime.node_major == 0 {
            return invalid("runtime.node_major", "must be a positive integer");
        }
        if self.runtime.install_attempts == 0 {
            return invalid("runtime.install_attempts", "must be at least 1");
        }
        if self.supervisor.max_tenants == 0 {
            return invalid("supervisor.max_tenants", "must be at least 1");
        }
        Ok(())
    }
}

impl PostMergeHook for AppConfig {
    fn post_merge(&mut self, _ctx: &PostMergeContext) -> OrthoResult<()> {
        // Empty strings from the environment mean "unset".
        if self.log_filter.as_deref().is_some_and(|filter| filter.trim().is_empty()) {
            self.log_filter = None;
        }
        Ok(())
    }
}
