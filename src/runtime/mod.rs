//! Guest interpreter installation and Node.js version pinning.
//!
//! [`RuntimeEnvironmentManager`] makes sure `node` and `python3` exist in the
//! guest, installing them through the guest package manager with bounded
//! retries and mirror rotation, and then pins Node.js to the configured major
//! version by installing a verified release archive when the packaged one
//! does not match.

mod candidates;
mod upgrade;

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;

pub use candidates::{Candidate, MANIFEST_NAME, collect_candidates, manifest_url, node_arch, parse_manifest};
pub use upgrade::{NODE_INSTALL_DIR, install_candidate};

use crate::config::RuntimeConfig;
use crate::error::{BotboxError, Result, RuntimeError};
use crate::retry::RetryPolicy;
use crate::rootfs::Downloader;
use crate::sandbox::GuestShell;

const INTERPRETER_PROBE: &str = "command -v node >/dev/null 2>&1 && command -v python3 >/dev/null 2>&1";
const INSTALL_SCRIPT: &str = "apk update && apk add --no-cache nodejs npm python3 py3-pip";
const VERSION_PROBE: &str = "node --version";
const REPOSITORIES_FILE: &str = "etc/apk/repositories";

/// Outcome of [`RuntimeEnvironmentManager::ensure_runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// The installed Node.js already matches the pinned major.
    Pinned {
        /// Version reported by `node --version`.
        version: String,
    },
    /// A release archive was installed to satisfy the pin.
    Upgraded {
        /// Version reported by the new binary.
        version: String,
        /// Archive that was installed.
        file_name: String,
    },
    /// No candidate could be installed; the previous runtime is in use.
    Degraded {
        /// Version still installed, if any.
        current: Option<String>,
    },
}

/// Installs and pins the interpreters inside the guest.
pub struct RuntimeEnvironmentManager {
    config: RuntimeConfig,
    guest_root: Utf8PathBuf,
    shell: Arc<dyn GuestShell>,
    downloader: Arc<dyn Downloader>,
}

impl std::fmt::Debug for RuntimeEnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnvironmentManager")
            .field("config", &self.config)
            .field("guest_root", &self.guest_root)
            .finish_non_exhaustive()
    }
}

impl RuntimeEnvironmentManager {
    /// Create a manager for the guest at `guest_root`.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        guest_root: impl Into<Utf8PathBuf>,
        shell: Arc<dyn GuestShell>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            config,
            guest_root: guest_root.into(),
            shell,
            downloader,
        }
    }

    /// Install missing interpreters and pin the Node.js major version.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::ProbeFailed` if the guest shell cannot run, or
    /// `RuntimeError::InstallFailed` once every package-manager attempt has
    /// failed. A failed upgrade is not an error; it yields
    /// [`RuntimeStatus::Degraded`].
    pub async fn ensure_runtime(&self) -> Result<RuntimeStatus> {
        if self.interpreters_present().await? {
            tracing::debug!("interpreters already installed");
        } else {
            self.install_packages().await?;
        }
        self.pin_node().await
    }

    async fn probe(&self, script: &str) -> Result<crate::sandbox::GuestOutput> {
        self.shell.run_guest_script(script).await.map_err(|error| {
            BotboxError::from(RuntimeError::ProbeFailed {
                message: error.to_string(),
            })
        })
    }

    async fn interpreters_present(&self) -> Result<bool> {
        Ok(self.probe(INTERPRETER_PROBE).await?.success())
    }

    async fn install_packages(&self) -> Result<()> {
        let policy = RetryPolicy::new(
            self.config.install_attempts,
            Duration::from_millis(self.config.install_backoff_ms),
        );
        policy
            .run(|attempt| self.install_attempt(attempt))
            .await
            .map_err(|exhausted| {
                RuntimeError::InstallFailed {
                    attempts: exhausted.attempts,
                    message: exhausted.last_error,
                }
                .into()
            })
    }

    async fn install_attempt(&self, attempt: u32) -> std::result::Result<(), String> {
        let index = usize::try_from(attempt).unwrap_or_default();
        if let Some(mirror) = self.config.package_mirrors.iter().cycle().nth(index) {
            tracing::info!(attempt, mirror = %mirror, "installing guest interpreters");
            write_repositories(&self.guest_root, mirror, &self.config.alpine_branch)
                .map_err(|error| error.to_string())?;
        }

        let output = self
            .shell
            .run_guest_script(INSTALL_SCRIPT)
            .await
            .map_err(|error| error.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!("exit {:?}: {}", output.code, output.stderr.trim()))
        }
    }

    async fn installed_node_version(&self) -> Result<Option<String>> {
        let output = self.probe(VERSION_PROBE).await?;
        let version = output.stdout.trim();
        Ok((output.success() && !version.is_empty()).then(|| String::from(version)))
    }

    async fn pin_node(&self) -> Result<RuntimeStatus> {
        let major = self.config.node_major;
        let current = self.installed_node_version().await?;
        if let Some(version) = current
            .as_deref()
            .filter(|version| version.starts_with(&format!("v{major}.")))
        {
            return Ok(RuntimeStatus::Pinned {
                version: String::from(version),
            });
        }

        tracing::info!(current = ?current, major, "upgrading guest Node.js");
        let arch = node_arch(self.config.node_arch.as_deref());
        let candidates = collect_candidates(self.downloader.as_ref(), &self.config, &arch).await;
        for candidate in &candidates {
            match install_candidate(
                &self.guest_root,
                candidate,
                major,
                self.downloader.as_ref(),
                self.shell.as_ref(),
            )
            .await
            {
                Ok(version) => {
                    tracing::info!(channel = %candidate.channel, version = %version, "installed Node.js");
                    return Ok(RuntimeStatus::Upgraded {
                        version,
                        file_name: candidate.file_name.clone(),
                    });
                }
                Err(error) => {
                    tracing::warn!(file = %candidate.file_name, error = %error, "discarding candidate");
                }
            }
        }

        tracing::warn!(
            current = ?current,
            tried = candidates.len(),
            "no Node.js candidate could be installed; keeping current runtime"
        );
        Ok(RuntimeStatus::Degraded { current })
    }
}

fn write_repositories(guest_root: &Utf8Path, mirror: &str, branch: &str) -> std::io::Result<()> {
    let root = Dir::open_ambient_dir(guest_root, ambient_authority())?;
    root.create_dir_all("etc/apk")?;
    let base = mirror.trim_end_matches('/');
    root.write(
        REPOSITORIES_FILE,
        format!("{base}/{branch}/main\n{base}/{branch}/community\n"),
    )
}
