//! Semantic error types for the botbox supervisor.
//!
//! Each concern owns a `thiserror` enum describing conditions a caller might
//! inspect or report: configuration, guest filesystem provisioning, runtime
//! installation, sandbox processes, the bridge protocol and tenant
//! supervision. They are aggregated into [`BotboxError`]. Opaque reporting via
//! `eyre::Report` is reserved for the binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be parsed.
    #[error("failed to parse configuration file: {message}")]
    ParseError {
        /// A description of the parse error.
        message: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// The `OrthoConfig` library returned an error during configuration loading.
    #[error("configuration loading failed: {0}")]
    OrthoConfig(Arc<ortho_config::OrthoError>),
}

/// Errors raised while materialising the guest filesystem.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No local image exists and every mirror failed.
    #[error("no usable guest image after trying {attempts} source(s)")]
    NoImageAvailable {
        /// Number of local candidates and mirrors that were tried.
        attempts: usize,
    },

    /// A single mirror download failed.
    #[error("download from '{url}' failed: {message}")]
    DownloadFailed {
        /// The URL that was requested.
        url: String,
        /// A description of the transport or status failure.
        message: String,
    },

    /// The archive could not be unpacked into the guest root.
    #[error("failed to extract '{archive}': {message}")]
    ExtractFailed {
        /// The archive that was being extracted.
        archive: PathBuf,
        /// A description of the extraction failure.
        message: String,
    },
}

/// Errors raised while installing or pinning guest runtimes.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The package manager failed on every attempt.
    #[error("runtime package install failed after {attempts} attempt(s): {message}")]
    InstallFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Output of the last failed attempt.
        message: String,
    },

    /// A downloaded runtime archive does not match its published digest.
    #[error("checksum mismatch for '{file_name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The archive file name from the manifest.
        file_name: String,
        /// Digest published in the manifest.
        expected: String,
        /// Digest of the downloaded bytes.
        actual: String,
    },

    /// A staged runtime failed its post-install check.
    #[error("candidate '{file_name}' failed verification: {message}")]
    VerificationFailed {
        /// The archive file name from the manifest.
        file_name: String,
        /// A description of the verification failure.
        message: String,
    },

    /// A guest probe command could not be executed.
    #[error("guest probe failed: {message}")]
    ProbeFailed {
        /// A description of the probe failure.
        message: String,
    },
}

/// Errors raised by sandbox process management.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolation process could not be started.
    #[error("failed to start sandbox for '{alias}': {message}")]
    SpawnFailed {
        /// Alias of the tenant being started.
        alias: String,
        /// A description of the spawn failure.
        message: String,
    },

    /// The entry script does not live inside the tenant workspace.
    #[error("entry '{entry}' is outside workspace '{workspace}'")]
    EntryOutsideWorkspace {
        /// Host path of the entry script.
        entry: PathBuf,
        /// Host path of the workspace directory.
        workspace: PathBuf,
    },

    /// Waiting on a sandbox process failed.
    #[error("failed waiting for sandbox '{alias}': {message}")]
    WaitFailed {
        /// Alias of the tenant being awaited.
        alias: String,
        /// A description of the wait failure.
        message: String,
    },
}

/// Errors raised by the bridge server.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The listener could not be bound.
    #[error("failed to bind bridge on {address}: {message}")]
    BindFailed {
        /// The address the bridge tried to bind.
        address: String,
        /// A description of the bind failure.
        message: String,
    },

    /// An inbound line was not a valid bridge message.
    #[error("malformed bridge message: {message}")]
    Protocol {
        /// A description of the parse failure.
        message: String,
    },

    /// An outbound payload could not be serialised.
    #[error("failed to encode outbound event '{event_type}': {message}")]
    Encode {
        /// The outbound event type.
        event_type: String,
        /// A description of the encoding failure.
        message: String,
    },
}

/// Errors raised while supervising tenants.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The tenant registry does not know the requested tenant.
    #[error("unknown tenant '{tenant_id}'")]
    UnknownTenant {
        /// The requested tenant identifier.
        tenant_id: String,
    },

    /// Starting another tenant would exceed the configured cap.
    #[error("cannot start '{tenant_id}': {limit} tenant(s) already running")]
    CapacityExhausted {
        /// The tenant that was refused.
        tenant_id: String,
        /// The configured maximum.
        limit: usize,
    },

    /// Two tenant ids sanitise to the same alias.
    #[error("tenants '{first}' and '{second}' share the alias '{alias}'")]
    AliasCollision {
        /// The shared alias.
        alias: String,
        /// The tenant listed first.
        first: String,
        /// The tenant listed second.
        second: String,
    },

    /// The tenant workspace or its entry script does not exist.
    #[error("workspace for '{tenant_id}' is missing: {path}")]
    WorkspaceMissing {
        /// The affected tenant identifier.
        tenant_id: String,
        /// The missing workspace path.
        path: PathBuf,
    },
}

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FilesystemError {
    /// An I/O error occurred.
    #[error("I/O error at '{path}': {message}")]
    IoError {
        /// The path where the error occurred.
        path: PathBuf,
        /// A description of the I/O error.
        message: String,
    },
}

/// Top-level error type for the botbox library.
///
/// Aggregates every domain error so that library functions share one
/// `Result` alias. The binary converts it to `eyre::Report` for display.
#[derive(Debug, Error)]
pub enum BotboxError {
    /// An error occurred during configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error occurred while provisioning the guest filesystem.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// An error occurred while installing guest runtimes.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// An error occurred while managing sandbox processes.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// An error occurred in the bridge server.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// An error occurred while supervising tenants.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// An error occurred during filesystem operations.
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

/// A specialised `Result` type for botbox operations.
pub type Result<T> = std::result::Result<T, BotboxError>;

/// Build a [`FilesystemError::IoError`] for `path`.
pub(crate) fn io_failure(path: impl Into<PathBuf>, error: &std::io::Error) -> BotboxError {
    BotboxError::from(FilesystemError::IoError {
        path: path.into(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Report;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config_path() -> PathBuf {
        PathBuf::from("/etc/botbox/config.toml")
    }

    #[rstest]
    fn sandbox_wait_failure_names_alias() {
        let error = SandboxError::WaitFailed {
            alias: String::from("echo_bot"),
            message: String::from("no child processes"),
        };
        assert_eq!(
            error.to_string(),
            "failed waiting for sandbox 'echo_bot': no child processes"
        );
    }

    #[rstest]
    #[case(
        "bridge.port",
        "must be a valid TCP port",
        "invalid configuration value for 'bridge.port': must be a valid TCP port"
    )]
    #[case(
        "guest.root_dir",
        "cannot be empty",
        "invalid configuration value for 'guest.root_dir': cannot be empty"
    )]
    fn config_error_invalid_value_displays_correctly(
        #[case] field: &str,
        #[case] reason: &str,
        #[case] expected: &str,
    ) {
        let error = ConfigError::InvalidValue {
            field: String::from(field),
            reason: String::from(reason),
        };
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    fn provision_error_reports_attempt_count() {
        let error = ProvisionError::NoImageAvailable { attempts: 4 };
        assert_eq!(
            error.to_string(),
            "no usable guest image after trying 4 source(s)"
        );
    }

    #[rstest]
    fn runtime_checksum_mismatch_names_both_digests() {
        let error = RuntimeError::ChecksumMismatch {
            file_name: String::from("node-v22.1.0-linux-arm64.tar.gz"),
            expected: String::from("aa"),
            actual: String::from("bb"),
        };
        assert_eq!(
            error.to_string(),
            "checksum mismatch for 'node-v22.1.0-linux-arm64.tar.gz': expected aa, got bb"
        );
    }

    #[rstest]
    fn sandbox_spawn_failure_includes_alias() {
        let error = SandboxError::SpawnFailed {
            alias: String::from("echo_bot"),
            message: String::from("proot not found"),
        };
        assert_eq!(
            error.to_string(),
            "failed to start sandbox for 'echo_bot': proot not found"
        );
    }

    #[rstest]
    fn supervisor_capacity_error_displays_limit() {
        let error = SupervisorError::CapacityExhausted {
            tenant_id: String::from("bot-9"),
            limit: 8,
        };
        assert_eq!(
            error.to_string(),
            "cannot start 'bot-9': 8 tenant(s) already running"
        );
    }

    #[rstest]
    #[case(
        BotboxError::from(ConfigError::ParseError {
            message: String::from("expected `]`"),
        }),
        "failed to parse configuration file: expected `]`"
    )]
    #[case(
        BotboxError::from(RuntimeError::InstallFailed {
            attempts: 3,
            message: String::from("network unreachable"),
        }),
        "runtime package install failed after 3 attempt(s): network unreachable"
    )]
    #[case(
        BotboxError::from(BridgeError::Protocol {
            message: String::from("unknown variant `ping`"),
        }),
        "malformed bridge message: unknown variant `ping`"
    )]
    fn eyre_report_preserves_error_messages(#[case] error: BotboxError, #[case] expected: &str) {
        let report = Report::from(error);
        assert_eq!(report.to_string(), expected);
    }

    #[rstest]
    fn io_failure_wraps_path_and_message(config_path: PathBuf) {
        let error = io_failure(config_path, &std::io::Error::other("disk full"));
        assert_eq!(
            error.to_string(),
            "I/O error at '/etc/botbox/config.toml': disk full"
        );
    }
}
