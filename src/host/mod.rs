//! Host collaborators.
//!
//! The supervisor and bridge reach the outside world only through the traits
//! in this module: a tenant registry, a workspace store, an error-log sink
//! and a host-effect sink. The file-backed implementations serve the CLI;
//! embedders supply their own.

mod effects;
mod error_log;
mod registry;
mod workspace;

use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub use effects::{HostEffect, JsonLinesEffectSink};
pub use error_log::JsonlErrorLog;
pub use registry::FileTenantRegistry;
pub use workspace::DirectoryWorkspaceStore;

use crate::error::Result;
use crate::sandbox::{Language, sanitize_alias};

/// A user script registered with the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tenant {
    /// Stable identifier.
    pub id: String,
    /// Script language.
    pub language: Language,
    /// Whether the tenant may run at all.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Whether `serve` starts the tenant automatically.
    #[serde(default = "enabled_by_default")]
    pub auto_start: bool,
    /// Entry script relative to the workspace; `main.<ext>` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

const fn enabled_by_default() -> bool {
    true
}

impl Tenant {
    /// Sanitised alias used for guest paths and the bridge handshake.
    #[must_use]
    pub fn alias(&self) -> String {
        sanitize_alias(&self.id)
    }

    /// Current persisted flags.
    #[must_use]
    pub const fn flags(&self) -> TenantFlags {
        TenantFlags {
            enabled: self.enabled,
            auto_start: self.auto_start,
        }
    }
}

/// Persisted run flags for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantFlags {
    /// See [`Tenant::enabled`].
    pub enabled: bool,
    /// See [`Tenant::auto_start`].
    pub auto_start: bool,
}

impl TenantFlags {
    /// Flags for a tenant that must not run until re-enabled.
    pub const DISABLED: Self = Self {
        enabled: false,
        auto_start: false,
    };
}

/// Host location of a tenant's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Directory bound into the guest.
    pub directory: Utf8PathBuf,
    /// Entry script inside `directory`.
    pub entry: Utf8PathBuf,
}

/// Category of a persisted error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Guest provisioning failed.
    ProvisionFailure,
    /// Interpreter installation failed.
    RuntimeInstallFailure,
    /// The workspace or entry script was missing.
    WorkspaceFailure,
    /// The isolation process could not be started.
    SandboxSpawnFailure,
    /// The tenant process exited abnormally.
    SandboxRuntimeFailure,
}

/// One entry in the error log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Tenant the failure belongs to.
    pub tenant_id: String,
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ErrorRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn now(tenant_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            tenant_id: tenant_id.into(),
            kind,
            message: message.into(),
            timestamp_ms,
        }
    }
}

/// Source of tenant definitions and owner of their persisted flags.
pub trait TenantRegistry: Send + Sync {
    /// Look up one tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    fn tenant(&self, id: &str) -> Result<Option<Tenant>>;

    /// All known tenants.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    fn tenants(&self) -> Result<Vec<Tenant>>;

    /// Persist new flags for `id`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::UnknownTenant` for an unknown id, or an I/O
    /// error if the registry cannot be written.
    fn set_flags(&self, id: &str, flags: TenantFlags) -> Result<()>;
}

/// Resolves where a tenant's script lives on the host.
pub trait WorkspaceStore: Send + Sync {
    /// Workspace directory and entry script for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::WorkspaceMissing` if either does not exist.
    fn workspace(&self, tenant: &Tenant) -> Result<Workspace>;
}

/// Destination for persisted failure records.
pub trait ErrorLogSink: Send + Sync {
    /// Append `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn record(&self, record: &ErrorRecord) -> Result<()>;
}

/// Host actions requested by tenant scripts over the bridge.
pub trait HostEffectSink: Send + Sync {
    /// Show a short message.
    fn toast(&self, alias: &str, message: &str);
    /// Vibrate for `duration_ms`.
    fn vibrate(&self, alias: &str, duration_ms: u64);
    /// Post a notification.
    fn notification(&self, alias: &str, title: &str, body: &str);
    /// Send `message` to `room`.
    fn reply(&self, alias: &str, room: &str, message: &str);
}
