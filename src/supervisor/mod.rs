//! Tenant lifecycle supervision.
//!
//! [`WorkerSupervisor`] decides when a tenant's sandbox starts and stops. It
//! serialises operations per tenant, caps how many tenants run at once,
//! prepares the guest before the first start, and records failures with the
//! host so a broken tenant is not restarted blindly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::bridge::BridgeServer;
use crate::config::SupervisorConfig;
use crate::environment::EnvironmentGate;
use crate::error::{BotboxError, Result, SupervisorError};
use crate::host::{
    ErrorKind, ErrorLogSink, ErrorRecord, Tenant, TenantFlags, TenantRegistry, WorkspaceStore,
};
use crate::sandbox::{ExitInfo, OutputCallbacks, SandboxExecutor, SandboxRequest, sanitize_alias};

/// Result of [`WorkerSupervisor::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was started.
    Started,
    /// A process was already live.
    AlreadyRunning,
    /// The tenant is disabled; nothing was started.
    Disabled,
}

/// How [`WorkerSupervisor::stop`] treats the persisted flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop now; the next `ensure_all_enabled` restarts the tenant.
    Pause,
    /// Stop and clear `enabled` and `auto_start`.
    Disable,
}

/// Per-tenant result of [`WorkerSupervisor::ensure_all_enabled`].
#[derive(Debug)]
pub struct TenantStart {
    /// Tenant identifier.
    pub tenant_id: String,
    /// What happened.
    pub outcome: Result<StartOutcome>,
}

/// Host collaborators the supervisor reads and writes tenant state through.
#[derive(Clone)]
pub struct HostCollaborators {
    /// Tenant definitions and flags.
    pub tenants: Arc<dyn TenantRegistry>,
    /// Workspace resolution.
    pub workspaces: Arc<dyn WorkspaceStore>,
    /// Failure records.
    pub errors: Arc<dyn ErrorLogSink>,
}

impl std::fmt::Debug for HostCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCollaborators").finish_non_exhaustive()
    }
}

type TenantLock = Arc<tokio::sync::Mutex<()>>;

/// Starts, stops and watches tenant processes.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    executor: Arc<SandboxExecutor>,
    environment: Arc<dyn EnvironmentGate>,
    host: HostCollaborators,
    bridge: Option<Arc<BridgeServer>>,
    tenant_locks: Mutex<HashMap<String, TenantLock>>,
    admission: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        executor: Arc<SandboxExecutor>,
        environment: Arc<dyn EnvironmentGate>,
        host: HostCollaborators,
    ) -> Self {
        Self {
            config,
            executor,
            environment,
            host,
            bridge: None,
            tenant_locks: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Disconnect tenants from `bridge` when they stop.
    #[must_use]
    pub fn with_bridge(mut self, bridge: Arc<BridgeServer>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// The sandbox executor.
    #[must_use]
    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    fn tenant_lock(&self, tenant_id: &str) -> TenantLock {
        let mut locks = self.tenant_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(String::from(tenant_id)).or_default())
    }

    fn lookup(&self, tenant_id: &str) -> Result<Tenant> {
        self.host
            .tenants
            .tenant(tenant_id)?
            .ok_or_else(|| {
                SupervisorError::UnknownTenant {
                    tenant_id: String::from(tenant_id),
                }
                .into()
            })
    }

    /// Start `tenant_id` unless it is disabled or already running.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::UnknownTenant` for an unknown id,
    /// `SupervisorError::CapacityExhausted` when the cap is reached, and any
    /// preparation or spawn failure. Preparation and spawn failures are also
    /// recorded with the host and disable the tenant.
    pub async fn ensure_running(&self, tenant_id: &str) -> Result<StartOutcome> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let tenant = self.lookup(tenant_id)?;
        if !tenant.enabled {
            tracing::debug!(tenant = %tenant_id, "tenant disabled; not starting");
            return Ok(StartOutcome::Disabled);
        }
        let alias = tenant.alias();
        if self.executor.is_running(&alias) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        match self.start(&tenant, &alias).await {
            Ok(outcome) => Ok(outcome),
            Err(error @ BotboxError::Supervisor(SupervisorError::CapacityExhausted { .. })) => {
                tracing::warn!(tenant = %tenant_id, error = %error, "tenant start refused");
                Err(error)
            }
            Err(error) => {
                self.record_start_failure(&tenant, &error);
                Err(error)
            }
        }
    }

    async fn start(&self, tenant: &Tenant, alias: &str) -> Result<StartOutcome> {
        self.environment.ensure_ready().await?;
        let workspace = self.host.workspaces.workspace(tenant)?;
        let request = SandboxRequest::new(alias, tenant.language, workspace.directory, workspace.entry)?;

        let running = {
            let _admission = self.admission.lock().await;
            let running_count = self.executor.running_count();
            if running_count >= self.config.max_tenants {
                return Err(SupervisorError::CapacityExhausted {
                    tenant_id: tenant.id.clone(),
                    limit: self.config.max_tenants,
                }
                .into());
            }
            self.executor
                .start(&request, OutputCallbacks::logging(alias))
                .await?
        };

        let errors = Arc::clone(&self.host.errors);
        let tenant_id = tenant.id.clone();
        tokio::spawn(async move {
            let exit = running.wait().await;
            if exit.stopped || exit.success() {
                return;
            }
            let record = ErrorRecord::now(
                &tenant_id,
                ErrorKind::SandboxRuntimeFailure,
                format!("exited with code {:?}, signal {:?}", exit.code, exit.signal),
            );
            tracing::warn!(tenant = %tenant_id, message = %record.message, "tenant exited abnormally");
            if let Err(error) = errors.record(&record) {
                tracing::warn!(tenant = %tenant_id, error = %error, "failed to record tenant failure");
            }
        });

        tracing::info!(tenant = %tenant.id, alias = %alias, "tenant started");
        Ok(StartOutcome::Started)
    }

    fn record_start_failure(&self, tenant: &Tenant, error: &BotboxError) {
        let kind = match error {
            BotboxError::Provision(_) => ErrorKind::ProvisionFailure,
            BotboxError::Runtime(_) => ErrorKind::RuntimeInstallFailure,
            BotboxError::Supervisor(SupervisorError::WorkspaceMissing { .. }) => {
                ErrorKind::WorkspaceFailure
            }
            _ => ErrorKind::SandboxSpawnFailure,
        };
        tracing::error!(tenant = %tenant.id, error = %error, ?kind, "tenant failed to start");

        let record = ErrorRecord::now(&tenant.id, kind, error.to_string());
        if let Err(record_error) = self.host.errors.record(&record) {
            tracing::warn!(tenant = %tenant.id, error = %record_error, "failed to record start failure");
        }
        if let Err(flag_error) = self.host.tenants.set_flags(&tenant.id, TenantFlags::DISABLED) {
            tracing::warn!(tenant = %tenant.id, error = %flag_error, "failed to disable tenant");
        }
    }

    /// Stop `tenant_id`. Termination, the guest sweep and the bridge
    /// disconnect run even when the tenant cannot be looked up.
    ///
    /// # Errors
    ///
    /// With [`StopMode::Disable`], returns the lookup or flag-persistence
    /// failure after the process has been stopped.
    pub async fn stop(&self, tenant_id: &str, mode: StopMode) -> Result<Option<ExitInfo>> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let lookup = self.lookup(tenant_id);
        let alias = lookup
            .as_ref()
            .map_or_else(|_| sanitize_alias(tenant_id), Tenant::alias);

        let exit = self.executor.stop(&alias).await;
        if let Some(bridge) = &self.bridge {
            bridge.disconnect(&alias);
        }
        tracing::info!(tenant = %tenant_id, ?mode, ?exit, "tenant stopped");

        if mode == StopMode::Disable {
            lookup?;
            self.host.tenants.set_flags(tenant_id, TenantFlags::DISABLED)?;
        }
        Ok(exit)
    }

    /// Pause every running tenant. Returns the aliases that were stopped.
    pub async fn stop_all(&self) -> Vec<String> {
        let running = self.executor.running_aliases();
        let known = self.host.tenants.tenants().unwrap_or_else(|error| {
            tracing::warn!(error = %error, "tenant lookup failed; stopping by alias");
            Vec::new()
        });

        for alias in &running {
            let tenant_id = known
                .iter()
                .find(|tenant| &tenant.alias() == alias)
                .map_or_else(|| alias.clone(), |tenant| tenant.id.clone());
            if let Err(error) = self.stop(&tenant_id, StopMode::Pause).await {
                tracing::warn!(tenant = %tenant_id, error = %error, "failed to stop tenant");
            }
        }
        running
    }

    /// Start every enabled auto-start tenant, collecting per-tenant results.
    ///
    /// # Errors
    ///
    /// Returns an error only if the tenant list cannot be read.
    pub async fn ensure_all_enabled(&self) -> Result<Vec<TenantStart>> {
        self.ensure_matching(|tenant| tenant.enabled && tenant.auto_start).await
    }

    /// Restart every enabled tenant whose process is no longer live.
    ///
    /// Called before each inbound event is delivered so that a tenant which
    /// exited since the last event receives it. Tenants that are still
    /// running report [`StartOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the tenant list cannot be read.
    pub async fn revive_enabled(&self) -> Result<Vec<TenantStart>> {
        self.ensure_matching(|tenant| tenant.enabled).await
    }

    async fn ensure_matching(&self, wanted: impl Fn(&Tenant) -> bool) -> Result<Vec<TenantStart>> {
        let tenants = self.host.tenants.tenants()?;
        let mut results = Vec::new();
        for tenant in tenants.iter().filter(|tenant| wanted(tenant)) {
            let outcome = self.ensure_running(&tenant.id).await;
            if let Err(error) = &outcome {
                tracing::warn!(tenant = %tenant.id, error = %error, "tenant did not start");
            }
            results.push(TenantStart {
                tenant_id: tenant.id.clone(),
                outcome,
            });
        }
        Ok(results)
    }
}
