//! Orchestration API for botbox commands.
//!
//! This module wires the provisioner, runtime manager, sandbox executor,
//! bridge and supervisor together from an [`AppConfig`] and exposes one
//! function per command: [`provision`], [`reset`], [`status`], [`run_bot`],
//! [`serve`] and [`stop`].
//!
//! All functions accept library-owned types (not clap types) and return
//! [`crate::error::Result`]. Apart from host effects, which the CLI sink
//! writes to stdout as JSON lines, they do not print or call
//! `std::process::exit`.

use std::future::Future;
use std::sync::Arc;

use camino::Utf8PathBuf;
use mockable::DefaultEnv;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::bridge::{BridgeServer, Delivery, HelloTokens};
use crate::config::AppConfig;
use crate::environment::{EnvironmentGate, GuestEnvironment, Readiness};
use crate::error::{Result, SupervisorError};
use crate::host::{
    DirectoryWorkspaceStore, FileTenantRegistry, HostEffectSink, JsonLinesEffectSink,
    JsonlErrorLog, Tenant, TenantRegistry,
};
use crate::rootfs::{Downloader, HttpDownloader, RootfsProvisioner, guest_is_provisioned};
use crate::runtime::RuntimeEnvironmentManager;
use crate::sandbox::{
    ExitInfo, GuestShell, IsolationEnvResolver, OutputCallbacks, SandboxExecutor, SandboxRequest,
};
use crate::supervisor::{HostCollaborators, StartOutcome, StopMode, WorkerSupervisor};

/// Outcome of a botbox command.
///
/// Commands return either outright success or a command-specific exit code
/// that the CLI adapter maps to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command completed successfully (exit code 0).
    Success,
    /// The command completed but the tenant process exited abnormally.
    CommandExit {
        /// Exit code to report; `128 + signal` for signalled processes.
        code: i32,
    },
}

impl CommandOutcome {
    /// Map a tenant exit to a command outcome.
    #[must_use]
    pub fn from_exit(exit: ExitInfo) -> Self {
        if exit.success() {
            return Self::Success;
        }
        let code = exit
            .code
            .or_else(|| exit.signal.map(|signal| signal.saturating_add(128)))
            .unwrap_or(1);
        Self::CommandExit { code }
    }
}

/// One inbound chat event read by [`serve`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Chat room the message arrived in.
    pub room: String,
    /// Display name of the sender.
    pub sender: String,
    /// Message text.
    pub message: String,
    /// Whether the room is a group chat.
    #[serde(default)]
    pub is_group: bool,
}

/// Status of one configured bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotStatus {
    /// The tenant definition.
    pub tenant: Tenant,
    /// Host workspace directory, when it exists.
    pub workspace: Option<Utf8PathBuf>,
}

/// Report returned by [`status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Host path of the guest root.
    pub guest_root: Utf8PathBuf,
    /// Whether the readiness marker records the configured setup version.
    pub provisioned: bool,
    /// Configured bots in file order.
    pub bots: Vec<BotStatus>,
}

/// Summary returned by [`serve`] once it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// Tenants started or already running at startup.
    pub started: Vec<String>,
    /// Tenants whose startup failed.
    pub failed: Vec<String>,
    /// Inbound events forwarded to at least one connection.
    pub forwarded: usize,
    /// Inbound events queued for the first connection.
    pub queued: usize,
    /// Tenants restarted because they were not live when an event arrived.
    pub revived: usize,
    /// Aliases stopped on shutdown.
    pub stopped: Vec<String>,
}

/// Components assembled from configuration.
pub struct Services {
    config: AppConfig,
    environment: Arc<GuestEnvironment>,
    executor: Arc<SandboxExecutor>,
    host: HostCollaborators,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("environment", &self.environment)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Assemble the file-backed host collaborators and an HTTP downloader.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::DownloadFailed` if the HTTP client cannot be
    /// built.
    pub fn new(config: &AppConfig, bridge_port: u16) -> Result<Self> {
        let downloader = Arc::new(HttpDownloader::new()?);
        Ok(Self::assemble(
            config,
            bridge_port,
            downloader,
            file_registry(config),
            Arc::new(HelloTokens::default()),
        ))
    }

    /// Assemble from explicit collaborators. Tenants started through these
    /// services receive handshake tokens from `tokens`.
    #[must_use]
    pub fn assemble(
        config: &AppConfig,
        bridge_port: u16,
        downloader: Arc<dyn Downloader>,
        tenants: Arc<dyn TenantRegistry>,
        tokens: Arc<HelloTokens>,
    ) -> Self {
        let guest_root = config.guest.root_dir.clone();
        let isolation = IsolationEnvResolver::new(&DefaultEnv::new()).resolve(&config.sandbox);
        let executor = Arc::new(
            SandboxExecutor::new(
                config.sandbox.clone(),
                isolation,
                guest_root.clone(),
                bridge_port,
            )
            .with_hello_tokens(tokens),
        );

        let runtime = RuntimeEnvironmentManager::new(
            config.runtime.clone(),
            guest_root,
            Arc::clone(&executor) as Arc<dyn GuestShell>,
            Arc::clone(&downloader),
        );
        let provisioner = RootfsProvisioner::new(config.guest.clone(), downloader);
        let environment = Arc::new(GuestEnvironment::new(
            provisioner,
            runtime,
            GuestEnvironment::new_init_lock(),
        ));

        let host = HostCollaborators {
            tenants,
            workspaces: Arc::new(DirectoryWorkspaceStore::new(
                config.supervisor.workspaces_dir.clone(),
            )),
            errors: Arc::new(JsonlErrorLog::new(config.supervisor.error_log.clone())),
        };

        Self {
            config: config.clone(),
            environment,
            executor,
            host,
        }
    }

    /// The shared guest environment.
    #[must_use]
    pub fn environment(&self) -> &GuestEnvironment {
        &self.environment
    }

    /// A supervisor over these components.
    #[must_use]
    pub fn supervisor(&self) -> WorkerSupervisor {
        WorkerSupervisor::new(
            self.config.supervisor.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.environment) as Arc<dyn EnvironmentGate>,
            self.host.clone(),
        )
    }

    fn tenant(&self, bot_id: &str) -> Result<Tenant> {
        self.host.tenants.tenant(bot_id)?.ok_or_else(|| {
            SupervisorError::UnknownTenant {
                tenant_id: String::from(bot_id),
            }
            .into()
        })
    }

    /// Run `bot_id` in the foreground until it exits, regardless of its
    /// persisted flags.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::UnknownTenant`, preparation failures,
    /// `SupervisorError::WorkspaceMissing` or spawn failures.
    pub async fn run_tenant(&self, bot_id: &str) -> Result<ExitInfo> {
        let tenant = self.tenant(bot_id)?;
        let alias = tenant.alias();
        self.environment.ensure_ready().await?;
        let workspace = self.host.workspaces.workspace(&tenant)?;
        let request =
            SandboxRequest::new(&alias, tenant.language, workspace.directory, workspace.entry)?;

        tracing::info!(tenant = %tenant.id, alias = %alias, "running tenant in foreground");
        self.executor
            .run(&request, OutputCallbacks::logging(&alias))
            .await
    }
}

fn file_registry(config: &AppConfig) -> Arc<dyn TenantRegistry> {
    Arc::new(FileTenantRegistry::new(config.supervisor.bots_file.clone()))
}

fn stdout_effects() -> Arc<dyn HostEffectSink> {
    Arc::new(JsonLinesEffectSink::new(std::io::stdout()))
}

/// Provision the guest filesystem and pin runtimes.
///
/// # Errors
///
/// Returns provisioning or runtime installation failures.
pub async fn provision(config: &AppConfig) -> Result<Readiness> {
    let services = Services::new(config, config.bridge.port)?;
    services.environment().prepare().await
}

/// Delete the guest filesystem so the next start re-provisions it.
///
/// # Errors
///
/// Returns `FilesystemError::IoError` if the guest root cannot be removed.
pub async fn reset(config: &AppConfig) -> Result<CommandOutcome> {
    let services = Services::new(config, config.bridge.port)?;
    services.environment().reset().await?;
    Ok(CommandOutcome::Success)
}

/// Report guest readiness and the configured bots. Only local state is
/// read; no network client is built.
///
/// # Errors
///
/// Returns an error if the bots file cannot be read.
pub fn status(config: &AppConfig) -> Result<StatusReport> {
    let tenants = FileTenantRegistry::new(config.supervisor.bots_file.clone()).tenants()?;
    let bots = tenants
        .into_iter()
        .map(|tenant| {
            let directory = config.supervisor.workspaces_dir.join(tenant.alias());
            BotStatus {
                workspace: directory.is_dir().then_some(directory),
                tenant,
            }
        })
        .collect();

    Ok(StatusReport {
        guest_root: config.guest.root_dir.clone(),
        provisioned: guest_is_provisioned(&config.guest),
        bots,
    })
}

async fn bind_bridge(
    config: &AppConfig,
    tenants: Arc<dyn TenantRegistry>,
    effects: Arc<dyn HostEffectSink>,
) -> Result<(Arc<BridgeServer>, tokio::task::JoinHandle<()>)> {
    let bridge = BridgeServer::bind(&config.bridge, tenants, effects).await?;
    let accept = bridge.serve();
    Ok((bridge, accept))
}

async fn close_bridge(bridge: &BridgeServer, accept: tokio::task::JoinHandle<()>) {
    bridge.shutdown();
    if let Err(error) = accept.await {
        tracing::debug!(error = %error, "bridge accept task failed");
    }
}

/// Run one bot in the foreground with the bridge listening, until it exits.
///
/// # Errors
///
/// Returns bridge bind failures and the errors of [`Services::run_tenant`].
pub async fn run_bot(config: &AppConfig, bot_id: &str) -> Result<CommandOutcome> {
    let tenants = file_registry(config);
    let (bridge, accept) = bind_bridge(config, Arc::clone(&tenants), stdout_effects()).await?;
    let downloader = Arc::new(HttpDownloader::new()?);
    let services = Services::assemble(
        config,
        bridge.local_addr().port(),
        downloader,
        tenants,
        bridge.hello_tokens(),
    );

    let outcome = services.run_tenant(bot_id).await;
    close_bridge(&bridge, accept).await;

    let exit = outcome?;
    tracing::info!(tenant = %bot_id, ?exit, "tenant exited");
    Ok(CommandOutcome::from_exit(exit))
}

/// Start the bridge and every enabled bot, then forward inbound events read
/// as JSON lines from `input` until it ends or `shutdown` resolves. Before
/// each event is delivered, enabled bots that are no longer live are
/// restarted. Every running bot is paused before returning.
///
/// # Errors
///
/// Returns bridge bind failures or a failure to read the bots file.
pub async fn serve<R, F>(config: &AppConfig, input: R, shutdown: F) -> Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    serve_with(config, stdout_effects(), input, shutdown).await
}

/// [`serve`] with an explicit host-effect sink.
///
/// # Errors
///
/// Returns bridge bind failures or a failure to read the bots file.
pub async fn serve_with<R, F>(
    config: &AppConfig,
    effects: Arc<dyn HostEffectSink>,
    input: R,
    shutdown: F,
) -> Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let tenants = file_registry(config);
    let (bridge, accept) = bind_bridge(config, Arc::clone(&tenants), effects).await?;
    let downloader = Arc::new(HttpDownloader::new()?);
    let services = Services::assemble(
        config,
        bridge.local_addr().port(),
        downloader,
        tenants,
        bridge.hello_tokens(),
    );
    let supervisor = services.supervisor().with_bridge(Arc::clone(&bridge));

    let mut summary = ServeSummary::default();
    let starts = match supervisor.ensure_all_enabled().await {
        Ok(starts) => starts,
        Err(error) => {
            close_bridge(&bridge, accept).await;
            return Err(error);
        }
    };
    for start in starts {
        if start.outcome.is_ok() {
            summary.started.push(start.tenant_id);
        } else {
            summary.failed.push(start.tenant_id);
        }
    }
    tracing::info!(started = summary.started.len(), failed = summary.failed.len(), "serving");

    let mut lines = input.lines();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(text)) => forward_line(&bridge, &supervisor, &text, &mut summary).await,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(error = %error, "inbound event stream failed");
                    break;
                }
            },
            () = &mut shutdown => break,
        }
    }

    summary.stopped = supervisor.stop_all().await;
    close_bridge(&bridge, accept).await;
    tracing::info!(forwarded = summary.forwarded, queued = summary.queued, "serve stopped");
    Ok(summary)
}

async fn forward_line(
    bridge: &BridgeServer,
    supervisor: &WorkerSupervisor,
    line: &str,
    summary: &mut ServeSummary,
) {
    if line.trim().is_empty() {
        return;
    }
    let event: InboundEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(error = %error, "dropping malformed inbound event");
            return;
        }
    };
    match supervisor.revive_enabled().await {
        Ok(starts) => {
            let revived = starts
                .iter()
                .filter(|start| matches!(start.outcome, Ok(StartOutcome::Started)))
                .count();
            summary.revived = summary.revived.saturating_add(revived);
        }
        Err(error) => tracing::warn!(error = %error, "failed to read tenants before delivery"),
    }
    match bridge.forward_inbound_event(&event.room, &event.sender, &event.message, event.is_group) {
        Ok(Delivery::Sent(_)) => summary.forwarded = summary.forwarded.saturating_add(1),
        Ok(Delivery::Queued) => summary.queued = summary.queued.saturating_add(1),
        Err(error) => tracing::warn!(error = %error, "failed to forward inbound event"),
    }
}

/// Stop a bot. With `pause` its flags stay untouched; otherwise it is
/// disabled. The guest is swept for the bot's processes either way, so this
/// also reaches bots started by another botbox process.
///
/// # Errors
///
/// Without `pause`, returns `SupervisorError::UnknownTenant` or a failure to
/// persist the flags.
pub async fn stop(config: &AppConfig, bot_id: &str, pause: bool) -> Result<CommandOutcome> {
    let services = Services::new(config, config.bridge.port)?;
    let mode = if pause { StopMode::Pause } else { StopMode::Disable };
    services.supervisor().stop(bot_id, mode).await?;
    Ok(CommandOutcome::Success)
}
