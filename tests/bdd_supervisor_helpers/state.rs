//! Scenario state for supervision behavioural tests.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use botbox::config::{SandboxConfig, SupervisorConfig};
use botbox::environment::{EnsureReadyFuture, EnvironmentGate};
use botbox::error::{BotboxError, SupervisorError};
use botbox::host::{
    DirectoryWorkspaceStore, FileTenantRegistry, JsonlErrorLog, TenantFlags, TenantRegistry,
};
use botbox::sandbox::{IsolationEnv, SandboxExecutor};
use botbox::supervisor::{HostCollaborators, StartOutcome, WorkerSupervisor};
use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;
use tempfile::TempDir;

const FAKE_PROOT: &str =
    "#!/bin/sh\ncase \"$*\" in *pkill*) exit 0;; *crashy*) exit 3;; esac\nexec sleep 30\n";

const BOTS: &str = r#"
[[bots]]
id = "echo"
language = "js"

[[bots]]
id = "second"
language = "js"

[[bots]]
id = "weather"
language = "py"

[[bots]]
id = "sleepy"
language = "js"
enabled = false

[[bots]]
id = "crashy"
language = "js"
"#;

/// Start result reduced to what the scenarios compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartResult {
    /// The supervisor returned an outcome.
    Outcome(StartOutcome),
    /// The supervisor refused or failed; holds a short category.
    Failed(String),
}

impl From<botbox::error::Result<StartOutcome>> for StartResult {
    fn from(result: botbox::error::Result<StartOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::Outcome(outcome),
            Err(BotboxError::Supervisor(SupervisorError::WorkspaceMissing { .. })) => {
                Self::Failed(String::from("workspace"))
            }
            Err(BotboxError::Supervisor(SupervisorError::CapacityExhausted { .. })) => {
                Self::Failed(String::from("capacity"))
            }
            Err(BotboxError::Supervisor(SupervisorError::UnknownTenant { .. })) => {
                Self::Failed(String::from("unknown"))
            }
            Err(other) => Self::Failed(other.to_string()),
        }
    }
}

/// Environment gate that only counts how often it was asked.
#[derive(Debug, Default)]
pub(crate) struct CountingGate {
    calls: AtomicU32,
}

impl CountingGate {
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EnvironmentGate for CountingGate {
    fn ensure_ready(&self) -> EnsureReadyFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// A supervisor over file-backed host state in a temporary directory.
pub(crate) struct SupervisorWorld {
    pub(crate) runtime: tokio::runtime::Runtime,
    pub(crate) supervisor: WorkerSupervisor,
    pub(crate) gate: Arc<CountingGate>,
    registry: Arc<FileTenantRegistry>,
    error_log: Utf8PathBuf,
    _dir: TempDir,
}

impl SupervisorWorld {
    pub(crate) fn new(max_tenants: usize) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|_| std::io::Error::other("tempdir path should be UTF-8"))?;

        let proot = base.join("proot");
        std::fs::write(&proot, FAKE_PROOT)?;
        std::fs::set_permissions(&proot, std::fs::Permissions::from_mode(0o755))?;
        std::fs::create_dir_all(base.join("rootfs"))?;
        std::fs::write(base.join("bots.toml"), BOTS)?;
        for alias in ["echo", "second", "sleepy", "crashy"] {
            let workspace = base.join("workspaces").join(alias);
            std::fs::create_dir_all(&workspace)?;
            std::fs::write(workspace.join("main.js"), "")?;
        }

        let executor = Arc::new(SandboxExecutor::new(
            SandboxConfig {
                proot_binary: proot,
                stop_grace_ms: 100,
                ..SandboxConfig::default()
            },
            IsolationEnv {
                library_dir: base.join("lib"),
                tmp_dir: base.join("tmp"),
                loader: None,
                no_seccomp: false,
            },
            base.join("rootfs"),
            0,
        ));
        let gate = Arc::new(CountingGate::default());
        let registry = Arc::new(FileTenantRegistry::new(base.join("bots.toml")));
        let error_log = base.join("errors.jsonl");

        let supervisor = WorkerSupervisor::new(
            SupervisorConfig {
                max_tenants,
                bots_file: base.join("bots.toml"),
                workspaces_dir: base.join("workspaces"),
                error_log: error_log.clone(),
            },
            executor,
            Arc::clone(&gate) as Arc<dyn EnvironmentGate>,
            HostCollaborators {
                tenants: Arc::clone(&registry) as Arc<dyn TenantRegistry>,
                workspaces: Arc::new(DirectoryWorkspaceStore::new(base.join("workspaces"))),
                errors: Arc::new(JsonlErrorLog::new(error_log.clone())),
            },
        );

        Ok(Self {
            runtime: tokio::runtime::Runtime::new()?,
            supervisor,
            gate,
            registry,
            error_log,
            _dir: dir,
        })
    }

    pub(crate) fn flags(&self, id: &str) -> Option<TenantFlags> {
        self.registry
            .tenant(id)
            .ok()
            .flatten()
            .map(|tenant| tenant.flags())
    }

    pub(crate) fn error_log(&self) -> String {
        std::fs::read_to_string(&self.error_log).unwrap_or_default()
    }
}

impl Drop for SupervisorWorld {
    fn drop(&mut self) {
        drop(self.runtime.block_on(self.supervisor.stop_all()));
    }
}

#[derive(Default, ScenarioState)]
pub(crate) struct SupervisorState {
    pub(crate) world: Slot<Arc<SupervisorWorld>>,
    pub(crate) last_start: Slot<StartResult>,
    pub(crate) concurrent: Slot<Vec<StartResult>>,
    pub(crate) revived: Slot<Vec<(String, StartResult)>>,
}

#[fixture]
pub(crate) fn supervisor_state() -> SupervisorState {
    SupervisorState::default()
}
