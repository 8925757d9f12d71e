//! Sandboxed script execution.
//!
//! [`SandboxExecutor`] owns at most one isolation process per tenant alias.
//! Each process gets two drain tasks forwarding stdout and stderr lines to
//! caller callbacks and a watcher task that owns the child handle, reaps it
//! and publishes its [`ExitInfo`]. `stop` is the only cancellation path: a
//! graceful signal to the process group, a bounded grace window, a forceful
//! signal, the reap, then a pattern-kill sweep inside the guest for
//! descendants the isolation layer lost track of.

mod command;
mod wrapper;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub use command::{GUEST_PATH, IsolationCommand, IsolationEnv, IsolationEnvResolver};
pub use wrapper::{GUEST_HOME, Language, guest_workspace_dir, sanitize_alias, wrapper_file_name};

use crate::bridge::HelloTokens;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

/// Stderr prefixes the isolation layer uses for benign notices.
const ISOLATION_NOTICE_PREFIXES: &[&str] = &["proot info:", "proot warning:"];

/// Upper bound on waiting for drain tasks after the child exits. Orphaned
/// descendants can hold the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Severity attached to a forwarded stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational output, such as isolation-layer notices.
    Info,
    /// Anything else written to stderr.
    Error,
}

/// Classify a stderr line.
#[must_use]
pub fn classify_stderr(line: &str) -> Severity {
    let trimmed = line.trim_start();
    if ISOLATION_NOTICE_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        Severity::Info
    } else {
        Severity::Error
    }
}

type StdoutCallback = Arc<dyn Fn(&str) + Send + Sync>;
type StderrCallback = Arc<dyn Fn(Severity, &str) + Send + Sync>;

/// Line callbacks for a sandbox process.
#[derive(Clone)]
pub struct OutputCallbacks {
    on_stdout: StdoutCallback,
    on_stderr: StderrCallback,
}

impl std::fmt::Debug for OutputCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputCallbacks").finish_non_exhaustive()
    }
}

impl OutputCallbacks {
    /// Build callbacks from two closures.
    #[must_use]
    pub fn new(
        on_stdout: impl Fn(&str) + Send + Sync + 'static,
        on_stderr: impl Fn(Severity, &str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_stdout: Arc::new(on_stdout),
            on_stderr: Arc::new(on_stderr),
        }
    }

    /// Callbacks that forward every line to `tracing`.
    #[must_use]
    pub fn logging(alias: &str) -> Self {
        let stdout_alias = alias.to_owned();
        let stderr_alias = alias.to_owned();
        Self::new(
            move |line| tracing::info!(alias = %stdout_alias, "{line}"),
            move |severity, line| match severity {
                Severity::Info => tracing::info!(alias = %stderr_alias, "{line}"),
                Severity::Error => tracing::warn!(alias = %stderr_alias, "{line}"),
            },
        )
    }
}

/// How a sandbox process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
    /// Whether the exit was caused by [`SandboxExecutor::stop`].
    pub stopped: bool,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, stopped: bool) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            stopped,
        }
    }

    const fn unknown(stopped: bool) -> Self {
        Self {
            code: None,
            signal: None,
            stopped,
        }
    }

    /// Whether the process exited with code zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Captured result of a one-off guest script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestOutput {
    /// Exit code, if any.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl GuestOutput {
    /// Whether the script exited with code zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Boxed future returned by [`GuestShell`] implementors.
pub type GuestScriptFuture<'a> = Pin<Box<dyn Future<Output = Result<GuestOutput>> + Send + 'a>>;

/// Behaviour required to run a shell script inside the guest.
///
/// The runtime manager probes and installs interpreters through this seam.
pub trait GuestShell: Send + Sync {
    /// Run `script` with `/bin/sh -c` inside the guest and capture its
    /// output.
    fn run_guest_script(&self, script: &str) -> GuestScriptFuture<'_>;
}

/// Parameters for one tenant process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    alias: String,
    language: Language,
    workspace: Utf8PathBuf,
    entry: Utf8PathBuf,
    extra_binds: Vec<(Utf8PathBuf, String)>,
}

impl SandboxRequest {
    /// Create a request running `entry`, which must live inside `workspace`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::EntryOutsideWorkspace` if `entry` is not below
    /// `workspace`.
    pub fn new(
        alias: impl Into<String>,
        language: Language,
        workspace: impl Into<Utf8PathBuf>,
        entry: impl Into<Utf8PathBuf>,
    ) -> Result<Self> {
        let workspace_path = workspace.into();
        let entry_path = entry.into();
        let inside = entry_path
            .strip_prefix(&workspace_path)
            .is_ok_and(|relative| {
                !relative.as_str().is_empty()
                    && relative
                        .components()
                        .all(|component| matches!(component, Utf8Component::Normal(_)))
            });
        if !inside {
            return Err(SandboxError::EntryOutsideWorkspace {
                entry: entry_path.into_std_path_buf(),
                workspace: workspace_path.into_std_path_buf(),
            }
            .into());
        }

        Ok(Self {
            alias: alias.into(),
            language,
            workspace: workspace_path,
            entry: entry_path,
            extra_binds: Vec::new(),
        })
    }

    /// Bind an additional host directory into the guest.
    #[must_use]
    pub fn with_bind(mut self, host: impl Into<Utf8PathBuf>, guest: impl Into<String>) -> Self {
        self.extra_binds.push((host.into(), guest.into()));
        self
    }

    /// Tenant alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Script language.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Host workspace directory.
    #[must_use]
    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    /// Guest path of the entry script.
    #[must_use]
    pub fn guest_entry(&self) -> String {
        let relative = self
            .entry
            .strip_prefix(&self.workspace)
            .unwrap_or(&self.entry);
        format!("{}/{relative}", guest_workspace_dir(&self.alias))
    }
}

/// Handle to a started sandbox process.
#[derive(Debug)]
pub struct RunningSandbox {
    alias: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl RunningSandbox {
    /// Tenant alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Host process id of the isolation process.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to be reaped.
    pub async fn wait(mut self) -> ExitInfo {
        wait_exit(&mut self.exit).await
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    let published = exit
        .wait_for(Option::is_some)
        .await
        .map(|info| *info);
    match published {
        Ok(Some(info)) => info,
        Ok(None) | Err(_) => ExitInfo::unknown(false),
    }
}

struct ProcessEntry {
    generation: u64,
    pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

type ProcessTable = Arc<Mutex<HashMap<String, ProcessEntry>>>;

fn lock_table(table: &Mutex<HashMap<String, ProcessEntry>>) -> MutexGuard<'_, HashMap<String, ProcessEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_failed(alias: &str, message: impl Into<String>) -> crate::error::BotboxError {
    SandboxError::SpawnFailed {
        alias: alias.to_owned(),
        message: message.into(),
    }
    .into()
}

/// Runs tenant scripts inside the guest, one process per alias.
pub struct SandboxExecutor {
    config: SandboxConfig,
    env: IsolationEnv,
    guest_root: Utf8PathBuf,
    bridge_port: u16,
    processes: ProcessTable,
    generation: AtomicU64,
    tokens: Option<Arc<HelloTokens>>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("guest_root", &self.guest_root)
            .field("bridge_port", &self.bridge_port)
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Create an executor for the guest at `guest_root`. Tenant processes
    /// are told to reach the bridge on `bridge_port`.
    #[must_use]
    pub fn new(
        config: SandboxConfig,
        env: IsolationEnv,
        guest_root: impl Into<Utf8PathBuf>,
        bridge_port: u16,
    ) -> Self {
        Self {
            config,
            env,
            guest_root: guest_root.into(),
            bridge_port,
            processes: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            tokens: None,
        }
    }

    /// Issue a bridge handshake token from `tokens` for every start and
    /// pass it to the wrapper.
    #[must_use]
    pub fn with_hello_tokens(mut self, tokens: Arc<HelloTokens>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Host path of the guest root.
    #[must_use]
    pub fn guest_root(&self) -> &Utf8Path {
        &self.guest_root
    }

    fn base_command(&self) -> IsolationCommand {
        IsolationCommand::new(&self.config, &self.env, &self.guest_root)
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.stop_grace_ms)
    }

    fn check_prerequisites(&self, alias: &str) -> Result<()> {
        if !self.config.proot_binary.is_file() {
            return Err(spawn_failed(
                alias,
                format!("isolation binary '{}' not found", self.config.proot_binary),
            ));
        }
        if !self.guest_root.is_dir() {
            return Err(spawn_failed(
                alias,
                format!("guest root '{}' not found", self.guest_root),
            ));
        }
        Ok(())
    }

    /// Start the tenant process, replacing any process already running for
    /// the alias.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::SpawnFailed` if the isolation binary or guest
    /// root is missing, the wrapper cannot be written, or the spawn fails.
    pub async fn start(
        &self,
        request: &SandboxRequest,
        callbacks: OutputCallbacks,
    ) -> Result<RunningSandbox> {
        let alias = request.alias();
        if let Some(previous) = self.stop(alias).await {
            tracing::debug!(alias = %alias, ?previous, "replaced running sandbox");
        }
        self.check_prerequisites(alias)?;

        let wrapper_path = wrapper::install_wrapper(&self.guest_root, alias, request.language())
            .map_err(|error| spawn_failed(alias, format!("failed to write wrapper: {error}")))?;

        let workspace_guest = guest_workspace_dir(alias);
        let mut command = self
            .base_command()
            .bind(request.workspace(), workspace_guest.clone());
        for (host, guest) in &request.extra_binds {
            command = command.bind(host.clone(), guest.clone());
        }
        if let Some(tokens) = &self.tokens {
            command = command.guest_var("BOTBOX_BRIDGE_TOKEN", tokens.issue(alias));
        }
        let command = command
            .workdir(workspace_guest)
            .guest_var("BOTBOX_BRIDGE_PORT", self.bridge_port.to_string())
            .guest_var("BOTBOX_BOT_ID", alias)
            .guest_var("PYTHONUNBUFFERED", "1")
            .exec([
                String::from(request.language().interpreter()),
                wrapper_path.to_string(),
                request.guest_entry(),
            ]);

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|error| spawn_failed(alias, error.to_string()))?;
        let pid = child.id();

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let on_stdout = Arc::clone(&callbacks.on_stdout);
            drains.push(spawn_drain(stdout, move |line| on_stdout(line)));
        }
        if let Some(stderr) = child.stderr.take() {
            let on_stderr = Arc::clone(&callbacks.on_stderr);
            drains.push(spawn_drain(stderr, move |line| {
                on_stderr(classify_stderr(line), line);
            }));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = lock_table(&self.processes);
            let stale = table.insert(
                alias.to_owned(),
                ProcessEntry {
                    generation,
                    pid,
                    stop_tx,
                    exit: exit_rx.clone(),
                },
            );
            if let Some(entry) = stale {
                tracing::warn!(alias = %alias, pid = ?entry.pid, "stopping concurrently started sandbox");
                if entry.stop_tx.send(()).is_err() {
                    tracing::debug!(alias = %alias, "stale sandbox already exited");
                }
            }
        }

        tokio::spawn(watch_process(WatchedProcess {
            child,
            stop_rx,
            grace: self.grace(),
            drains,
            exit_tx,
            processes: Arc::clone(&self.processes),
            alias: alias.to_owned(),
            generation,
        }));

        tracing::info!(alias = %alias, pid = ?pid, "sandbox started");
        Ok(RunningSandbox {
            alias: alias.to_owned(),
            pid,
            exit: exit_rx,
        })
    }

    /// Start the tenant process and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::start`].
    pub async fn run(
        &self,
        request: &SandboxRequest,
        callbacks: OutputCallbacks,
    ) -> Result<ExitInfo> {
        let running = self.start(request, callbacks).await?;
        Ok(running.wait().await)
    }

    /// Stop the process for `alias`, then sweep the guest for leftovers.
    ///
    /// Returns the exit of the stopped process, or `None` if nothing was
    /// registered. The sweep runs either way; its failures are logged.
    pub async fn stop(&self, alias: &str) -> Option<ExitInfo> {
        if let Some(tokens) = &self.tokens {
            tokens.revoke(alias);
        }
        let entry = lock_table(&self.processes).remove(alias);
        let exit = match entry {
            Some(mut process) => {
                if process.stop_tx.send(()).is_err() {
                    tracing::debug!(alias = %alias, "sandbox exited before stop request");
                }
                Some(wait_exit(&mut process.exit).await)
            }
            None => None,
        };

        self.sweep(alias).await;
        exit
    }

    /// Kill any guest process still running the alias' wrapper.
    async fn sweep(&self, alias: &str) {
        if !self.guest_root.is_dir() || !self.config.proot_binary.is_file() {
            return;
        }
        // The escaped dot keeps the pattern from matching this shell's own
        // command line.
        let script = format!("pkill -9 -f 'wrapper_{alias}\\.' || true");
        match self.run_script(&script).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::debug!(alias = %alias, code = ?output.code, stderr = %output.stderr.trim(), "sweep reported failure");
            }
            Err(error) => tracing::debug!(alias = %alias, error = %error, "sweep failed"),
        }
    }

    async fn run_script(&self, script: &str) -> Result<GuestOutput> {
        const SHELL_ALIAS: &str = "guest-shell";
        self.check_prerequisites(SHELL_ALIAS)?;
        let output = self
            .base_command()
            .exec(["/bin/sh", "-c", script])
            .to_command()
            .output()
            .await
            .map_err(|error| spawn_failed(SHELL_ALIAS, error.to_string()))?;
        Ok(GuestOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Whether a process is registered for `alias`.
    #[must_use]
    pub fn is_running(&self, alias: &str) -> bool {
        lock_table(&self.processes).contains_key(alias)
    }

    /// Number of registered processes.
    #[must_use]
    pub fn running_count(&self) -> usize {
        lock_table(&self.processes).len()
    }

    /// Aliases with a registered process, sorted.
    #[must_use]
    pub fn running_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = lock_table(&self.processes).keys().cloned().collect();
        aliases.sort_unstable();
        aliases
    }
}

impl GuestShell for SandboxExecutor {
    fn run_guest_script(&self, script: &str) -> GuestScriptFuture<'_> {
        let script_owned = String::from(script);
        Box::pin(async move { self.run_script(&script_owned).await })
    }
}

fn spawn_drain<R>(reader: R, forward: impl Fn(&str) + Send + 'static) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => forward(&decode_line(&buffer)),
                Err(error) => {
                    tracing::debug!(error = %error, "output drain stopped");
                    break;
                }
            }
        }
    })
}

/// Decode one output line, replacing invalid UTF-8 and dropping the line
/// terminator.
fn decode_line(raw: &[u8]) -> String {
    let without_newline = raw.strip_suffix(b"\n").unwrap_or(raw);
    let trimmed = without_newline
        .strip_suffix(b"\r")
        .unwrap_or(without_newline);
    String::from_utf8_lossy(trimmed).into_owned()
}

struct WatchedProcess {
    child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    drains: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    processes: ProcessTable,
    alias: String,
    generation: u64,
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    StopRequested,
}

async fn watch_process(mut watched: WatchedProcess) {
    let wake = tokio::select! {
        status = watched.child.wait() => Wake::Exited(status),
        _ = &mut watched.stop_rx => Wake::StopRequested,
    };
    let (status, stopped) = match wake {
        Wake::Exited(status) => (status, false),
        Wake::StopRequested => (terminate(&mut watched.child, watched.grace).await, true),
    };

    for drain in watched.drains {
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!(alias = %watched.alias, "output drain outlived process");
        }
    }

    {
        let mut table = lock_table(&watched.processes);
        if table
            .get(&watched.alias)
            .is_some_and(|entry| entry.generation == watched.generation)
        {
            table.remove(&watched.alias);
        }
    }

    let info = match status {
        Ok(exit_status) => ExitInfo::from_status(exit_status, stopped),
        Err(error) => {
            let failure = SandboxError::WaitFailed {
                alias: watched.alias.clone(),
                message: error.to_string(),
            };
            tracing::warn!(error = %failure, "failed to reap sandbox");
            ExitInfo::unknown(stopped)
        }
    };
    tracing::info!(alias = %watched.alias, code = ?info.code, signal = ?info.signal, stopped, "sandbox exited");
    watched.exit_tx.send_replace(Some(info));
}

/// Graceful signal, bounded wait, forceful signal, reap.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();
    signal_group(pid, Signal::Terminate);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    signal_group(pid, Signal::Kill);
    if let Err(error) = child.start_kill() {
        tracing::debug!(error = %error, "kill after grace period failed");
    }
    child.wait().await
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    use nix::sys::signal::{Signal as NixSignal, killpg};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    let nix_signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if let Err(error) = killpg(Pid::from_raw(raw), nix_signal) {
        tracing::debug!(pid = raw, ?signal, error = %error, "signalling process group failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}
