//! The isolation command line and its process environment.

use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::SandboxConfig;

/// `PATH` used both by the isolation process and inside the guest.
pub const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host-side environment values that steer the isolation binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationEnv {
    /// Directory holding the loader and helper libraries.
    pub library_dir: Utf8PathBuf,
    /// Host temp directory, bound to the guest `/tmp`.
    pub tmp_dir: Utf8PathBuf,
    /// Explicit loader path, if any.
    pub loader: Option<Utf8PathBuf>,
    /// Whether to disable the seccomp acceleration.
    pub no_seccomp: bool,
}

/// Resolves [`IsolationEnv`] from configuration, falling back to the host
/// environment.
///
/// # Type Parameters
///
/// * `E` - An environment provider implementing `mockable::Env`.
pub struct IsolationEnvResolver<'a, E: mockable::Env> {
    env: &'a E,
}

impl<'a, E: mockable::Env> IsolationEnvResolver<'a, E> {
    /// Creates a resolver reading from `env`.
    #[must_use]
    pub const fn new(env: &'a E) -> Self {
        Self { env }
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.env.string(name).filter(|value| !value.trim().is_empty())
    }

    /// Resolve the isolation environment.
    ///
    /// The temp directory comes from `sandbox.tmp_dir`, then `PROOT_TMP_DIR`,
    /// then `TMPDIR`, then `/tmp`. The loader comes from `sandbox.loader`,
    /// then `PROOT_LOADER`. Seccomp is disabled when configured or when
    /// `PROOT_NO_SECCOMP` is `1`.
    #[must_use]
    pub fn resolve(&self, config: &SandboxConfig) -> IsolationEnv {
        let tmp_dir = config
            .tmp_dir
            .clone()
            .or_else(|| self.non_empty("PROOT_TMP_DIR").map(Utf8PathBuf::from))
            .or_else(|| self.non_empty("TMPDIR").map(Utf8PathBuf::from))
            .unwrap_or_else(|| Utf8PathBuf::from("/tmp"));
        let loader = config
            .loader
            .clone()
            .or_else(|| self.non_empty("PROOT_LOADER").map(Utf8PathBuf::from));
        let no_seccomp = config.no_seccomp
            || self
                .non_empty("PROOT_NO_SECCOMP")
                .is_some_and(|value| value.trim() == "1");

        IsolationEnv {
            library_dir: config.loader_dir.clone(),
            tmp_dir,
            loader,
            no_seccomp,
        }
    }
}

/// A fully described isolation invocation.
///
/// The argument template is fixed: root emulation, symlinked hard links,
/// kill-on-exit, a fake kernel release, the guest root, `/dev`, `/proc` and
/// `/sys` binds, the private `/tmp` bind, any extra binds, the working
/// directory and finally `/usr/bin/env -i` with a clean guest environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationCommand {
    program: Utf8PathBuf,
    kernel_release: String,
    guest_root: Utf8PathBuf,
    env: IsolationEnv,
    binds: Vec<(Utf8PathBuf, String)>,
    workdir: String,
    guest_env: Vec<(String, String)>,
    argv: Vec<String>,
}

impl IsolationCommand {
    /// Start a command for the guest at `guest_root`.
    #[must_use]
    pub fn new(config: &SandboxConfig, env: &IsolationEnv, guest_root: &Utf8Path) -> Self {
        Self {
            program: config.proot_binary.clone(),
            kernel_release: config.kernel_release.clone(),
            guest_root: guest_root.to_owned(),
            env: env.clone(),
            binds: Vec::new(),
            workdir: String::from("/root"),
            guest_env: vec![
                (String::from("HOME"), String::from("/root")),
                (String::from("PATH"), String::from(GUEST_PATH)),
                (String::from("LANG"), String::from("C.UTF-8")),
            ],
            argv: Vec::new(),
        }
    }

    /// Bind `host` read/write at `guest`.
    #[must_use]
    pub fn bind(mut self, host: impl Into<Utf8PathBuf>, guest: impl Into<String>) -> Self {
        self.binds.push((host.into(), guest.into()));
        self
    }

    /// Set the guest working directory.
    #[must_use]
    pub fn workdir(mut self, guest: impl Into<String>) -> Self {
        self.workdir = guest.into();
        self
    }

    /// Add a variable to the clean guest environment.
    #[must_use]
    pub fn guest_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.guest_env.push((name.into(), value.into()));
        self
    }

    /// Set the guest program and its arguments.
    #[must_use]
    pub fn exec<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    /// The isolation binary.
    #[must_use]
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The complete argument vector passed to the isolation binary.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-0"),
            String::from("--link2symlink"),
            String::from("--kill-on-exit"),
            String::from("-k"),
            self.kernel_release.clone(),
            String::from("-r"),
            self.guest_root.to_string(),
        ];
        for system in ["/dev", "/proc", "/sys"] {
            args.push(String::from("-b"));
            args.push(String::from(system));
        }
        args.push(String::from("-b"));
        args.push(format!("{}:/tmp", self.env.tmp_dir));
        for (host, guest) in &self.binds {
            args.push(String::from("-b"));
            args.push(format!("{host}:{guest}"));
        }
        args.push(String::from("-w"));
        args.push(self.workdir.clone());
        args.push(String::from("/usr/bin/env"));
        args.push(String::from("-i"));
        args.extend(
            self.guest_env
                .iter()
                .map(|(name, value)| format!("{name}={value}")),
        );
        args.extend(self.argv.iter().cloned());
        args
    }

    /// Environment variables set on the isolation process. The inherited
    /// environment is cleared.
    #[must_use]
    pub fn process_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("LD_LIBRARY_PATH", self.env.library_dir.to_string()),
            ("PROOT_TMP_DIR", self.env.tmp_dir.to_string()),
            ("PATH", String::from(GUEST_PATH)),
        ];
        if let Some(loader) = &self.env.loader {
            vars.push(("PROOT_LOADER", loader.to_string()));
        }
        if self.env.no_seccomp {
            vars.push(("PROOT_NO_SECCOMP", String::from("1")));
        }
        vars
    }

    /// Build a `tokio` command with piped output, a null stdin and its own
    /// process group.
    #[must_use]
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(self.program.as_std_path());
        command
            .args(self.args())
            .env_clear()
            .envs(self.process_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}
