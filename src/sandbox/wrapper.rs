//! Per-tenant wrapper scripts and alias sanitisation.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};

const JS_WRAPPER: &str = include_str!("wrappers/bridge_wrapper.js");
const PY_WRAPPER: &str = include_str!("wrappers/bridge_wrapper.py");

/// Guest directory holding wrappers and workspaces.
pub const GUEST_HOME: &str = "/root";

/// Script language a tenant is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// JavaScript, run by Node.js.
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    /// Python 3.
    #[serde(alias = "py", alias = "python3")]
    Python,
}

impl Language {
    /// File extension used for wrappers and default entry scripts.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::JavaScript => "js",
            Self::Python => "py",
        }
    }

    /// Interpreter resolved through the guest `PATH`.
    #[must_use]
    pub const fn interpreter(self) -> &'static str {
        match self {
            Self::JavaScript => "node",
            Self::Python => "python3",
        }
    }

    const fn template(self) -> &'static str {
        match self {
            Self::JavaScript => JS_WRAPPER,
            Self::Python => PY_WRAPPER,
        }
    }
}

/// Derive a filesystem-safe alias from a tenant identifier.
///
/// ASCII alphanumerics, `_` and `-` are kept; every other character becomes
/// `_`. An identifier that yields nothing becomes `bot`.
#[must_use]
pub fn sanitize_alias(id: &str) -> String {
    let alias: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if alias.is_empty() {
        String::from("bot")
    } else {
        alias
    }
}

/// Wrapper file name for `alias`, e.g. `wrapper_echo.js`.
#[must_use]
pub fn wrapper_file_name(alias: &str, language: Language) -> String {
    format!("wrapper_{alias}.{}", language.extension())
}

/// Guest mount point of the tenant workspace.
#[must_use]
pub fn guest_workspace_dir(alias: &str) -> String {
    format!("{GUEST_HOME}/workspace_{alias}")
}

/// Write the wrapper for `alias` into the guest home and return its guest
/// path. The mount point for the workspace is created alongside.
pub(crate) fn install_wrapper(
    guest_root: &Utf8Path,
    alias: &str,
    language: Language,
) -> io::Result<Utf8PathBuf> {
    let root = Dir::open_ambient_dir(guest_root, ambient_authority())?;
    let home = GUEST_HOME.trim_start_matches('/');
    root.create_dir_all(home)?;
    let home_dir = root.open_dir(home)?;

    let file_name = wrapper_file_name(alias, language);
    home_dir.write(&file_name, language.template())?;
    home_dir.create_dir_all(format!("workspace_{alias}"))?;

    Ok(Utf8PathBuf::from(GUEST_HOME).join(file_name))
}
