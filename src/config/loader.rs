//! Configuration loading with layered precedence.
//!
//! Precedence (lowest to highest): application defaults, configuration file,
//! `BOTBOX_*` environment variables, command-line arguments.
//!
//! The loader drives `MergeComposer` directly rather than the derive's
//! `load()` because the clap `Cli` owns subcommand dispatch, and because
//! typed environment values must fail fast instead of being silently ignored.
//!
//! # Environment Variable Handling
//!
//! String fields such as `BOTBOX_GUEST_ROOT_DIR` are always accepted. Typed
//! fields such as `BOTBOX_BRIDGE_PORT` or `BOTBOX_RUNTIME_NODE_MAJOR` must
//! parse, otherwise loading fails with `ConfigError::InvalidValue`. List
//! fields such as `BOTBOX_GUEST_MIRRORS` are comma separated; blank items are
//! dropped.

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use ortho_config::discovery::ConfigDiscovery;
use ortho_config::serde_json::{self, Map, Value};
use ortho_config::{MergeComposer, toml};

use crate::config::{AppConfig, Cli};
use crate::error::{ConfigError, Result};

/// The type of value expected from an environment variable.
#[derive(Clone, Copy)]
enum EnvVarType {
    /// String value (always accepted).
    String,
    /// Boolean value (`true`/`false`).
    Bool,
    /// Unsigned 64-bit integer.
    U64,
    /// Comma-separated list of strings.
    List,
}

/// Specification for a single environment variable mapping.
struct EnvVarSpec {
    /// The environment variable name.
    env_var: &'static str,
    /// The JSON path segments, e.g. `["bridge", "port"]`.
    path: &'static [&'static str],
    /// The expected value type.
    var_type: EnvVarType,
}

const fn spec(
    env_var: &'static str,
    path: &'static [&'static str],
    var_type: EnvVarType,
) -> EnvVarSpec {
    EnvVarSpec {
        env_var,
        path,
        var_type,
    }
}

/// Every environment variable recognised by the loader.
const ENV_VAR_SPECS: &[EnvVarSpec] = &[
    spec("BOTBOX_LOG_FILTER", &["log_filter"], EnvVarType::String),
    // Guest filesystem
    spec("BOTBOX_GUEST_ROOT_DIR", &["guest", "root_dir"], EnvVarType::String),
    spec("BOTBOX_GUEST_CACHE_DIR", &["guest", "cache_dir"], EnvVarType::String),
    spec(
        "BOTBOX_GUEST_SETUP_VERSION",
        &["guest", "setup_version"],
        EnvVarType::U64,
    ),
    spec("BOTBOX_GUEST_MIRRORS", &["guest", "mirrors"], EnvVarType::List),
    spec(
        "BOTBOX_GUEST_STRIP_COMPONENTS",
        &["guest", "strip_components"],
        EnvVarType::U64,
    ),
    // Runtime
    spec(
        "BOTBOX_RUNTIME_NODE_MAJOR",
        &["runtime", "node_major"],
        EnvVarType::U64,
    ),
    spec(
        "BOTBOX_RUNTIME_NODE_ARCH",
        &["runtime", "node_arch"],
        EnvVarType::String,
    ),
    spec(
        "BOTBOX_RUNTIME_INSTALL_ATTEMPTS",
        &["runtime", "install_attempts"],
        EnvVarType::U64,
    ),
    spec(
        "BOTBOX_RUNTIME_PACKAGE_MIRRORS",
        &["runtime", "package_mirrors"],
        EnvVarType::List,
    ),
    // Sandbox
    spec(
        "BOTBOX_SANDBOX_PROOT_BINARY",
        &["sandbox", "proot_binary"],
        EnvVarType::String,
    ),
    spec(
        "BOTBOX_SANDBOX_LOADER_DIR",
        &["sandbox", "loader_dir"],
        EnvVarType::String,
    ),
    spec(
        "BOTBOX_SANDBOX_NO_SECCOMP",
        &["sandbox", "no_seccomp"],
        EnvVarType::Bool,
    ),
    spec(
        "BOTBOX_SANDBOX_STOP_GRACE_MS",
        &["sandbox", "stop_grace_ms"],
        EnvVarType::U64,
    ),
    // Bridge
    spec(
        "BOTBOX_BRIDGE_BIND_ADDRESS",
        &["bridge", "bind_address"],
        EnvVarType::String,
    ),
    spec("BOTBOX_BRIDGE_PORT", &["bridge", "port"], EnvVarType::U64),
    // Supervisor
    spec(
        "BOTBOX_SUPERVISOR_MAX_TENANTS",
        &["supervisor", "max_tenants"],
        EnvVarType::U64,
    ),
    spec(
        "BOTBOX_SUPERVISOR_BOTS_FILE",
        &["supervisor", "bots_file"],
        EnvVarType::String,
    ),
    spec(
        "BOTBOX_SUPERVISOR_WORKSPACES_DIR",
        &["supervisor", "workspaces_dir"],
        EnvVarType::String,
    ),
    spec(
        "BOTBOX_SUPERVISOR_ERROR_LOG",
        &["supervisor", "error_log"],
        EnvVarType::String,
    ),
];

/// Returns the list of environment variable names recognised by the loader.
///
/// Tests use this to clear every `BOTBOX_*` variable without keeping a
/// second hard-coded list.
#[must_use]
pub fn env_var_names() -> Vec<&'static str> {
    ENV_VAR_SPECS.iter().map(|entry| entry.env_var).collect()
}

/// Read a TOML configuration file and push it to the composer.
fn load_config_file(path: &Utf8PathBuf, composer: &mut MergeComposer) -> Result<()> {
    let current_dir = Utf8PathBuf::from(".");
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| current_dir.as_ref());
    let file_name = path.file_name().unwrap_or(path.as_str());

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|e| {
        ConfigError::ParseError {
            message: format!("failed to open directory {parent}: {e}"),
        }
    })?;

    let content = dir
        .read_to_string(file_name)
        .map_err(|e| ConfigError::ParseError {
            message: format!("failed to read {path}: {e}"),
        })?;

    let value = toml::from_str::<Value>(&content).map_err(|e| ConfigError::ParseError {
        message: format!("failed to parse {path}: {e}"),
    })?;

    composer.push_file(value, Some(path.clone()));
    Ok(())
}

/// Locate the configuration file: an existing `--config` path first, then
/// `BOTBOX_CONFIG_PATH`, `.botbox.toml` and the XDG location.
fn discover_config_path(cli: &Cli) -> Option<Utf8PathBuf> {
    cli.config.clone().filter(|p| p.exists()).or_else(|| {
        ConfigDiscovery::builder("botbox")
            .env_var("BOTBOX_CONFIG_PATH")
            .config_file_name("config.toml")
            .dotfile_name(".botbox.toml")
            .build()
            .candidates()
            .into_iter()
            .filter(|p| p.exists())
            .find_map(|p| Utf8PathBuf::try_from(p).ok())
    })
}

/// Load configuration with full layer precedence and validate it.
///
/// # Errors
///
/// Returns `ConfigError` when a configuration file is malformed, a typed
/// environment variable does not parse, the merged layers do not form a valid
/// `AppConfig`, or [`AppConfig::validate`] rejects the result.
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut composer = MergeComposer::new();

    let defaults =
        serde_json::to_value(AppConfig::default()).map_err(|e| ConfigError::ParseError {
            message: format!("failed to serialise defaults: {e}"),
        })?;
    composer.push_defaults(defaults);

    if let Some(ref path) = discover_config_path(cli) {
        load_config_file(path, &mut composer)?;
    }

    let env_values = collect_env_vars()?;
    if !env_values.is_null() {
        composer.push_environment(env_values);
    }

    let cli_overrides = build_cli_overrides(cli);
    if !cli_overrides.is_null() {
        composer.push_cli(cli_overrides);
    }

    let config =
        AppConfig::merge_from_layers(composer.layers()).map_err(ConfigError::OrthoConfig)?;
    config.validate()?;
    tracing::debug!(
        root = %config.guest.root_dir,
        port = config.bridge.port,
        "configuration loaded"
    );
    Ok(config)
}

fn invalid_env(spec: &EnvVarSpec, reason: String) -> crate::error::BotboxError {
    ConfigError::InvalidValue {
        field: spec.env_var.to_owned(),
        reason,
    }
    .into()
}

/// Collect `BOTBOX_*` environment variables into a JSON value.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` if a typed variable does not parse.
fn collect_env_vars() -> Result<Value> {
    let mut root = Map::new();

    for entry in ENV_VAR_SPECS {
        let Ok(raw_value) = std::env::var(entry.env_var) else {
            continue;
        };

        let json_value = match entry.var_type {
            EnvVarType::String => Value::String(raw_value),
            EnvVarType::Bool => Value::Bool(raw_value.parse::<bool>().map_err(|_| {
                invalid_env(
                    entry,
                    format!("expected bool (true/false), got '{raw_value}'"),
                )
            })?),
            EnvVarType::U64 => Value::Number(
                raw_value
                    .parse::<u64>()
                    .map_err(|_| {
                        invalid_env(entry, format!("expected unsigned integer, got '{raw_value}'"))
                    })?
                    .into(),
            ),
            EnvVarType::List => Value::Array(
                raw_value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_owned()))
                    .collect(),
            ),
        };

        insert_at_path(&mut root, entry.path, json_value);
    }

    if root.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(Value::Object(root))
    }
}

/// Insert a value at a nested path, creating intermediate objects.
fn insert_at_path(root: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((&field, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for &segment in parents {
        let entry = current
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(obj) = entry.as_object_mut() else {
            return;
        };
        current = obj;
    }

    current.insert(field.to_owned(), value);
}

/// Build a JSON value containing CLI overrides.
fn build_cli_overrides(cli: &Cli) -> Value {
    let mut overrides = Map::new();

    if let Some(ref filter) = cli.log_filter {
        overrides.insert("log_filter".to_owned(), Value::String(filter.clone()));
    }

    if let Some(port) = cli.bridge_port {
        insert_at_path(&mut overrides, &["bridge", "port"], Value::from(port));
    }

    if overrides.is_empty() {
        Value::Null
    } else {
        Value::Object(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn insert_at_path_creates_nested_objects() {
        let mut root = Map::new();
        insert_at_path(&mut root, &["bridge", "port"], Value::from(9000_u16));
        insert_at_path(&mut root, &["bridge", "bind_address"], Value::from("0.0.0.0"));

        assert_eq!(
            Value::Object(root),
            serde_json::json!({ "bridge": { "port": 9000, "bind_address": "0.0.0.0" } })
        );
    }

    #[rstest]
    fn env_var_names_are_unique_and_prefixed() {
        let names = env_var_names();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
        assert!(names.iter().all(|name| name.starts_with("BOTBOX_")));
    }

    #[rstest]
    fn cli_overrides_are_null_without_flags() {
        let cli = Cli {
            command: crate::config::Commands::Status,
            config: None,
            log_filter: None,
            bridge_port: None,
        };
        assert!(build_cli_overrides(&cli).is_null());
    }

    #[rstest]
    fn cli_bridge_port_maps_to_nested_field() {
        let cli = Cli {
            command: crate::config::Commands::Serve,
            config: None,
            log_filter: Some(String::from("botbox=trace")),
            bridge_port: Some(4040),
        };
        assert_eq!(
            build_cli_overrides(&cli),
            serde_json::json!({ "log_filter": "botbox=trace", "bridge": { "port": 4040 } })
        );
    }
}
