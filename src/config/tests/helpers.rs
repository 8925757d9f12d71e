//! Shared fixtures and helper functions for config tests.

use crate::config::AppConfig;
use ortho_config::MergeComposer;
use rstest::fixture;
use std::sync::Arc;

/// Fixture providing an `AppConfig` parsed from a full TOML example.
#[fixture]
pub fn app_config_from_full_toml() -> AppConfig {
    let toml = r#"
        log_filter = "botbox=debug"

        [guest]
        root_dir = "/data/botbox/rootfs"
        setup_version = 3
        mirrors = ["https://mirror.example/rootfs.tar.gz"]
        strip_components = 1

        [runtime]
        node_major = 20
        node_arch = "x64"
        install_attempts = 5

        [[runtime.node_channels]]
        name = "internal"
        base_url = "https://nodes.example/v{major}"
        musl = true

        [sandbox]
        proot_binary = "/opt/proot"
        stop_grace_ms = 500

        [bridge]
        bind_address = "0.0.0.0"
        port = 9000

        [supervisor]
        max_tenants = 4
    "#;

    toml::from_str(toml).expect("TOML parsing should succeed")
}

/// Fixture providing an `AppConfig` parsed from a minimal TOML example.
#[fixture]
pub fn app_config_from_partial_toml() -> AppConfig {
    let toml = r"
        [bridge]
        port = 18000
    ";

    toml::from_str(toml).expect("TOML parsing should succeed")
}

/// Helper: Creates a `MergeComposer` with defaults layer already pushed.
pub fn create_composer_with_defaults() -> Result<MergeComposer, serde_json::Error> {
    let mut composer = MergeComposer::new();
    let defaults = ortho_config::serde_json::to_value(AppConfig::default())?;
    composer.push_defaults(defaults);
    Ok(composer)
}

/// Helper: Merges layers from a composer into `AppConfig`.
pub fn merge_config(composer: MergeComposer) -> Result<AppConfig, Arc<ortho_config::OrthoError>> {
    AppConfig::merge_from_layers(composer.layers())
}

/// Helper: Asserts that a config has all default values.
pub fn assert_config_has_defaults(config: &AppConfig) {
    assert!(config.log_filter.is_none(), "log_filter should be None");
    assert_eq!(config.guest.root_dir.as_str(), "/var/lib/botbox/rootfs");
    assert_eq!(config.guest.setup_version, 1);
    assert_eq!(config.runtime.node_major, 22);
    assert_eq!(config.runtime.install_attempts, 3);
    assert_eq!(config.sandbox.stop_grace_ms, 300);
    assert_eq!(config.bridge.port, 17_235);
    assert_eq!(config.bridge.reply_interval_ms, 1_000);
    assert_eq!(config.supervisor.max_tenants, 16);
}

/// Helper: Creates a `MergeComposer` with defaults, file and env layers for
/// precedence tests.
pub fn create_composer_with_file_and_env() -> Result<MergeComposer, serde_json::Error> {
    use ortho_config::serde_json::json;

    let mut composer = create_composer_with_defaults()?;

    composer.push_file(
        json!({
            "log_filter": "botbox=info",
            "bridge": { "port": 9000, "bind_address": "0.0.0.0" }
        }),
        None,
    );

    composer.push_environment(json!({
        "bridge": { "port": 9100 }
    }));

    Ok(composer)
}
