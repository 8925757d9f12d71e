//! TOML-backed tenant registry.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::{Tenant, TenantFlags, TenantRegistry};
use crate::error::{BotboxError, ConfigError, Result, SupervisorError, io_failure};
use crate::rootfs::open_parent;

#[derive(Debug, Default, Deserialize, Serialize)]
struct BotsFile {
    #[serde(default)]
    bots: Vec<Tenant>,
}

/// Registry stored as a `[[bots]]` array in a TOML file.
///
/// A missing file is an empty registry. Flag updates rewrite the whole file
/// through a temporary sibling.
#[derive(Debug)]
pub struct FileTenantRegistry {
    path: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl FileTenantRegistry {
    /// Open the registry at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the bots file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> Result<BotsFile> {
        let (dir, name) = open_parent(&self.path).map_err(|error| io_failure(&self.path, &error))?;
        let text = match dir.read_to_string(&name) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(BotsFile::default()),
            Err(error) => return Err(io_failure(&self.path, &error)),
        };
        let file: BotsFile = toml::from_str(&text).map_err(|error| {
            BotboxError::from(ConfigError::ParseError {
                message: format!("{}: {error}", self.path),
            })
        })?;
        check_aliases(&file.bots)?;
        Ok(file)
    }

    fn store(&self, file: &BotsFile) -> Result<()> {
        let text = toml::to_string_pretty(file).map_err(|error| {
            BotboxError::from(ConfigError::ParseError {
                message: format!("{}: {error}", self.path),
            })
        })?;
        let (dir, name) = open_parent(&self.path).map_err(|error| io_failure(&self.path, &error))?;
        let partial = format!(".{name}.tmp");
        dir.write(&partial, text)
            .and_then(|()| dir.rename(&partial, &dir, &name))
            .map_err(|error| io_failure(&self.path, &error))
    }
}

/// Two tenants whose ids sanitise to the same alias would share a wrapper,
/// a process slot and bridge routing.
fn check_aliases(bots: &[Tenant]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(bots.len());
    for tenant in bots {
        if let Some(first) = seen.insert(tenant.alias(), &tenant.id) {
            return Err(SupervisorError::AliasCollision {
                alias: tenant.alias(),
                first: String::from(first),
                second: tenant.id.clone(),
            }
            .into());
        }
    }
    Ok(())
}

impl TenantRegistry for FileTenantRegistry {
    fn tenant(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(self.load()?.bots.into_iter().find(|tenant| tenant.id == id))
    }

    fn tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.load()?.bots)
    }

    fn set_flags(&self, id: &str, flags: TenantFlags) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let tenant = file
            .bots
            .iter_mut()
            .find(|tenant| tenant.id == id)
            .ok_or_else(|| SupervisorError::UnknownTenant {
                tenant_id: String::from(id),
            })?;
        tenant.enabled = flags.enabled;
        tenant.auto_start = flags.auto_start;
        self.store(&file)
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::sandbox::Language;

    const BOTS: &str = r#"
[[bots]]
id = "echo bot"
language = "js"

[[bots]]
id = "weather"
language = "python"
enabled = false
auto_start = false
entry = "src/app.py"
"#;

    #[fixture]
    fn registry() -> (TempDir, FileTenantRegistry) {
        let temp = TempDir::new().unwrap_or_else(|error| panic!("tempdir: {error}"));
        let path = Utf8PathBuf::from_path_buf(temp.path().join("bots.toml"))
            .unwrap_or_else(|path| panic!("non-UTF-8 path: {}", path.display()));
        std::fs::write(&path, BOTS).unwrap_or_else(|error| panic!("write: {error}"));
        (temp, FileTenantRegistry::new(path))
    }

    #[rstest]
    fn reads_tenants_with_defaults(registry: (TempDir, FileTenantRegistry)) -> Result<()> {
        let (_temp, registry) = registry;
        let tenants = registry.tenants()?;
        assert_eq!(tenants.len(), 2);

        let echo = registry
            .tenant("echo bot")?
            .unwrap_or_else(|| panic!("echo bot should exist"));
        assert_eq!(echo.language, Language::JavaScript);
        assert!(echo.enabled && echo.auto_start);
        assert_eq!(echo.alias(), "echo_bot");

        let weather = registry
            .tenant("weather")?
            .unwrap_or_else(|| panic!("weather should exist"));
        assert_eq!(weather.flags(), TenantFlags::DISABLED);
        assert_eq!(weather.entry.as_deref(), Some("src/app.py"));
        Ok(())
    }

    #[rstest]
    fn set_flags_persists(registry: (TempDir, FileTenantRegistry)) -> Result<()> {
        let (_temp, registry) = registry;
        registry.set_flags("echo bot", TenantFlags::DISABLED)?;

        let reopened = FileTenantRegistry::new(registry.path());
        let echo = reopened
            .tenant("echo bot")?
            .unwrap_or_else(|| panic!("echo bot should exist"));
        assert_eq!(echo.flags(), TenantFlags::DISABLED);
        assert!(reopened.tenant("weather")?.is_some());
        Ok(())
    }

    #[rstest]
    fn unknown_tenant_flags_are_rejected(registry: (TempDir, FileTenantRegistry)) {
        let (_temp, registry) = registry;
        let result = registry.set_flags("ghost", TenantFlags::DISABLED);
        assert!(matches!(
            result,
            Err(BotboxError::Supervisor(SupervisorError::UnknownTenant { .. }))
        ));
    }

    #[rstest]
    #[case("a.b", "a_b")]
    #[case("echo bot", "echo_bot")]
    fn colliding_aliases_are_rejected(#[case] first: &str, #[case] second: &str) -> Result<()> {
        let temp = TempDir::new().map_err(|error| io_failure("tempdir", &error))?;
        let path = Utf8PathBuf::from_path_buf(temp.path().join("bots.toml"))
            .unwrap_or_else(|path| panic!("non-UTF-8 path: {}", path.display()));
        let text = format!(
            "[[bots]]\nid = \"{first}\"\nlanguage = \"js\"\n\n[[bots]]\nid = \"{second}\"\nlanguage = \"py\"\n"
        );
        std::fs::write(&path, text).map_err(|error| io_failure(&path, &error))?;

        let result = FileTenantRegistry::new(path).tenants();

        assert!(
            matches!(
                result,
                Err(BotboxError::Supervisor(SupervisorError::AliasCollision {
                    first: ref listed_first,
                    second: ref listed_second,
                    ..
                })) if listed_first == first && listed_second == second
            ),
            "unexpected result: {result:?}"
        );
        Ok(())
    }

    #[rstest]
    fn missing_file_is_empty() -> Result<()> {
        let temp = TempDir::new().map_err(|error| io_failure("tempdir", &error))?;
        let path = Utf8PathBuf::from_path_buf(temp.path().join("absent.toml"))
            .unwrap_or_else(|path| panic!("non-UTF-8 path: {}", path.display()));
        assert!(FileTenantRegistry::new(path).tenants()?.is_empty());
        Ok(())
    }
}
