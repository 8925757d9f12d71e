//! Workspaces laid out as one directory per tenant alias.

use camino::Utf8PathBuf;

use super::{Tenant, Workspace, WorkspaceStore};
use crate::error::{Result, SupervisorError};

/// Resolves `<root>/<alias>/main.<ext>`, or the tenant's explicit entry.
#[derive(Debug, Clone)]
pub struct DirectoryWorkspaceStore {
    root: Utf8PathBuf,
}

impl DirectoryWorkspaceStore {
    /// Store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceStore for DirectoryWorkspaceStore {
    fn workspace(&self, tenant: &Tenant) -> Result<Workspace> {
        let directory = self.root.join(tenant.alias());
        let entry = tenant.entry.as_ref().map_or_else(
            || directory.join(format!("main.{}", tenant.language.extension())),
            |relative| directory.join(relative),
        );
        if !entry.is_file() {
            return Err(SupervisorError::WorkspaceMissing {
                tenant_id: tenant.id.clone(),
                path: entry.into_std_path_buf(),
            }
            .into());
        }
        Ok(Workspace { directory, entry })
    }
}
