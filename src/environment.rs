//! One-time guest initialisation shared by every tenant start.
//!
//! [`GuestEnvironment`] composes the provisioner and the runtime manager
//! behind an initialisation lock that the caller constructs and injects. The
//! first caller does the work; later callers take the fast path once the
//! guest is ready.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::rootfs::{ProvisionOutcome, RootfsProvisioner};
use crate::runtime::{RuntimeEnvironmentManager, RuntimeStatus};

/// Boxed future returned by [`EnvironmentGate`] implementors.
pub type EnsureReadyFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Behaviour required before any tenant process may start.
pub trait EnvironmentGate: Send + Sync {
    /// Make sure the guest filesystem and runtimes are ready.
    fn ensure_ready(&self) -> EnsureReadyFuture<'_>;
}

/// Readiness reached by [`GuestEnvironment::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// What provisioning did.
    pub provision: ProvisionOutcome,
    /// Runtime pin status.
    pub runtime: RuntimeStatus,
}

/// Guest initialisation serialised by an injected lock.
#[derive(Debug)]
pub struct GuestEnvironment {
    provisioner: RootfsProvisioner,
    runtime: RuntimeEnvironmentManager,
    init_lock: Arc<Mutex<Option<RuntimeStatus>>>,
}

impl GuestEnvironment {
    /// Compose the provisioner and runtime manager under `init_lock`.
    #[must_use]
    pub const fn new(
        provisioner: RootfsProvisioner,
        runtime: RuntimeEnvironmentManager,
        init_lock: Arc<Mutex<Option<RuntimeStatus>>>,
    ) -> Self {
        Self {
            provisioner,
            runtime,
            init_lock,
        }
    }

    /// Create a fresh initialisation lock.
    #[must_use]
    pub fn new_init_lock() -> Arc<Mutex<Option<RuntimeStatus>>> {
        Arc::new(Mutex::new(None))
    }

    /// The guest provisioner.
    #[must_use]
    pub const fn provisioner(&self) -> &RootfsProvisioner {
        &self.provisioner
    }

    /// Provision the guest and pin runtimes, reporting what happened.
    ///
    /// # Errors
    ///
    /// Returns provisioning or runtime installation failures. Nothing is
    /// cached on failure, so the next call retries.
    pub async fn prepare(&self) -> Result<Readiness> {
        let mut ready = self.init_lock.lock().await;
        let provision = self.provisioner.provision().await?;
        let runtime = match (&provision, ready.as_ref()) {
            (ProvisionOutcome::AlreadyProvisioned, Some(status)) => status.clone(),
            _ => self.runtime.ensure_runtime().await?,
        };
        *ready = Some(runtime.clone());
        Ok(Readiness { provision, runtime })
    }

    /// Forget the cached runtime status and delete the guest.
    ///
    /// # Errors
    ///
    /// Returns `FilesystemError::IoError` if the guest root cannot be removed.
    pub async fn reset(&self) -> Result<()> {
        let mut ready = self.init_lock.lock().await;
        *ready = None;
        self.provisioner.wipe().await
    }
}

impl EnvironmentGate for GuestEnvironment {
    fn ensure_ready(&self) -> EnsureReadyFuture<'_> {
        Box::pin(async move {
            let readiness = self.prepare().await?;
            if let RuntimeStatus::Degraded { current } = &readiness.runtime {
                tracing::debug!(current = ?current, "guest ready with degraded runtime");
            }
            Ok(())
        })
    }
}
