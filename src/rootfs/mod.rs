//! Guest filesystem provisioning.
//!
//! [`RootfsProvisioner`] materialises the guest root from the first bundled
//! image that extracts, or else from the first mirror whose download does. The root is
//! only ever replaced whole: a stale or partial root is deleted before
//! extraction, extraction happens in a sibling staging directory, and the
//! readiness marker is written last.

mod archive;
mod download;

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;

pub use archive::{ExtractSummary, extract_archive};
pub use download::{Downloader, FetchFuture, HttpDownloader};

use crate::config::GuestConfig;
use crate::error::{BotboxError, FilesystemError, ProvisionError, Result};

/// Name of the readiness marker at the guest root. Its content is the setup
/// version that produced the root.
pub const SETUP_MARKER: &str = ".botbox_setup";

/// Where the guest image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A bundled image on the host.
    Local(Utf8PathBuf),
    /// A mirror download (possibly served from the cache).
    Mirror(String),
}

/// Result of [`RootfsProvisioner::provision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The marker matched; nothing was touched.
    AlreadyProvisioned,
    /// A fresh root was extracted.
    Provisioned {
        /// The image the root was built from.
        source: ImageSource,
        /// Extraction counts.
        summary: ExtractSummary,
    },
}

/// Materialises and resets the guest filesystem.
pub struct RootfsProvisioner {
    config: GuestConfig,
    downloader: Arc<dyn Downloader>,
}

impl std::fmt::Debug for RootfsProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootfsProvisioner")
            .field("root", &self.config.root_dir)
            .finish_non_exhaustive()
    }
}

impl RootfsProvisioner {
    /// Create a provisioner for `config`.
    #[must_use]
    pub fn new(config: GuestConfig, downloader: Arc<dyn Downloader>) -> Self {
        Self { config, downloader }
    }

    /// Host path of the guest root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.config.root_dir
    }

    /// Whether the marker exists and records the configured setup version.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        guest_is_provisioned(&self.config)
    }

    /// Ensure the guest root exists at the configured setup version.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::NoImageAvailable` when no bundled image or
    /// mirror yields an archive that extracts, and `FilesystemError` for
    /// host I/O failures.
    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        if self.is_provisioned() {
            tracing::debug!(root = %self.config.root_dir, "guest already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        if self.config.root_dir.exists() {
            tracing::info!(root = %self.config.root_dir, "wiping stale guest root");
            self.wipe().await?;
        }

        for local in self.config.local_images.iter().filter(|path| path.is_file()) {
            match self.install(local).await {
                Ok(summary) => return Ok(self.provisioned(ImageSource::Local(local.clone()), summary)),
                Err(BotboxError::Provision(error @ ProvisionError::ExtractFailed { .. })) => {
                    tracing::warn!(image = %local, error = %error, "bundled image unusable; trying next source");
                }
                Err(error) => return Err(error),
            }
        }

        for (index, url) in self.config.mirrors.iter().enumerate() {
            let cached = self.config.cache_dir.join(cache_file_name(url, index));
            if let Some(summary) = self.install_from_mirror(url, &cached).await? {
                return Ok(self.provisioned(ImageSource::Mirror(url.clone()), summary));
            }
        }

        Err(ProvisionError::NoImageAvailable {
            attempts: self.config.local_images.len() + self.config.mirrors.len(),
        }
        .into())
    }

    fn provisioned(&self, source: ImageSource, summary: ExtractSummary) -> ProvisionOutcome {
        tracing::info!(
            root = %self.config.root_dir,
            ?source,
            extracted = summary.extracted,
            skipped = summary.skipped,
            "guest provisioned"
        );
        ProvisionOutcome::Provisioned { source, summary }
    }

    /// Extract `archive` into place on the blocking pool.
    async fn install(&self, archive: &Utf8Path) -> Result<ExtractSummary> {
        tracing::info!(archive = %archive, "extracting guest image");
        let config = self.config.clone();
        let archive_path = archive.to_owned();
        tokio::task::spawn_blocking(move || install_root(&config, &archive_path))
            .await
            .map_err(|error| join_failure(&self.config.root_dir, &error))?
    }

    /// Install from one mirror, preferring its cached download. An archive
    /// that does not extract is deleted from the cache; a cached copy is
    /// then fetched afresh once. Returns `None` when the mirror is unusable.
    async fn install_from_mirror(
        &self,
        url: &str,
        cached: &Utf8Path,
    ) -> Result<Option<ExtractSummary>> {
        let mut from_cache = cached.is_file();
        loop {
            if from_cache {
                tracing::debug!(url = %url, cache = %cached, "using cached guest image");
            } else {
                match self.downloader.fetch(url).await {
                    Ok(bytes) => store_download(&self.config.cache_dir, cached, &bytes)?,
                    Err(error) => {
                        tracing::warn!(url = %url, error = %error, "mirror failed; trying next");
                        return Ok(None);
                    }
                }
            }

            match self.install(cached).await {
                Ok(summary) => return Ok(Some(summary)),
                Err(BotboxError::Provision(error @ ProvisionError::ExtractFailed { .. })) => {
                    tracing::warn!(url = %url, error = %error, "discarding unusable guest image");
                    discard_file(cached)?;
                }
                Err(error) => return Err(error),
            }

            if !from_cache {
                return Ok(None);
            }
            from_cache = false;
        }
    }
}

/// Cache file name for a mirror URL: its last path segment, or a positional
/// fallback.
fn cache_file_name(url: &str, index: usize) -> String {
    url.rsplit('/')
        .next()
        .map(|segment| segment.split(['?', '#']).next().unwrap_or_default())
        .filter(|segment| !segment.is_empty())
        .map_or_else(|| format!("rootfs-{index}.tar.gz"), str::to_owned)
}

/// Whether the guest root described by `config` carries a marker recording
/// its setup version. Reads the marker only; nothing is fetched.
#[must_use]
pub fn guest_is_provisioned(config: &GuestConfig) -> bool {
    read_marker(&config.root_dir).is_some_and(|version| version == config.setup_version)
}

fn read_marker(root: &Utf8Path) -> Option<u32> {
    let dir = Dir::open_ambient_dir(root, ambient_authority()).ok()?;
    dir.read_to_string(SETUP_MARKER).ok()?.trim().parse().ok()
}

fn join_failure(path: &Utf8Path, error: &tokio::task::JoinError) -> BotboxError {
    FilesystemError::IoError {
        path: path.as_std_path().to_path_buf(),
        message: format!("blocking task failed: {error}"),
    }
    .into()
}

/// Split `path` into an opened parent directory and its final component.
pub(crate) fn open_parent(path: &Utf8Path) -> io::Result<(Dir, String)> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no file name in '{path}'")))?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, name.to_owned()))
}

fn remove_tree(path: &Utf8Path) -> Result<()> {
    let (parent, name) = open_parent(path).map_err(|error| crate::error::io_failure(path, &error))?;
    match parent.remove_dir_all(&name) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(crate::error::io_failure(path, &error)),
    }
}

fn discard_file(path: &Utf8Path) -> Result<()> {
    let (dir, name) = open_parent(path).map_err(|error| crate::error::io_failure(path, &error))?;
    match dir.remove_file(&name) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(crate::error::io_failure(path, &error)),
    }
}

fn store_download(cache_dir: &Utf8Path, target: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let io_err = |error: io::Error| crate::error::io_failure(target, &error);
    Dir::create_ambient_dir_all(cache_dir, ambient_authority()).map_err(io_err)?;
    let (dir, name) = open_parent(target).map_err(io_err)?;
    let partial = format!("{name}.part");
    dir.write(&partial, bytes).map_err(io_err)?;
    dir.rename(&partial, &dir, &name).map_err(io_err)
}

/// Extract into a staging sibling, move it into place, then write the guest
/// network files and the marker.
fn install_root(config: &GuestConfig, archive_path: &Utf8Path) -> Result<ExtractSummary> {
    let root = &config.root_dir;
    let (parent, name) = open_parent(root).map_err(|error| crate::error::io_failure(root, &error))?;
    let staging = format!(".{name}.staging");
    let staging_path = root.with_file_name(&staging);

    match parent.remove_dir_all(&staging) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(crate::error::io_failure(&staging_path, &error)),
    }

    let extract_failed = |message: String| -> BotboxError {
        ProvisionError::ExtractFailed {
            archive: archive_path.as_std_path().to_path_buf(),
            message,
        }
        .into()
    };

    let summary = {
        parent
            .create_dir(&staging)
            .map_err(|error| crate::error::io_failure(&staging_path, &error))?;
        let staging_dir = parent
            .open_dir(&staging)
            .map_err(|error| crate::error::io_failure(&staging_path, &error))?;
        let (archive_parent, archive_name) =
            open_parent(archive_path).map_err(|error| extract_failed(error.to_string()))?;
        let file = archive_parent
            .open(&archive_name)
            .map_err(|error| extract_failed(error.to_string()))?;
        match extract_archive(file, &staging_dir, config.strip_components) {
            Ok(summary) => summary,
            Err(error) => {
                if let Err(cleanup) = parent.remove_dir_all(&staging) {
                    tracing::debug!(staging = %staging_path, error = %cleanup, "failed to remove staging directory");
                }
                return Err(extract_failed(error.to_string()));
            }
        }
    };

    parent
        .rename(&staging, &parent, &name)
        .map_err(|error| crate::error::io_failure(root, &error))?;

    let root_dir = parent
        .open_dir(&name)
        .map_err(|error| crate::error::io_failure(root, &error))?;
    write_guest_files(&root_dir, config).map_err(|error| crate::error::io_failure(root, &error))?;
    Ok(summary)
}

fn write_guest_files(root: &Dir, config: &GuestConfig) -> io::Result<()> {
    root.create_dir_all("etc")?;

    let resolv: String = config
        .nameservers
        .iter()
        .map(|server| format!("nameserver {server}\n"))
        .collect();
    // An extracted symlink (e.g. to a host-managed file) must not be
    // followed out of the guest.
    for name in ["etc/resolv.conf", "etc/hosts"] {
        if root.symlink_metadata(name).is_ok_and(|meta| meta.file_type().is_symlink()) {
            root.remove_file(name)?;
        }
    }
    root.write("etc/resolv.conf", resolv)?;
    root.write(
        "etc/hosts",
        "127.0.0.1 localhost localhost.localdomain\n::1 localhost ip6-localhost ip6-loopback\n",
    )?;
    root.write(SETUP_MARKER, config.setup_version.to_string())
}
