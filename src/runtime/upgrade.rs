//! Installing one Node.js candidate into the guest.
//!
//! The download is checked against its manifest digest, unpacked into a
//! staging directory, run once through the guest shell, and only then swapped
//! over the installed runtime. Any failure leaves the installed runtime as it
//! was.

use std::io::{self, Cursor};

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use sha2::{Digest, Sha256};

use super::candidates::Candidate;
use crate::error::{BotboxError, ProvisionError, Result, RuntimeError};
use crate::rootfs::{Downloader, extract_archive};
use crate::sandbox::GuestShell;

/// Installed runtime directory, relative to the guest root.
pub const NODE_INSTALL_DIR: &str = "usr/local/lib/nodejs";
const STAGING_DIR: &str = "usr/local/lib/.node-staging";
const PREVIOUS_DIR: &str = "usr/local/lib/.node-previous";
const SHIM_DIR: &str = "usr/local/bin";
const SHIMS: [&str; 4] = ["node", "npm", "npx", "corepack"];

fn io_err(guest_root: &Utf8Path, relative: &str) -> impl Fn(io::Error) -> BotboxError {
    let path = guest_root.join(relative);
    move |error| crate::error::io_failure(&path, &error)
}

fn join_err(guest_root: &Utf8Path) -> impl Fn(tokio::task::JoinError) -> BotboxError {
    let path = guest_root.to_owned();
    move |error| {
        crate::error::io_failure(
            &path,
            &io::Error::other(format!("blocking task failed: {error}")),
        )
    }
}

/// Download, verify and install `candidate`; returns the version the staged
/// binary reported.
///
/// # Errors
///
/// Returns the first failure: download, `ChecksumMismatch`, extraction,
/// `VerificationFailed`, or the filesystem swap.
pub async fn install_candidate(
    guest_root: &Utf8Path,
    candidate: &Candidate,
    major: u32,
    downloader: &dyn Downloader,
    shell: &dyn GuestShell,
) -> Result<String> {
    let bytes = downloader.fetch(&candidate.url).await?;

    let (bytes_checked, actual) = tokio::task::spawn_blocking(move || {
        let digest = hex::encode(Sha256::digest(&bytes));
        (bytes, digest)
    })
    .await
    .map_err(join_err(guest_root))?;
    if !actual.eq_ignore_ascii_case(&candidate.sha256) {
        return Err(RuntimeError::ChecksumMismatch {
            file_name: candidate.file_name.clone(),
            expected: candidate.sha256.clone(),
            actual,
        }
        .into());
    }

    let root = guest_root.to_owned();
    let archive_name = candidate.file_name.clone();
    tokio::task::spawn_blocking(move || stage(&root, &archive_name, bytes_checked))
        .await
        .map_err(join_err(guest_root))??;

    let version = match verify_staged(shell, candidate, major).await {
        Ok(version) => version,
        Err(error) => {
            discard_staging(guest_root);
            return Err(error);
        }
    };

    let root = guest_root.to_owned();
    tokio::task::spawn_blocking(move || swap_into_place(&root))
        .await
        .map_err(join_err(guest_root))??;

    Ok(version)
}

fn open_root(guest_root: &Utf8Path) -> Result<Dir> {
    Dir::open_ambient_dir(guest_root, ambient_authority()).map_err(io_err(guest_root, ""))
}

fn remove_if_present(root: &Dir, relative: &str) -> io::Result<()> {
    match root.remove_dir_all(relative) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

fn stage(guest_root: &Utf8Path, archive_name: &str, bytes: Vec<u8>) -> Result<()> {
    let root = open_root(guest_root)?;
    remove_if_present(&root, STAGING_DIR).map_err(io_err(guest_root, STAGING_DIR))?;
    root.create_dir_all(STAGING_DIR)
        .map_err(io_err(guest_root, STAGING_DIR))?;
    let staging = root
        .open_dir(STAGING_DIR)
        .map_err(io_err(guest_root, STAGING_DIR))?;

    let summary = extract_archive(Cursor::new(bytes), &staging, 1).map_err(|error| {
        BotboxError::from(ProvisionError::ExtractFailed {
            archive: archive_name.into(),
            message: error.to_string(),
        })
    })?;
    tracing::debug!(archive = %archive_name, extracted = summary.extracted, "staged runtime");
    Ok(())
}

async fn verify_staged(shell: &dyn GuestShell, candidate: &Candidate, major: u32) -> Result<String> {
    let failed = |message: String| -> BotboxError {
        RuntimeError::VerificationFailed {
            file_name: candidate.file_name.clone(),
            message,
        }
        .into()
    };

    let output = shell
        .run_guest_script(&format!("/{STAGING_DIR}/bin/node --version"))
        .await?;
    if !output.success() {
        return Err(failed(format!(
            "exit {:?}: {}",
            output.code,
            output.stderr.trim()
        )));
    }
    let version = output.stdout.trim();
    if !version.starts_with(&format!("v{major}.")) {
        return Err(failed(format!("reported '{version}', expected v{major}.x")));
    }
    Ok(String::from(version))
}

fn discard_staging(guest_root: &Utf8Path) {
    let result = open_root(guest_root).and_then(|root| {
        remove_if_present(&root, STAGING_DIR).map_err(io_err(guest_root, STAGING_DIR))
    });
    if let Err(error) = result {
        tracing::debug!(error = %error, "failed to discard staged runtime");
    }
}

/// Move the current install aside, move staging in, drop the old install,
/// then relink the shims.
fn swap_into_place(guest_root: &Utf8Path) -> Result<()> {
    let root = open_root(guest_root)?;
    remove_if_present(&root, PREVIOUS_DIR).map_err(io_err(guest_root, PREVIOUS_DIR))?;

    let had_previous = root.exists(NODE_INSTALL_DIR);
    if had_previous {
        root.rename(NODE_INSTALL_DIR, &root, PREVIOUS_DIR)
            .map_err(io_err(guest_root, NODE_INSTALL_DIR))?;
    }
    if let Err(error) = root.rename(STAGING_DIR, &root, NODE_INSTALL_DIR) {
        if had_previous {
            if let Err(restore) = root.rename(PREVIOUS_DIR, &root, NODE_INSTALL_DIR) {
                tracing::error!(error = %restore, "failed to restore previous runtime");
            }
        }
        return Err(crate::error::io_failure(guest_root.join(NODE_INSTALL_DIR), &error));
    }
    if let Err(error) = remove_if_present(&root, PREVIOUS_DIR) {
        tracing::debug!(error = %error, "failed to remove previous runtime");
    }

    relink_shims(&root).map_err(io_err(guest_root, SHIM_DIR))
}

fn relink_shims(root: &Dir) -> io::Result<()> {
    root.create_dir_all(SHIM_DIR)?;
    let bin = root.open_dir(SHIM_DIR)?;
    for shim in SHIMS {
        if !root.exists(format!("{NODE_INSTALL_DIR}/bin/{shim}")) {
            continue;
        }
        match bin.remove_file(shim) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(error),
            _ => {}
        }
        bin.symlink(format!("../lib/nodejs/bin/{shim}"), shim)?;
    }
    Ok(())
}
