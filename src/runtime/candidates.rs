//! Node.js release candidates discovered from checksum manifests.
//!
//! Every release channel publishes a `SHASUMS256.txt` listing archive digests.
//! Matching archives for the pinned major and guest architecture become
//! [`Candidate`]s, newest first within a channel, channels in trust order.

use std::cmp::Reverse;

use crate::config::{ReleaseChannelConfig, RuntimeConfig};
use crate::rootfs::Downloader;

/// Name of the checksum manifest inside a channel directory.
pub const MANIFEST_NAME: &str = "SHASUMS256.txt";

/// A downloadable Node.js archive with its published digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Channel the archive was listed in.
    pub channel: String,
    /// Archive file name, e.g. `node-v22.11.0-linux-arm64.tar.gz`.
    pub file_name: String,
    /// Full download URL.
    pub url: String,
    /// Lower-case hex SHA-256 from the manifest.
    pub sha256: String,
}

/// Node.js architecture label for the guest.
///
/// An explicit configuration value wins; otherwise the host architecture is
/// mapped to the label used in Node.js archive names.
#[must_use]
pub fn node_arch(configured: Option<&str>) -> String {
    if let Some(arch) = configured.map(str::trim).filter(|arch| !arch.is_empty()) {
        return String::from(arch);
    }
    let label = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "x64",
        "arm" => "armv7l",
        "powerpc64" => "ppc64le",
        other => other,
    };
    String::from(label)
}

fn channel_base(channel: &ReleaseChannelConfig, major: u32) -> String {
    channel
        .base_url
        .replace("{major}", &major.to_string())
        .trim_end_matches('/')
        .to_owned()
}

/// Manifest URL for `channel` and the pinned `major`.
#[must_use]
pub fn manifest_url(channel: &ReleaseChannelConfig, major: u32) -> String {
    format!("{}/{MANIFEST_NAME}", channel_base(channel, major))
}

/// Archive name suffix for `arch`, with `-musl` for musl channels.
fn archive_suffix(arch: &str, musl: bool) -> String {
    if musl {
        format!("-linux-{arch}-musl.tar.gz")
    } else {
        format!("-linux-{arch}.tar.gz")
    }
}

fn is_sha256(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Sort key ordering `22.11.0` above `22.9.1`; nightly suffixes break ties.
fn version_key(version: &str) -> (Vec<u32>, String) {
    let (numeric, suffix) = version.split_once('-').unwrap_or((version, ""));
    let parts = numeric
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect();
    (parts, String::from(suffix))
}

/// Extract matching `(file_name, sha256)` pairs from a manifest, newest
/// version first.
#[must_use]
pub fn parse_manifest(text: &str, major: u32, arch: &str, musl: bool) -> Vec<(String, String)> {
    let prefix = format!("node-v{major}.");
    let suffix = archive_suffix(arch, musl);

    let mut entries: Vec<(String, String, String)> = text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let digest = fields.next()?;
            let name = fields.next()?.trim_start_matches('*');
            let version = name.strip_prefix("node-v")?.strip_suffix(suffix.as_str())?;
            if !name.starts_with(&prefix) || !is_sha256(digest) || version.contains('/') {
                return None;
            }
            Some((
                String::from(version),
                String::from(name),
                digest.to_ascii_lowercase(),
            ))
        })
        .collect();

    entries.sort_by_key(|(version, _, _)| Reverse(version_key(version)));
    entries
        .into_iter()
        .map(|(_, name, digest)| (name, digest))
        .collect()
}

/// Fetch every channel's manifest and list candidates in trust order.
///
/// A channel whose manifest cannot be fetched is logged and skipped.
pub async fn collect_candidates(
    downloader: &dyn Downloader,
    config: &RuntimeConfig,
    arch: &str,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for channel in &config.node_channels {
        let url = manifest_url(channel, config.node_major);
        let body = match downloader.fetch(&url).await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(channel = %channel.name, error = %error, "skipping release channel");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&body);
        let base = channel_base(channel, config.node_major);
        let found = parse_manifest(&text, config.node_major, arch, channel.musl);
        tracing::debug!(channel = %channel.name, count = found.len(), "parsed release manifest");
        candidates.extend(found.into_iter().map(|(file_name, sha256)| Candidate {
            channel: channel.name.clone(),
            url: format!("{base}/{file_name}"),
            file_name,
            sha256,
        }));
    }
    candidates
}
