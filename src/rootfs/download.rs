//! HTTP downloads used by provisioning and runtime upgrades.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;

use crate::error::ProvisionError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Boxed future returned by [`Downloader`] implementors.
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, ProvisionError>> + Send + 'a>>;

/// Behaviour required to fetch a remote resource into memory.
///
/// Provisioning and the runtime upgrade depend on this seam so that tests can
/// serve archives and manifests without a network.
pub trait Downloader: Send + Sync {
    /// Fetch `url` and return the response body.
    fn fetch(&self, url: &str) -> FetchFuture<'_>;
}

/// [`Downloader`] backed by a `reqwest` client with connect and read
/// timeouts.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Build a downloader with a 20 s connect timeout and a 60 s read
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::DownloadFailed` if the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .user_agent(concat!("botbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| ProvisionError::DownloadFailed {
                url: String::new(),
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, url: &str) -> FetchFuture<'_> {
        let url_owned = String::from(url);

        Box::pin(async move {
            let failed = |message: String| ProvisionError::DownloadFailed {
                url: url_owned.clone(),
                message,
            };

            tracing::debug!(url = %url_owned, "downloading");
            let response = self
                .client
                .get(&url_owned)
                .send()
                .await
                .map_err(|error| failed(error.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(failed(format!("HTTP status {status}")));
            }

            let capacity = response
                .content_length()
                .and_then(|length| usize::try_from(length).ok())
                .map_or(0, |length| length.min(MAX_PREALLOCATION));
            let mut body = Vec::with_capacity(capacity);
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|error| failed(error.to_string()))?;
                body.extend_from_slice(&bytes);
            }

            tracing::debug!(url = %url_owned, bytes = body.len(), "download complete");
            Ok(body)
        })
    }
}
