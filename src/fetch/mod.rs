//! The checksum & fetch primitive.
//!
//! Everything cachi2 downloads over HTTP goes through this module. The
//! contract:
//!
//! - registry URLs must be `https://`
//! - the body is streamed into a temporary file next to the final target,
//!   verified, fsync'd and atomically renamed into place; a partially
//!   written target path is never observable
//! - transient failures (DNS, connection reset, 5xx, 408, 429) are retried
//!   up to 5 attempts with exponential backoff and full jitter; other 4xx
//!   responses fail immediately
//! - [`fetch_many`] bounds in-flight downloads and fails fast: the first
//!   hard failure aborts the remaining downloads and their partial files
//!   are removed

use crate::checksum::{ChecksumInfo, must_match_any_checksum};
use crate::core::{Cachi2Error, Config};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

/// Base delay of the retry schedule.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// Cap on a single retry delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(32);
/// Total number of attempts (1 initial + 4 retries).
const RETRY_ATTEMPTS: usize = 5;

/// A pending download.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The https URL to download.
    pub url: String,
    /// Expected checksums. May be empty when the lockfile declares none; the
    /// caller is then responsible for attaching a `missing_hash` property to
    /// the resulting SBOM component.
    pub checksums: Vec<ChecksumInfo>,
    /// Absolute destination path, already confined by the caller.
    pub target: PathBuf,
}

impl Artifact {
    pub fn new(url: impl Into<String>, checksums: Vec<ChecksumInfo>, target: PathBuf) -> Self {
        Self {
            url: url.into(),
            checksums,
            target,
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    /// Worth retrying: network-level failure or a retryable status.
    Transient(String),
    /// Not worth retrying.
    Fatal(Cachi2Error),
}

impl AttemptError {
    fn into_error(self, url: &str) -> Cachi2Error {
        match self {
            Self::Transient(details) => {
                Cachi2Error::FetchError(format!("could not download {url}: {details}"))
            }
            Self::Fatal(error) => error,
        }
    }
}

/// Build the shared HTTP client. One client per request owns the connection
/// pool.
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(config.request_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build the HTTP client")
}

/// Download a single artifact, verify it and move it into place.
pub async fn fetch_one(client: &reqwest::Client, config: &Config, artifact: &Artifact) -> Result<()> {
    if !artifact.url.starts_with("https://") {
        return Err(Cachi2Error::FetchError(format!(
            "refusing to download {}: only https is supported",
            artifact.url
        ))
        .into());
    }

    // 1s, 2s, 4s, 8s (capped at 32s), each multiplied by a random jitter
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(RETRY_BASE_DELAY.as_millis() as u64 / 2)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(RETRY_ATTEMPTS - 1);

    let attempt_and_verify = || async {
        download_attempt(client, artifact).await?;
        Ok(())
    };

    let result = tokio::time::timeout(
        config.total_timeout,
        RetryIf::spawn(strategy, attempt_and_verify, |error: &AttemptError| {
            if let AttemptError::Transient(details) = error {
                warn!("retrying {}: {details}", artifact.url);
                true
            } else {
                false
            }
        }),
    )
    .await
    .map_err(|_| {
        Cachi2Error::FetchError(format!(
            "downloading {} did not finish within {} seconds",
            artifact.url,
            config.total_timeout.as_secs()
        ))
    })?;

    result.map_err(|e| e.into_error(&artifact.url))?;
    debug!("download completed - {}", artifact.url);
    Ok(())
}

async fn download_attempt(client: &reqwest::Client, artifact: &Artifact) -> Result<(), AttemptError> {
    let response = client
        .get(&artifact.url)
        .send()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        if is_retryable_status(status) {
            return Err(AttemptError::Transient(format!("server responded {status}")));
        }
        return Err(AttemptError::Fatal(Cachi2Error::FetchError(format!(
            "could not download {}: server responded {status}",
            artifact.url
        ))));
    }

    let parent = artifact.target.parent().ok_or_else(|| {
        AttemptError::Fatal(Cachi2Error::FetchError(format!(
            "invalid download target: {}",
            artifact.target.display()
        )))
    })?;
    std::fs::create_dir_all(parent).map_err(|e| AttemptError::Fatal(e.into()))?;

    // Colocate the temp file with the target so the final rename is atomic.
    // Dropping it (on any failure) removes the partial download.
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| AttemptError::Fatal(e.into()))?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| AttemptError::Transient(e.to_string()))?;
        temp.write_all(&chunk)
            .map_err(|e| AttemptError::Fatal(e.into()))?;
    }

    if !artifact.checksums.is_empty() {
        must_match_any_checksum(temp.path(), &artifact.checksums)
            .map_err(AttemptError::Fatal)?;
    }

    temp.as_file()
        .sync_all()
        .map_err(|e| AttemptError::Fatal(e.into()))?;
    temp.persist(&artifact.target)
        .map_err(|e| AttemptError::Fatal(e.error.into()))?;
    Ok(())
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Download many artifacts with bounded concurrency.
///
/// Completion order is not significant. The first failure cancels the
/// remaining downloads; their temporary files are cleaned up on drop.
pub async fn fetch_many(config: &Config, artifacts: &[Artifact]) -> Result<()> {
    if artifacts.is_empty() {
        return Ok(());
    }
    let client = build_client(config)?;
    debug!(
        "downloading {} artifacts, {} at a time",
        artifacts.len(),
        config.concurrency_limit
    );

    stream::iter(artifacts.iter().map(Ok::<&Artifact, anyhow::Error>))
        .try_for_each_concurrent(config.concurrency_limit, |artifact| {
            let client = client.clone();
            async move { fetch_one(&client, config, artifact).await }
        })
        .await
}
