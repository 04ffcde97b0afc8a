//! Fetch adapter over the external downloader service.
//!
//! A fetch either yields a staged media file plus extracted metadata, or a
//! typed `FetchError`. Unexpected failures from the service are coerced to
//! `FetchError::Unknown`; nothing uncategorized crosses this boundary.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::models::{FetchError, QualityPolicy, TrackMetadata};

/// Result of a successful fetch: a staged audio file plus extracted metadata.
#[derive(Debug)]
pub struct MediaResult {
    pub source_ref: String,
    /// Staged file in the staging directory; the commit stage moves it into
    /// the library, failure paths remove it.
    pub audio_path: PathBuf,
    pub bytes: u64,
    pub metadata: TrackMetadata,
    /// Cover art, if the source had any and the quality policy asked for it.
    pub art: Option<Vec<u8>>,
    /// File extension of the staged audio ("mp3").
    pub extension: String,
}

impl MediaResult {
    /// Remove the staged file. Safe to call if it was already moved.
    pub fn discard(&self) {
        let _ = std::fs::remove_file(&self.audio_path);
    }
}

/// Boundary contract for fetching one track's audio + metadata.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    async fn fetch(
        &self,
        source_ref: &str,
        quality: &QualityPolicy,
        cancel: &CancellationToken,
    ) -> Result<MediaResult, FetchError>;
}

/// HTTP implementation against the downloader service.
pub struct HttpFetchAdapter {
    client: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
}

impl HttpFetchAdapter {
    /// # Arguments
    /// * `base_url` - Base URL of the downloader service (e.g., "http://localhost:3002")
    /// * `timeout_secs` - Request timeout in seconds
    /// * `staging_dir` - Directory for staged audio files (must exist)
    pub fn new(
        base_url: String,
        timeout_secs: u64,
        staging_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            staging_dir,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_inner(
        &self,
        source_ref: &str,
        quality: &QualityPolicy,
    ) -> Result<MediaResult, FetchError> {
        let encoded_ref = urlencoding::encode(source_ref);

        // Track metadata first: a missing source fails fast and cheap.
        let meta_url = format!("{}/track/{}", self.base_url, encoded_ref);
        let response = self
            .client
            .get(&meta_url)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response, source_ref)?;
        let metadata: TrackMetadata = response
            .json()
            .await
            .map_err(|e| FetchError::Unknown(format!("invalid metadata response: {}", e)))?;

        // Audio payload
        let audio_url = format!(
            "{}/track/{}/audio?bitrate={}&codec={}",
            self.base_url, encoded_ref, quality.bitrate_kbps, quality.codec
        );
        let response = self
            .client
            .get(&audio_url)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response, source_ref)?;
        let audio = response.bytes().await.map_err(map_request_error)?;

        let staged = tempfile::Builder::new()
            .prefix("fetch-")
            .suffix(&format!(".{}", quality.codec))
            .tempfile_in(&self.staging_dir)
            .map_err(|e| FetchError::Unknown(format!("failed to stage download: {}", e)))?;
        let (mut file, temp_path) = staged.keep().map_err(|e| {
            FetchError::Unknown(format!("failed to persist staged download: {}", e))
        })?;
        file.write_all(&audio)
            .and_then(|_| file.flush())
            .map_err(|e| FetchError::Unknown(format!("failed to write staged download: {}", e)))?;

        // Cover art is best-effort; a missing image never fails the fetch.
        let art = if quality.embed_art {
            self.fetch_art(&encoded_ref).await
        } else {
            None
        };

        Ok(MediaResult {
            source_ref: source_ref.to_string(),
            audio_path: temp_path,
            bytes: audio.len() as u64,
            metadata,
            art,
            extension: quality.codec.clone(),
        })
    }

    async fn fetch_art(&self, encoded_ref: &str) -> Option<Vec<u8>> {
        let url = format!("{}/track/{}/art", self.base_url, encoded_ref);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                response.bytes().await.ok().map(|b| b.to_vec())
            }
            Ok(response) => {
                debug!("No art for {} (status {})", encoded_ref, response.status());
                None
            }
            Err(e) => {
                debug!("Art fetch failed for {}: {}", encoded_ref, e);
                None
            }
        }
    }
}

#[async_trait]
impl FetchAdapter for HttpFetchAdapter {
    async fn fetch(
        &self,
        source_ref: &str,
        quality: &QualityPolicy,
        cancel: &CancellationToken,
    ) -> Result<MediaResult, FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_inner(source_ref, quality) => result,
        }
    }
}

/// Map an HTTP status from the downloader service to the error taxonomy.
fn status_to_error(status: StatusCode, source_ref: &str) -> FetchError {
    match status.as_u16() {
        404 | 410 => FetchError::NotFound(source_ref.to_string()),
        429 => FetchError::RateLimited,
        408 | 502 | 503 | 504 => {
            FetchError::TransientNetwork(format!("downloader returned {}", status))
        }
        415 | 422 => FetchError::UnsupportedFormat(format!("downloader returned {}", status)),
        _ => FetchError::Unknown(format!("downloader returned {}", status)),
    }
}

fn check_status(
    response: reqwest::Response,
    source_ref: &str,
) -> Result<reqwest::Response, FetchError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_to_error(response.status(), source_ref))
    }
}

/// Coerce a transport-level failure into the taxonomy.
fn map_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() {
        FetchError::TransientNetwork(e.to_string())
    } else {
        FetchError::Unknown(e.to_string())
    }
}
