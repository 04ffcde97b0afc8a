//! HTTP client for the catalog service (search + playlist resolution).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::models::{CatalogItem, PlaylistResponse, SearchResponse};

/// Read-only catalog operations the pipeline consumes. The catalog service
/// itself (YouTube Music / Spotify plumbing) lives elsewhere; this is only
/// its boundary.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Free-text search over the catalog.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<CatalogItem>>;

    /// Resolve a playlist reference into its ordered items.
    async fn resolve_playlist(&self, playlist_ref: &str) -> Result<Vec<CatalogItem>>;

    /// Resolve a user library reference (e.g. liked tracks) into items.
    async fn resolve_liked(&self, library_ref: &str) -> Result<Vec<CatalogItem>>;
}

/// HTTP implementation against the catalog service.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    /// # Arguments
    /// * `base_url` - Base URL of the catalog service (e.g., "http://localhost:3003")
    /// * `timeout_secs` - Request timeout in seconds
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<CatalogItem>> {
        let url = format!(
            "{}/search?q={}&limit={}",
            self.base_url,
            urlencoding::encode(query),
            limit
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach catalog service")?;

        if !response.status().is_success() {
            anyhow::bail!("Catalog search failed with status: {}", response.status());
        }

        let body: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        Ok(body.results)
    }

    async fn resolve_playlist(&self, playlist_ref: &str) -> Result<Vec<CatalogItem>> {
        let url = format!(
            "{}/playlist/{}",
            self.base_url,
            urlencoding::encode(playlist_ref)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach catalog service")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Playlist resolution for {} failed with status: {}",
                playlist_ref,
                response.status()
            );
        }

        let body: PlaylistResponse = response
            .json()
            .await
            .context("Failed to parse playlist response")?;
        Ok(body.items)
    }

    async fn resolve_liked(&self, library_ref: &str) -> Result<Vec<CatalogItem>> {
        let url = format!(
            "{}/library/{}/liked",
            self.base_url,
            urlencoding::encode(library_ref)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach catalog service")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Liked-tracks resolution for {} failed with status: {}",
                library_ref,
                response.status()
            );
        }

        let body: PlaylistResponse = response
            .json()
            .await
            .context("Failed to parse liked-tracks response")?;
        Ok(body.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = HttpCatalogClient::new("http://localhost:3003/".to_string(), 30).unwrap();
        assert_eq!(client.base_url(), "http://localhost:3003");
    }
}
