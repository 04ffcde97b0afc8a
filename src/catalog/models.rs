//! Models for the catalog service API responses.

use serde::{Deserialize, Serialize};

/// One searchable/downloadable item from the catalog.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CatalogItem {
    /// Reference handed to the fetch adapter (URL or catalog id).
    pub source_ref: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub art_url: Option<String>,
}

/// Search response envelope from the catalog service.
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<CatalogItem>,
}

/// Playlist resolution response: ordered items.
#[derive(Debug, Deserialize)]
pub struct PlaylistResponse {
    #[serde(default)]
    pub name: Option<String>,
    pub items: Vec<CatalogItem>,
}
