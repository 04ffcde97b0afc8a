//! Catalog service boundary: search and playlist/library resolution.

mod client;
mod models;

pub use client::{CatalogClient, HttpCatalogClient};
pub use models::CatalogItem;
