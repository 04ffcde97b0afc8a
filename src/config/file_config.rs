use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub library_root: Option<String>,
    pub duplicates_dir: Option<String>,
    pub staging_dir: Option<String>,
    pub port: Option<u16>,
    pub downloader_url: Option<String>,
    pub downloader_timeout_secs: Option<u64>,
    pub catalog_url: Option<String>,
    pub catalog_timeout_secs: Option<u64>,
    pub streaming_server_url: Option<String>,

    // Feature configs
    pub pipeline: Option<PipelineConfig>,
    pub scan_notifier: Option<ScanNotifierConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub bulk_admission_interval: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub rate_limit_min_backoff_secs: Option<u64>,
    pub jitter_ratio: Option<f64>,
    /// "skip" or "move-to-duplicates"
    pub duplicate_policy: Option<String>,
    pub job_retention_hours: Option<u64>,
    pub maintenance_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ScanNotifierConfig {
    pub debounce_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
