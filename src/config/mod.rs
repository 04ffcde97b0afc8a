mod file_config;

pub use file_config::{FileConfig, PipelineConfig, ScanNotifierConfig};

use crate::download_manager::DuplicatePolicy;
use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution. Mirrors the CLI
/// arguments that a TOML config file may override.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub library_root: Option<PathBuf>,
    pub duplicates_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub port: u16,
    pub downloader_url: Option<String>,
    pub downloader_timeout_secs: u64,
    pub catalog_url: Option<String>,
    pub catalog_timeout_secs: u64,
    pub streaming_server_url: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            library_root: None,
            duplicates_dir: None,
            staging_dir: None,
            port: 3020,
            downloader_url: None,
            downloader_timeout_secs: 600,
            catalog_url: None,
            catalog_timeout_secs: 30,
            streaming_server_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    pub library_root: PathBuf,
    pub duplicates_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub port: u16,
    pub downloader_url: String,
    pub downloader_timeout_secs: u64,
    pub catalog_url: String,
    pub catalog_timeout_secs: u64,
    /// Optional: rescans are disabled when no streaming server is configured.
    pub streaming_server_url: Option<String>,

    // Feature configs (with defaults)
    pub pipeline: PipelineSettings,
    pub scan_notifier: ScanNotifierSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via CLI or in config file")
            })?;

        let library_root = file
            .library_root
            .map(PathBuf::from)
            .or_else(|| cli.library_root.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("library_root must be specified via CLI or in config file")
            })?;

        let duplicates_dir = file
            .duplicates_dir
            .map(PathBuf::from)
            .or_else(|| cli.duplicates_dir.clone())
            .unwrap_or_else(|| library_root.join("_duplicates"));

        let staging_dir = file
            .staging_dir
            .map(PathBuf::from)
            .or_else(|| cli.staging_dir.clone())
            .unwrap_or_else(|| {
                db_path
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("staging")
            });

        let port = file.port.unwrap_or(cli.port);

        let downloader_url = file
            .downloader_url
            .or_else(|| cli.downloader_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("downloader_url must be specified via CLI or in config file")
            })?;
        let downloader_timeout_secs = file
            .downloader_timeout_secs
            .unwrap_or(cli.downloader_timeout_secs);

        let catalog_url = file
            .catalog_url
            .or_else(|| cli.catalog_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("catalog_url must be specified via CLI or in config file")
            })?;
        let catalog_timeout_secs = file.catalog_timeout_secs.unwrap_or(cli.catalog_timeout_secs);

        let streaming_server_url = file
            .streaming_server_url
            .or_else(|| cli.streaming_server_url.clone());

        // Pipeline settings - merge file config with defaults
        let p_file = file.pipeline.unwrap_or_default();
        let duplicate_policy = match &p_file.duplicate_policy {
            Some(s) => match DuplicatePolicy::from_str(s) {
                Some(policy) => policy,
                None => bail!("Invalid duplicate_policy: {} (expected \"skip\" or \"move-to-duplicates\")", s),
            },
            None => DuplicatePolicy::default(),
        };
        let pipeline = PipelineSettings {
            workers: p_file.workers.unwrap_or(3),
            poll_interval_secs: p_file.poll_interval_secs.unwrap_or(5),
            bulk_admission_interval: p_file.bulk_admission_interval.unwrap_or(4),
            max_attempts: p_file.max_attempts.unwrap_or(3),
            initial_backoff_secs: p_file.initial_backoff_secs.unwrap_or(5),
            max_backoff_secs: p_file.max_backoff_secs.unwrap_or(900),
            backoff_multiplier: p_file.backoff_multiplier.unwrap_or(2.0),
            rate_limit_min_backoff_secs: p_file.rate_limit_min_backoff_secs.unwrap_or(60),
            jitter_ratio: p_file.jitter_ratio.unwrap_or(0.2),
            duplicate_policy,
            job_retention_hours: p_file.job_retention_hours.unwrap_or(72),
            maintenance_interval_secs: p_file.maintenance_interval_secs.unwrap_or(3600),
        };

        let n_file = file.scan_notifier.unwrap_or_default();
        let scan_notifier = ScanNotifierSettings {
            debounce_secs: n_file.debounce_secs.unwrap_or(15),
            max_attempts: n_file.max_attempts.unwrap_or(3),
            retry_backoff_secs: n_file.retry_backoff_secs.unwrap_or(10),
        };

        Ok(Self {
            db_path,
            library_root,
            duplicates_dir,
            staging_dir,
            port,
            downloader_url,
            downloader_timeout_secs,
            catalog_url,
            catalog_timeout_secs,
            streaming_server_url,
            pipeline,
            scan_notifier,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Worker pool size (concurrent downloads).
    pub workers: usize,
    pub poll_interval_secs: u64,
    /// Every Nth claim prefers the bulk lane; 0 disables bulk preference.
    pub bulk_admission_interval: u64,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub rate_limit_min_backoff_secs: u64,
    pub jitter_ratio: f64,
    pub duplicate_policy: DuplicatePolicy,
    /// Terminal jobs older than this are pruned by the maintenance tick.
    pub job_retention_hours: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval_secs: 5,
            bulk_admission_interval: 4,
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 900,
            backoff_multiplier: 2.0,
            rate_limit_min_backoff_secs: 60,
            jitter_ratio: 0.2,
            duplicate_policy: DuplicatePolicy::Skip,
            job_retention_hours: 72,
            maintenance_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanNotifierSettings {
    /// Settlements within this window coalesce into one rescan call.
    pub debounce_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
}

impl Default for ScanNotifierSettings {
    fn default() -> Self {
        Self {
            debounce_secs: 15,
            max_attempts: 3,
            retry_backoff_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_cli() -> CliConfig {
        CliConfig {
            db_path: Some(PathBuf::from("/data/tunedock.db")),
            library_root: Some(PathBuf::from("/music")),
            downloader_url: Some("http://downloader:3002".to_string()),
            catalog_url: Some("http://catalog:3003".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_cli_only() {
        let config = AppConfig::resolve(&minimal_cli(), None).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/data/tunedock.db"));
        assert_eq!(config.library_root, PathBuf::from("/music"));
        assert_eq!(config.duplicates_dir, PathBuf::from("/music/_duplicates"));
        assert_eq!(config.staging_dir, PathBuf::from("/data/staging"));
        assert_eq!(config.port, 3020);
        assert_eq!(config.downloader_url, "http://downloader:3002");
        assert!(config.streaming_server_url.is_none());
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.duplicate_policy, DuplicatePolicy::Skip);
        assert_eq!(config.scan_notifier.debounce_secs, 15);
    }

    #[test]
    fn resolve_toml_overrides_cli() {
        let file_config = FileConfig {
            library_root: Some("/toml/music".to_string()),
            port: Some(4000),
            streaming_server_url: Some("http://navidrome:4533/api/scanner/scan".to_string()),
            pipeline: Some(PipelineConfig {
                workers: Some(8),
                duplicate_policy: Some("move-to-duplicates".to_string()),
                ..Default::default()
            }),
            scan_notifier: Some(ScanNotifierConfig {
                debounce_secs: Some(60),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&minimal_cli(), Some(file_config)).unwrap();

        assert_eq!(config.library_root, PathBuf::from("/toml/music"));
        assert_eq!(
            config.duplicates_dir,
            PathBuf::from("/toml/music/_duplicates")
        );
        assert_eq!(config.port, 4000);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(
            config.pipeline.duplicate_policy,
            DuplicatePolicy::MoveToDuplicates
        );
        assert_eq!(config.scan_notifier.debounce_secs, 60);
        assert!(config.streaming_server_url.is_some());
        // CLI value used when TOML doesn't specify
        assert_eq!(config.downloader_url, "http://downloader:3002");
    }

    #[test]
    fn resolve_missing_db_path_errors() {
        let cli = CliConfig {
            db_path: None,
            ..minimal_cli()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("db_path"));
    }

    #[test]
    fn resolve_missing_library_root_errors() {
        let cli = CliConfig {
            library_root: None,
            ..minimal_cli()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("library_root"));
    }

    #[test]
    fn resolve_missing_downloader_url_errors() {
        let cli = CliConfig {
            downloader_url: None,
            ..minimal_cli()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn resolve_invalid_duplicate_policy_errors() {
        let file_config = FileConfig {
            pipeline: Some(PipelineConfig {
                duplicate_policy: Some("keep-everything".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&minimal_cli(), Some(file_config));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid duplicate_policy"));
    }

    #[test]
    fn file_config_parses_from_toml() {
        let toml_str = r#"
            library_root = "/srv/music"
            port = 3099

            [pipeline]
            workers = 6
            max_attempts = 5

            [scan_notifier]
            debounce_secs = 30
        "#;
        let file: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.library_root.as_deref(), Some("/srv/music"));
        assert_eq!(file.port, Some(3099));
        assert_eq!(file.pipeline.as_ref().unwrap().workers, Some(6));
        assert_eq!(file.pipeline.as_ref().unwrap().max_attempts, Some(5));
        assert_eq!(file.scan_notifier.as_ref().unwrap().debounce_secs, Some(30));
    }
}
