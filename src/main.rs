use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunedock::catalog::HttpCatalogClient;
use tunedock::config::{AppConfig, CliConfig, FileConfig};
use tunedock::download_manager::{
    HistoryLogger, HttpFetchAdapter, HttpScanTrigger, JobQueueStore, LibraryIndex, NoOpScanTrigger,
    PipelineManager, QualityPolicy, RetryPolicy, ScanNotifier, ScanTrigger, Scheduler,
    SchedulerSettings, SqliteJobQueueStore, SyncOrchestrator,
};
use tunedock::server::run_server;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the SQLite pipeline database file.
    #[clap(value_parser = parse_path)]
    pub db_path: PathBuf,

    /// Root of the organized music library.
    #[clap(value_parser = parse_path)]
    pub library_root: PathBuf,

    /// Optional TOML config file; values there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory for duplicates kept under the move-to-duplicates policy.
    #[clap(long, value_parser = parse_path)]
    pub duplicates_dir: Option<PathBuf>,

    /// Directory for staged downloads before they are committed.
    #[clap(long, value_parser = parse_path)]
    pub staging_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3020)]
    pub port: u16,

    /// URL of the downloader service that fetches audio + metadata.
    #[clap(long)]
    pub downloader_url: Option<String>,

    /// Timeout in seconds for downloader requests.
    #[clap(long, default_value_t = 600)]
    pub downloader_timeout_secs: u64,

    /// URL of the catalog service (search + playlist resolution).
    #[clap(long)]
    pub catalog_url: Option<String>,

    /// Timeout in seconds for catalog requests.
    #[clap(long, default_value_t = 30)]
    pub catalog_timeout_secs: u64,

    /// Rescan endpoint of the streaming server (e.g. Navidrome's scanner
    /// API). Rescan notifications are disabled when omitted.
    #[clap(long)]
    pub streaming_server_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_path: Some(cli_args.db_path),
        library_root: Some(cli_args.library_root),
        duplicates_dir: cli_args.duplicates_dir,
        staging_dir: cli_args.staging_dir,
        port: cli_args.port,
        downloader_url: cli_args.downloader_url,
        downloader_timeout_secs: cli_args.downloader_timeout_secs,
        catalog_url: cli_args.catalog_url,
        catalog_timeout_secs: cli_args.catalog_timeout_secs,
        streaming_server_url: cli_args.streaming_server_url,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.library_root).context("Failed to create library root")?;
    std::fs::create_dir_all(&config.staging_dir).context("Failed to create staging directory")?;

    info!("Opening pipeline database at {:?}...", config.db_path);
    let store: Arc<SqliteJobQueueStore> = Arc::new(SqliteJobQueueStore::new(&config.db_path)?);

    // Requeue jobs that were in flight when the previous process stopped.
    let requeued = store.reconcile_on_startup()?;
    if requeued > 0 {
        info!("Requeued {} jobs interrupted by the previous run", requeued);
    }

    let library = Arc::new(LibraryIndex::new(
        store.clone(),
        config.library_root.clone(),
        config.duplicates_dir.clone(),
        config.pipeline.duplicate_policy,
    )?);
    if library.entry_count() == 0 {
        info!("Empty library index, scanning {:?}...", config.library_root);
        library.bootstrap_from_disk()?;
    }

    let fetcher = Arc::new(HttpFetchAdapter::new(
        config.downloader_url.clone(),
        config.downloader_timeout_secs,
        config.staging_dir.clone(),
    )?);
    info!("Downloader service at {}", config.downloader_url);

    let catalog = Arc::new(HttpCatalogClient::new(
        config.catalog_url.clone(),
        config.catalog_timeout_secs,
    )?);
    info!("Catalog service at {}", config.catalog_url);

    let shutdown = CancellationToken::new();

    let scan_trigger: Arc<dyn ScanTrigger> = match &config.streaming_server_url {
        Some(url) => {
            info!("Streaming server rescan endpoint at {}", url);
            Arc::new(HttpScanTrigger::new(url.clone(), 30)?)
        }
        None => {
            warn!("No streaming server configured, rescan notifications disabled");
            Arc::new(NoOpScanTrigger)
        }
    };
    let (notifier, notifier_handle) = ScanNotifier::spawn(
        scan_trigger,
        config.scan_notifier.clone(),
        shutdown.clone(),
    );

    let history = Arc::new(HistoryLogger::new(store.clone()));
    let scheduler_wake = Arc::new(Notify::new());

    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        catalog.clone(),
        history.clone(),
        notifier.clone(),
        scheduler_wake.clone(),
        QualityPolicy::default(),
        config.pipeline.max_attempts,
    ));

    let (scheduler, mut pipeline_handles) = Scheduler::spawn(
        store.clone(),
        fetcher,
        library.clone(),
        orchestrator.clone(),
        RetryPolicy::new(&config.pipeline),
        SchedulerSettings {
            workers: config.pipeline.workers,
            poll_interval: Duration::from_secs(config.pipeline.poll_interval_secs),
            bulk_admission_interval: config.pipeline.bulk_admission_interval,
        },
        scheduler_wake,
        shutdown.clone(),
    );
    pipeline_handles.push(notifier_handle);

    // Periodic cleanup of old terminal jobs.
    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        let retention_secs = config.pipeline.job_retention_hours * 3600;
        let interval = Duration::from_secs(config.pipeline.maintenance_interval_secs);
        pipeline_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                let cutoff = chrono::Utc::now().timestamp() - retention_secs as i64;
                match store.prune_terminal_jobs(cutoff) {
                    Ok(0) => {}
                    Ok(pruned) => info!("Pruned {} old terminal jobs", pruned),
                    Err(e) => error!("Job pruning failed: {}", e),
                }
            }
        }));
    }

    let manager = Arc::new(PipelineManager::new(
        store,
        catalog,
        orchestrator,
        scheduler,
        notifier,
        history,
        library,
    ));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
        });
    }

    info!("Ready to serve at port {}!", config.port);
    run_server(manager, config.port, shutdown.clone()).await?;

    // Drain in-flight pipeline work before exiting.
    shutdown.cancel();
    let drain = futures::future::join_all(pipeline_handles);
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("Pipeline tasks did not drain within 30s");
    }
    info!("Shutdown complete");

    Ok(())
}
