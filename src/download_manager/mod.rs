//! Background download/organization pipeline.
//!
//! A queue-based pipeline that fetches audio through the external downloader
//! service, deduplicates and organizes files into the canonical library
//! tree, tracks per-job history, and notifies the streaming server once per
//! settled batch.

mod fetcher;
mod history;
mod library;
mod manager;
mod models;
mod orchestrator;
mod organizer;
mod queue_store;
mod retry_policy;
mod scan_notifier;
mod schema;
mod scheduler;

pub use fetcher::{FetchAdapter, HttpFetchAdapter, MediaResult};
pub use history::HistoryLogger;
pub use library::{CommitOutcome, DuplicatePolicy, DuplicateReport, LibraryIndex};
pub use manager::{CancelOutcome, PipelineManager};
pub use models::*;
pub use orchestrator::{DownloadRequest, SyncOrchestrator};
pub use organizer::{canonical_path, collision_suffix, disambiguate, sanitize_segment};
pub use queue_store::{BatchSettlement, JobQueueStore, SqliteJobQueueStore};
pub use retry_policy::RetryPolicy;
pub use scan_notifier::{HttpScanTrigger, NoOpScanTrigger, ScanNotifier, ScanTrigger};
pub use schema::PIPELINE_VERSIONED_SCHEMAS;
pub use scheduler::{JobEvent, Scheduler, SchedulerSettings};
