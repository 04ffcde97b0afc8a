//! Pipeline manager facade.
//!
//! Ties the orchestrator, scheduler, store, library and notifier together
//! behind one surface for the HTTP layer.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::info;

use crate::catalog::{CatalogClient, CatalogItem};

use super::history::HistoryLogger;
use super::library::{DuplicateReport, LibraryIndex};
use super::models::*;
use super::orchestrator::{DownloadRequest, SyncOrchestrator};
use super::queue_store::JobQueueStore;
use super::scan_notifier::ScanNotifier;
use super::scheduler::Scheduler;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// The job was still queued and is now failed/cancelled.
    Cancelled,
    /// The job is running; its fetch was signalled to abort and the job
    /// will settle as cancelled once the adapter acknowledges.
    CancelRequested,
    /// The job is already terminal.
    NotCancellable,
    NotFound,
}

pub struct PipelineManager {
    store: Arc<dyn JobQueueStore>,
    catalog: Arc<dyn CatalogClient>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Arc<Scheduler>,
    notifier: Arc<ScanNotifier>,
    history: Arc<HistoryLogger>,
    library: Arc<LibraryIndex>,
}

impl PipelineManager {
    pub fn new(
        store: Arc<dyn JobQueueStore>,
        catalog: Arc<dyn CatalogClient>,
        orchestrator: Arc<SyncOrchestrator>,
        scheduler: Arc<Scheduler>,
        notifier: Arc<ScanNotifier>,
        history: Arc<HistoryLogger>,
        library: Arc<LibraryIndex>,
    ) -> Self {
        Self {
            store,
            catalog,
            orchestrator,
            scheduler,
            notifier,
            history,
            library,
        }
    }

    // =========================================================================
    // Request Methods
    // =========================================================================

    /// Queue a single-track download.
    pub async fn request_track(
        &self,
        source_ref: String,
        title: Option<String>,
        artist: Option<String>,
        album: Option<String>,
    ) -> Result<Batch> {
        self.orchestrator
            .expand(DownloadRequest::SingleTrack {
                source_ref,
                title,
                artist,
                album,
            })
            .await
    }

    /// Queue a playlist download (resolved upstream first).
    pub async fn request_playlist(
        &self,
        playlist_ref: String,
        description: Option<String>,
    ) -> Result<Batch> {
        self.orchestrator
            .expand(DownloadRequest::Playlist {
                playlist_ref,
                description,
            })
            .await
    }

    /// Queue a bulk library sync (e.g. all liked tracks).
    pub async fn request_bulk_sync(
        &self,
        library_ref: String,
        description: Option<String>,
    ) -> Result<Batch> {
        self.orchestrator
            .expand(DownloadRequest::BulkSync {
                library_ref,
                description,
            })
            .await
    }

    /// Proxy a catalog search.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<CatalogItem>> {
        self.catalog.search(query, limit).await
    }

    // =========================================================================
    // Job Control
    // =========================================================================

    /// Cancel a job. Queued jobs cancel immediately; running jobs are
    /// signalled and settle once the in-flight fetch observes the signal.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        if let Some(cancelled) = self.store.cancel_queued(job_id)? {
            // Queued jobs never reach the worker event path, so history and
            // settlement are recorded here.
            self.history.record_transition(&cancelled);
            self.orchestrator.on_child_settled(&cancelled).await?;
            info!("Cancelled queued job {}", job_id);
            return Ok(CancelOutcome::Cancelled);
        }

        if self.scheduler.cancel_running(job_id) {
            info!("Requested cancellation of running job {}", job_id);
            return Ok(CancelOutcome::CancelRequested);
        }

        match self.store.get_job(job_id)? {
            Some(_) => Ok(CancelOutcome::NotCancellable),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Re-enqueue a failed job as a fresh job (new id, fresh batch). The
    /// failed record is left untouched.
    pub async fn retry_job(&self, job_id: &str) -> Result<Batch> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| anyhow!("Job not found: {}", job_id))?;

        if job.state != JobState::Failed {
            anyhow::bail!("Job {} is not failed, cannot retry", job_id);
        }

        let batch = self
            .orchestrator
            .expand(DownloadRequest::SingleTrack {
                source_ref: job.source_ref.clone(),
                title: job.title.clone(),
                artist: job.artist.clone(),
                album: job.album.clone(),
            })
            .await?;

        info!("Re-enqueued failed job {} as batch {}", job_id, batch.id);
        Ok(batch)
    }

    /// Manually trigger a library rescan.
    pub async fn trigger_rescan(&self) {
        self.notifier.request_scan().await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(id)
    }

    pub fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        self.store.list_jobs(state, limit, offset)
    }

    pub fn queue_position(&self, id: &str) -> Result<Option<usize>> {
        self.store.queue_position(id)
    }

    pub fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        self.store.get_batch(id)
    }

    pub fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<Batch>> {
        self.store.list_batches(limit, offset)
    }

    pub fn jobs_for_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        self.store.jobs_for_batch(batch_id)
    }

    pub fn history_for_batch(&self, batch_id: &str) -> Result<Vec<HistoryEntry>> {
        self.store.history_for_batch(batch_id)
    }

    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.store.recent_history(limit)
    }

    pub fn history_in_range(
        &self,
        since: i64,
        until: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.store.history_in_range(since, until, limit)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.store.queue_stats()
    }

    pub fn pipeline_stats(&self) -> Result<PipelineStats> {
        self.history.stats()
    }

    pub fn duplicate_report(&self) -> DuplicateReport {
        self.library.duplicate_report()
    }
}
