//! History logging and pipeline statistics.
//!
//! A thin layer over the store's append-only history log: every job state
//! transition is recorded, and the stats endpoint aggregates the log.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use super::models::{Job, JobState, PipelineStats};
use super::queue_store::JobQueueStore;

pub struct HistoryLogger {
    store: Arc<dyn JobQueueStore>,
}

impl HistoryLogger {
    pub fn new(store: Arc<dyn JobQueueStore>) -> Self {
        Self { store }
    }

    /// Record a state transition from a job snapshot. History failures are
    /// logged and swallowed; they must never fail the pipeline itself.
    pub fn record_transition(&self, job: &Job) {
        if let Err(e) = self.store.append_history(job) {
            warn!("Failed to append history for job {}: {}", job.id, e);
        }
    }

    /// Aggregate statistics for the stats endpoint.
    pub fn stats(&self) -> Result<PipelineStats> {
        let queue = self.store.queue_stats()?;

        let successful_downloads = self.store.count_history(JobState::Succeeded, None)?;
        let failed_downloads = self.store.count_history(JobState::Failed, None)?;
        let total_downloads = successful_downloads + failed_downloads;

        let today_start = chrono::Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let today_downloads = self
            .store
            .count_history(JobState::Succeeded, Some(today_start))?;

        let success_rate = if total_downloads > 0 {
            (successful_downloads as f64 / total_downloads as f64) * 100.0
        } else {
            0.0
        };

        Ok(PipelineStats {
            active_jobs: queue.queued + queue.running + queue.retry_waiting,
            failed_jobs: queue.failed,
            total_downloads,
            successful_downloads,
            success_rate,
            today_downloads,
        })
    }
}
