//! Worker-pool scheduler for the download queue.
//!
//! A fixed pool of workers pulls jobs from the store, runs them against the
//! fetch adapter and the commit stage, and reports every state transition
//! over an event channel. The dispatcher task consumes events into the
//! history log and batch settlement; workers never touch batch counters
//! directly.
//!
//! Lane admission is weighted, not preemptive: every Nth claim prefers the
//! bulk lane, all others prefer interactive, and the non-preferred lane is
//! used as fallback. A running bulk job is never interrupted to admit an
//! interactive one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetcher::{FetchAdapter, MediaResult};
use super::library::LibraryIndex;
use super::models::{FetchError, Job, JobFailure, JobLane};
use super::orchestrator::SyncOrchestrator;
use super::queue_store::JobQueueStore;
use super::retry_policy::RetryPolicy;

/// State-transition message from a worker. Carries the job snapshot taken
/// right after the transition was persisted.
#[derive(Debug)]
pub struct JobEvent {
    pub job: Job,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Number of concurrent workers, i.e. the maximum number of downloads
    /// in flight at once.
    pub workers: usize,
    /// Idle poll interval; also paces retry promotion.
    pub poll_interval: Duration,
    /// Every Nth claim prefers the bulk lane (0 disables bulk preference).
    pub bulk_admission_interval: u64,
}

pub struct Scheduler {
    store: Arc<dyn JobQueueStore>,
    fetcher: Arc<dyn FetchAdapter>,
    library: Arc<LibraryIndex>,
    retry_policy: RetryPolicy,
    settings: SchedulerSettings,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    claim_counter: AtomicU64,
    /// Cancellation tokens for in-flight fetches, by job id.
    running: Mutex<HashMap<String, CancellationToken>>,
    event_tx: mpsc::Sender<JobEvent>,
}

impl Scheduler {
    /// Build the scheduler and spawn its tasks: the event dispatcher, the
    /// retry-promotion tick and the worker pool.
    pub fn spawn(
        store: Arc<dyn JobQueueStore>,
        fetcher: Arc<dyn FetchAdapter>,
        library: Arc<LibraryIndex>,
        orchestrator: Arc<SyncOrchestrator>,
        retry_policy: RetryPolicy,
        settings: SchedulerSettings,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (event_tx, event_rx) = mpsc::channel(256);

        let scheduler = Arc::new(Self {
            store,
            fetcher,
            library,
            retry_policy,
            settings: settings.clone(),
            wake,
            shutdown,
            claim_counter: AtomicU64::new(0),
            running: Mutex::new(HashMap::new()),
            event_tx,
        });

        let mut handles = Vec::with_capacity(settings.workers + 2);
        handles.push(tokio::spawn(Self::dispatch_events(
            orchestrator,
            event_rx,
        )));
        handles.push(tokio::spawn(scheduler.clone().run_retry_tick()));
        for worker_id in 0..settings.workers {
            handles.push(tokio::spawn(scheduler.clone().run_worker(worker_id)));
        }

        info!(
            "Scheduler started with {} workers (bulk admission every {} claims)",
            settings.workers, settings.bulk_admission_interval
        );

        (scheduler, handles)
    }

    /// Cooperatively cancel a running job's fetch. Returns true if the job
    /// had an in-flight fetch to signal.
    pub fn cancel_running(&self, job_id: &str) -> bool {
        let running = self.running.lock().unwrap();
        match running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Event dispatcher: history is written and settlement tracked here, off
    /// the worker hot path, in transition order.
    async fn dispatch_events(
        orchestrator: Arc<SyncOrchestrator>,
        mut event_rx: mpsc::Receiver<JobEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            orchestrator.history().record_transition(&event.job);
            if event.job.state.is_terminal() {
                if let Err(e) = orchestrator.on_child_settled(&event.job).await {
                    error!(
                        "Failed to record settlement for job {}: {}",
                        event.job.id, e
                    );
                }
            }
        }
        debug!("Event dispatcher stopped");
    }

    /// Periodically promotes retry-waiting jobs whose backoff has elapsed.
    async fn run_retry_tick(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            match self.store.promote_retry_ready(chrono::Utc::now().timestamp()) {
                Ok(promoted) if !promoted.is_empty() => {
                    debug!("Promoted {} jobs from retry wait", promoted.len());
                    for job in &promoted {
                        self.send_event(job).await;
                    }
                    self.wake.notify_waiters();
                }
                Ok(_) => {}
                Err(e) => error!("Retry promotion failed: {}", e),
            }
        }
        debug!("Retry tick stopped");
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!("Worker {} started", worker_id);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let preferred = self.preferred_lane();
            match self.store.claim_next(preferred) {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("Worker {} failed to claim a job: {}", worker_id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    fn preferred_lane(&self) -> JobLane {
        let n = self.claim_counter.fetch_add(1, Ordering::Relaxed);
        lane_for_claim(n, self.settings.bulk_admission_interval)
    }

    /// Execute one claimed job to its next state.
    async fn run_job(&self, job: Job) {
        debug!(
            "Running job {} (attempt {}/{}, source {})",
            job.id, job.attempt, job.max_attempts, job.source_ref
        );
        self.send_event(&job).await;

        let cancel = CancellationToken::new();
        self.running
            .lock()
            .unwrap()
            .insert(job.id.clone(), cancel.clone());

        let result = self.fetcher.fetch(&job.source_ref, &job.quality, &cancel).await;

        self.running.lock().unwrap().remove(&job.id);

        let updated = match result {
            Ok(media) => self.commit_media(&job, media).await,
            Err(fetch_error) => self.handle_fetch_error(&job, fetch_error),
        };

        match updated {
            Ok(updated_job) => self.send_event(&updated_job).await,
            Err(e) => error!("Failed to persist outcome of job {}: {}", job.id, e),
        }
    }

    /// Hand a fetched track to the commit stage and mark the job.
    async fn commit_media(&self, job: &Job, media: MediaResult) -> anyhow::Result<Job> {
        match self.library.commit(&media).await {
            Ok(outcome) => {
                let path = outcome.result_path().to_string_lossy().to_string();
                self.store.mark_succeeded(&job.id, &[path])
            }
            Err(organize_error) => {
                warn!("Organize failed for job {}: {}", job.id, organize_error);
                media.discard();
                self.store.mark_failed(&job.id, &organize_error.failure())
            }
        }
    }

    /// Apply the retry policy to a failed fetch.
    fn handle_fetch_error(&self, job: &Job, error: FetchError) -> anyhow::Result<Job> {
        let failure: JobFailure = error.failure();

        if self.retry_policy.should_retry(failure.kind, job.attempt) {
            let next_retry_at = self.retry_policy.next_retry_at(failure.kind, job.attempt);
            debug!(
                "Job {} attempt {} failed ({}), retrying at {}",
                job.id, job.attempt, failure.message, next_retry_at
            );
            self.store.mark_retry_waiting(&job.id, next_retry_at, &failure)
        } else {
            warn!(
                "Job {} failed permanently after {} attempts: {}",
                job.id, job.attempt, failure.message
            );
            self.store.mark_failed(&job.id, &failure)
        }
    }

    async fn send_event(&self, job: &Job) {
        if self
            .event_tx
            .send(JobEvent { job: job.clone() })
            .await
            .is_err()
        {
            error!("Event channel closed, dropping transition for job {}", job.id);
        }
    }
}

/// Weighted lane admission: every `interval`-th claim prefers the bulk lane
/// so a large sync keeps making progress without starving interactive
/// clicks. An interval of 0 disables bulk preference entirely.
fn lane_for_claim(claim_number: u64, interval: u64) -> JobLane {
    if interval == 0 {
        return JobLane::Interactive;
    }
    if claim_number % interval == interval - 1 {
        JobLane::Bulk
    } else {
        JobLane::Interactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_favors_interactive_with_periodic_bulk_slots() {
        let lanes: Vec<JobLane> = (0..8).map(|n| lane_for_claim(n, 4)).collect();
        assert_eq!(
            lanes,
            vec![
                JobLane::Interactive,
                JobLane::Interactive,
                JobLane::Interactive,
                JobLane::Bulk,
                JobLane::Interactive,
                JobLane::Interactive,
                JobLane::Interactive,
                JobLane::Bulk,
            ]
        );
    }

    #[test]
    fn zero_interval_never_prefers_bulk() {
        assert!((0..100).all(|n| lane_for_claim(n, 0) == JobLane::Interactive));
    }

    #[test]
    fn interval_of_one_always_prefers_bulk() {
        assert!((0..10).all(|n| lane_for_claim(n, 1) == JobLane::Bulk));
    }
}
