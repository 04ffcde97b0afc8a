//! Sync orchestrator: expands user-level requests into batches of jobs and
//! tracks batch settlement.
//!
//! Expansion resolves the upstream item list first; if that fails, no batch
//! and no child jobs are created. Settlement is driven by the store's atomic
//! counter increments, so the notifier fires exactly once per batch no
//! matter how the children race.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::info;

use crate::catalog::{CatalogClient, CatalogItem};

use super::history::HistoryLogger;
use super::models::{Batch, Job, JobKind, OrchestrationError, QualityPolicy};
use super::queue_store::JobQueueStore;
use super::scan_notifier::ScanNotifier;

/// A user-level download request, before expansion.
#[derive(Debug, Clone)]
pub enum DownloadRequest {
    SingleTrack {
        source_ref: String,
        title: Option<String>,
        artist: Option<String>,
        album: Option<String>,
    },
    Playlist {
        playlist_ref: String,
        description: Option<String>,
    },
    BulkSync {
        library_ref: String,
        description: Option<String>,
    },
}

impl DownloadRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            DownloadRequest::SingleTrack { .. } => JobKind::SingleTrack,
            DownloadRequest::Playlist { .. } => JobKind::Playlist,
            DownloadRequest::BulkSync { .. } => JobKind::BulkSync,
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn JobQueueStore>,
    catalog: Arc<dyn CatalogClient>,
    history: Arc<HistoryLogger>,
    notifier: Arc<ScanNotifier>,
    /// Wakes idle workers after new jobs are enqueued.
    scheduler_wake: Arc<Notify>,
    quality: QualityPolicy,
    max_attempts: u32,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn JobQueueStore>,
        catalog: Arc<dyn CatalogClient>,
        history: Arc<HistoryLogger>,
        notifier: Arc<ScanNotifier>,
        scheduler_wake: Arc<Notify>,
        quality: QualityPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            catalog,
            history,
            notifier,
            scheduler_wake,
            quality,
            max_attempts,
        }
    }

    pub fn history(&self) -> &HistoryLogger {
        &self.history
    }

    /// Expand a request into a batch of queued jobs.
    ///
    /// The batch's expected count is fixed up front, before any job runs.
    /// Upstream resolution failures abort with `OrchestrationError` and leave
    /// no partial batch behind.
    pub async fn expand(&self, request: DownloadRequest) -> Result<Batch> {
        let kind = request.kind();
        let (description, items) = self.resolve_items(&request).await?;

        let batch = Batch::new(
            uuid::Uuid::new_v4().to_string(),
            kind,
            description,
            items.len() as u32,
        );

        let jobs: Vec<Job> = items
            .into_iter()
            .map(|item| {
                Job::new(
                    uuid::Uuid::new_v4().to_string(),
                    batch.id.clone(),
                    kind,
                    item.source_ref.clone(),
                    self.quality.clone(),
                    self.max_attempts,
                )
                .with_display(Some(item.title), Some(item.artist), item.album)
            })
            .collect();

        self.store.create_batch(&batch)?;
        self.store.enqueue_all(&jobs)?;
        for job in &jobs {
            self.history.record_transition(job);
        }

        info!(
            "Expanded {:?} request into batch {} ({} jobs)",
            kind,
            batch.id,
            batch.expected_count
        );

        self.scheduler_wake.notify_waiters();
        Ok(batch)
    }

    /// Record a terminal child job against its batch. The increment that
    /// settles the batch hands it to the scan notifier, exactly once.
    pub async fn on_child_settled(&self, job: &Job) -> Result<()> {
        let failed = job.state == super::models::JobState::Failed;
        let settlement = self.store.record_child_settled(&job.batch_id, failed)?;

        if settlement.just_settled {
            let batch = &settlement.batch;
            info!(
                "Batch {} settled: {} completed, {} failed of {}",
                batch.id, batch.completed_count, batch.failed_count, batch.expected_count
            );
            self.notifier.request_scan().await;
        }
        Ok(())
    }

    async fn resolve_items(
        &self,
        request: &DownloadRequest,
    ) -> Result<(String, Vec<CatalogItem>), OrchestrationError> {
        match request {
            DownloadRequest::SingleTrack {
                source_ref,
                title,
                artist,
                album,
            } => {
                let item = CatalogItem {
                    source_ref: source_ref.clone(),
                    title: title.clone().unwrap_or_else(|| source_ref.clone()),
                    artist: artist.clone().unwrap_or_default(),
                    album: album.clone(),
                    art_url: None,
                };
                let description = match (title, artist) {
                    (Some(t), Some(a)) => format!("{} - {}", a, t),
                    (Some(t), None) => t.clone(),
                    _ => source_ref.clone(),
                };
                Ok((description, vec![item]))
            }
            DownloadRequest::Playlist {
                playlist_ref,
                description,
            } => {
                let items = self
                    .catalog
                    .resolve_playlist(playlist_ref)
                    .await
                    .map_err(|e| OrchestrationError::UpstreamListResolution(e.to_string()))?;
                if items.is_empty() {
                    return Err(OrchestrationError::UpstreamListResolution(format!(
                        "playlist {} resolved to no items",
                        playlist_ref
                    )));
                }
                let description = description
                    .clone()
                    .unwrap_or_else(|| format!("playlist {}", playlist_ref));
                Ok((description, items))
            }
            DownloadRequest::BulkSync {
                library_ref,
                description,
            } => {
                let items = self
                    .catalog
                    .resolve_liked(library_ref)
                    .await
                    .map_err(|e| OrchestrationError::UpstreamListResolution(e.to_string()))?;
                if items.is_empty() {
                    return Err(OrchestrationError::UpstreamListResolution(format!(
                        "library {} resolved to no items",
                        library_ref
                    )));
                }
                let description = description
                    .clone()
                    .unwrap_or_else(|| format!("library sync {}", library_ref));
                Ok((description, items))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanNotifierSettings;
    use crate::download_manager::models::{JobLane, JobState};
    use crate::download_manager::queue_store::SqliteJobQueueStore;
    use crate::download_manager::scan_notifier::{NoOpScanTrigger, ScanTrigger};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FakeCatalog {
        items: Vec<CatalogItem>,
        fail: bool,
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<CatalogItem>> {
            Ok(self.items.clone())
        }

        async fn resolve_playlist(&self, _playlist_ref: &str) -> Result<Vec<CatalogItem>> {
            if self.fail {
                anyhow::bail!("upstream is down");
            }
            Ok(self.items.clone())
        }

        async fn resolve_liked(&self, _library_ref: &str) -> Result<Vec<CatalogItem>> {
            if self.fail {
                anyhow::bail!("upstream is down");
            }
            Ok(self.items.clone())
        }
    }

    fn item(source_ref: &str) -> CatalogItem {
        CatalogItem {
            source_ref: source_ref.to_string(),
            title: format!("Title {}", source_ref),
            artist: "Artist".to_string(),
            album: None,
            art_url: None,
        }
    }

    fn orchestrator(
        store: Arc<SqliteJobQueueStore>,
        catalog: FakeCatalog,
    ) -> (SyncOrchestrator, Arc<ScanNotifier>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let trigger: Arc<dyn ScanTrigger> = Arc::new(NoOpScanTrigger);
        let (notifier, _) = ScanNotifier::spawn(
            trigger,
            ScanNotifierSettings {
                debounce_secs: 0,
                max_attempts: 1,
                retry_backoff_secs: 0,
            },
            shutdown.clone(),
        );
        let history = Arc::new(HistoryLogger::new(store.clone()));
        let orch = SyncOrchestrator::new(
            store,
            Arc::new(catalog),
            history,
            notifier.clone(),
            Arc::new(Notify::new()),
            QualityPolicy::default(),
            3,
        );
        (orch, notifier, shutdown)
    }

    #[tokio::test]
    async fn single_track_expands_to_batch_of_one() {
        let store = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let (orch, _, shutdown) = orchestrator(
            store.clone(),
            FakeCatalog {
                items: vec![],
                fail: false,
            },
        );

        let batch = orch
            .expand(DownloadRequest::SingleTrack {
                source_ref: "yt:abc".to_string(),
                title: Some("Song".to_string()),
                artist: Some("Artist".to_string()),
                album: None,
            })
            .await
            .unwrap();

        assert_eq!(batch.expected_count, 1);
        assert_eq!(batch.description, "Artist - Song");

        let jobs = store.jobs_for_batch(&batch.id).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_ref, "yt:abc");
        assert_eq!(jobs[0].state, JobState::Queued);
        assert_eq!(jobs[0].lane, JobLane::Interactive);

        // Enqueue was recorded in history
        let history = store.history_for_batch(&batch.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Queued);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn playlist_expansion_creates_one_job_per_item() {
        let store = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let (orch, _, shutdown) = orchestrator(
            store.clone(),
            FakeCatalog {
                items: vec![item("a"), item("b"), item("c")],
                fail: false,
            },
        );

        let batch = orch
            .expand(DownloadRequest::Playlist {
                playlist_ref: "pl-1".to_string(),
                description: None,
            })
            .await
            .unwrap();

        assert_eq!(batch.expected_count, 3);
        assert_eq!(store.jobs_for_batch(&batch.id).unwrap().len(), 3);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_resolution_creates_no_batch() {
        let store = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let (orch, _, shutdown) = orchestrator(
            store.clone(),
            FakeCatalog {
                items: vec![],
                fail: true,
            },
        );

        let err = orch
            .expand(DownloadRequest::Playlist {
                playlist_ref: "pl-1".to_string(),
                description: None,
            })
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<OrchestrationError>().is_some());
        assert!(store.list_batches(10, 0).unwrap().is_empty());
        assert!(store.list_jobs(None, 10, 0).unwrap().is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_playlist_is_a_resolution_error() {
        let store = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let (orch, _, shutdown) = orchestrator(
            store.clone(),
            FakeCatalog {
                items: vec![],
                fail: false,
            },
        );

        let err = orch
            .expand(DownloadRequest::Playlist {
                playlist_ref: "pl-1".to_string(),
                description: None,
            })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<OrchestrationError>().is_some());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn bulk_sync_uses_bulk_lane() {
        let store = Arc::new(SqliteJobQueueStore::in_memory().unwrap());
        let (orch, _, shutdown) = orchestrator(
            store.clone(),
            FakeCatalog {
                items: vec![item("a"), item("b")],
                fail: false,
            },
        );

        let batch = orch
            .expand(DownloadRequest::BulkSync {
                library_ref: "me".to_string(),
                description: None,
            })
            .await
            .unwrap();

        for job in store.jobs_for_batch(&batch.id).unwrap() {
            assert_eq!(job.lane, JobLane::Bulk);
        }

        shutdown.cancel();
    }
}
