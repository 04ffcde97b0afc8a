//! Data models for the download pipeline.
//!
//! Defines jobs, batches, track metadata, error taxonomy and stats types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    RetryWaiting,
    Succeeded, // terminal
    Failed,    // terminal
}

impl JobState {
    /// Returns true if this is a terminal state (Succeeded or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::RetryWaiting => "RETRY_WAITING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobState::Queued),
            "RUNNING" => Some(JobState::Running),
            "RETRY_WAITING" => Some(JobState::RetryWaiting),
            "SUCCEEDED" => Some(JobState::Succeeded),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Kind of the originating user request. Every queued unit of work is a
/// single track; the kind records where it came from and selects the lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    SingleTrack,
    Playlist,
    BulkSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SingleTrack => "SINGLE_TRACK",
            JobKind::Playlist => "PLAYLIST",
            JobKind::BulkSync => "BULK_SYNC",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SINGLE_TRACK" => Some(JobKind::SingleTrack),
            "PLAYLIST" => Some(JobKind::Playlist),
            "BULK_SYNC" => Some(JobKind::BulkSync),
            _ => None,
        }
    }

    /// Scheduling lane for jobs expanded from this kind of request.
    pub fn lane(&self) -> JobLane {
        match self {
            JobKind::SingleTrack => JobLane::Interactive,
            JobKind::Playlist => JobLane::Interactive,
            JobKind::BulkSync => JobLane::Bulk,
        }
    }
}

/// Scheduling lane. Interactive requests are favored by admission so a
/// user's click is not starved behind a large library sync.
/// Lower values = favored lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobLane {
    Interactive = 1,
    Bulk = 2,
}

impl JobLane {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(JobLane::Interactive),
            2 => Some(JobLane::Bulk),
            _ => None,
        }
    }
}

/// Failure classification recorded on jobs and history rows.
///
/// Fetch kinds follow the downloader boundary contract; organize kinds come
/// from the commit stage and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    // Fetch failures
    NotFound,         // source removed/private - NO retry
    RateLimited,      // retry with longer backoff
    TransientNetwork, // retry
    UnsupportedFormat, // NO retry
    Unknown,          // retry once, then surface
    // Organize failures (never retried)
    DiskFull,
    PermissionDenied,
    PathCollisionUnresolvable,
    Storage,
    // Orchestration / lifecycle
    UpstreamListResolution,
    Cancelled,
}

impl FailureKind {
    /// Returns true if the job queue should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::TransientNetwork | FailureKind::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::Unknown => "unknown",
            FailureKind::DiskFull => "disk_full",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::PathCollisionUnresolvable => "path_collision_unresolvable",
            FailureKind::Storage => "storage",
            FailureKind::UpstreamListResolution => "upstream_list_resolution",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_found" => Some(FailureKind::NotFound),
            "rate_limited" => Some(FailureKind::RateLimited),
            "transient_network" => Some(FailureKind::TransientNetwork),
            "unsupported_format" => Some(FailureKind::UnsupportedFormat),
            "unknown" => Some(FailureKind::Unknown),
            "disk_full" => Some(FailureKind::DiskFull),
            "permission_denied" => Some(FailureKind::PermissionDenied),
            "path_collision_unresolvable" => Some(FailureKind::PathCollisionUnresolvable),
            "storage" => Some(FailureKind::Storage),
            "upstream_list_resolution" => Some(FailureKind::UpstreamListResolution),
            "cancelled" => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

/// Typed failure of a fetch operation. The adapter never lets an
/// uncategorized failure past this boundary; anything unexpected from the
/// downloader service is coerced to `Unknown`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("rate limited by source service")]
    RateLimited,
    #[error("network failure: {0}")]
    TransientNetwork(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("downloader failure: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NotFound(_) => FailureKind::NotFound,
            FetchError::RateLimited => FailureKind::RateLimited,
            FetchError::TransientNetwork(_) => FailureKind::TransientNetwork,
            FetchError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            FetchError::Cancelled => FailureKind::Cancelled,
            FetchError::Unknown(_) => FailureKind::Unknown,
        }
    }

    pub fn failure(&self) -> JobFailure {
        JobFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Typed failure of the dedup/organize commit stage. Surfaced to the job as
/// `Failed` immediately; this layer never retries.
#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("disk full while writing {0:?}")]
    DiskFull(PathBuf),
    #[error("permission denied writing {0:?}")]
    PermissionDenied(PathBuf),
    #[error("unresolvable path collision at {0:?}")]
    PathCollisionUnresolvable(PathBuf),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl OrganizeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OrganizeError::DiskFull(_) => FailureKind::DiskFull,
            OrganizeError::PermissionDenied(_) => FailureKind::PermissionDenied,
            OrganizeError::PathCollisionUnresolvable(_) => FailureKind::PathCollisionUnresolvable,
            OrganizeError::Storage(_) => FailureKind::Storage,
        }
    }

    pub fn failure(&self) -> JobFailure {
        JobFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Failure of batch expansion. Aborts before any child jobs are created, so
/// there is never a partial batch with an unknown expected count.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("failed to resolve upstream item list: {0}")]
    UpstreamListResolution(String),
}

/// Last failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Desired audio quality for a fetch. The default mirrors what the source
/// service serves best: 320 kbps MP3 with embedded art.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPolicy {
    pub bitrate_kbps: u32,
    pub codec: String,
    pub embed_art: bool,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            bitrate_kbps: 320,
            codec: "mp3".to_string(),
            embed_art: true,
        }
    }
}

/// Metadata extracted by the fetch adapter. Immutable once attached to a
/// job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub source_id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default = "default_one")]
    pub track_number: u32,
    #[serde(default = "default_one")]
    pub disc_number: u32,
    #[serde(default = "default_one")]
    pub total_discs: u32,
    #[serde(default)]
    pub duration_secs: u32,
}

fn default_one() -> u32 {
    1
}

impl TrackMetadata {
    /// The artist used for the top-level library folder.
    pub fn album_artist_or_artist(&self) -> &str {
        self.album_artist.as_deref().unwrap_or(&self.artist)
    }
}

/// A download job: one unit of fetch-and-organize work for a single track.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Unique identifier (UUID)
    pub id: String,
    /// Batch this job belongs to
    pub batch_id: String,
    /// Kind of the originating request
    pub kind: JobKind,
    /// Scheduling lane
    pub lane: JobLane,
    /// Source reference (URL or catalog id) passed to the fetch adapter
    pub source_ref: String,
    /// Desired quality
    pub quality: QualityPolicy,
    /// Current state in the state machine
    pub state: JobState,
    /// Number of attempts started (incremented when a worker claims the job)
    pub attempt: u32,
    /// Retry ceiling
    pub max_attempts: u32,
    /// Display title (from the catalog, may differ from fetched metadata)
    pub title: Option<String>,
    /// Display artist
    pub artist: Option<String>,
    /// Display album
    pub album: Option<String>,
    /// When the job was created (Unix timestamp)
    pub created_at: i64,
    /// When the job last changed state
    pub updated_at: i64,
    /// When to re-enqueue (for RetryWaiting state)
    pub next_retry_at: Option<i64>,
    /// Last failure, if any
    pub failure: Option<JobFailure>,
    /// Filesystem paths produced; empty until success
    pub result_paths: Vec<String>,
}

impl Job {
    pub fn new(
        id: String,
        batch_id: String,
        kind: JobKind,
        source_ref: String,
        quality: QualityPolicy,
        max_attempts: u32,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            batch_id,
            kind,
            lane: kind.lane(),
            source_ref,
            quality,
            state: JobState::Queued,
            attempt: 0,
            max_attempts,
            title: None,
            artist: None,
            album: None,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            failure: None,
            result_paths: Vec::new(),
        }
    }

    /// Set display names for this job.
    pub fn with_display(
        mut self,
        title: Option<String>,
        artist: Option<String>,
        album: Option<String>,
    ) -> Self {
        self.title = title;
        self.artist = artist;
        self.album = album;
        self
    }
}

/// A batch groups jobs expanded from one user-level request.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub kind: JobKind,
    pub description: String,
    pub expected_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub created_at: i64,
    /// Set exactly once, by the settlement update that first observes
    /// completed + failed == expected.
    pub settled_at: Option<i64>,
}

impl Batch {
    pub fn new(id: String, kind: JobKind, description: String, expected_count: u32) -> Self {
        Self {
            id,
            kind,
            description,
            expected_count,
            completed_count: 0,
            failed_count: 0,
            created_at: chrono::Utc::now().timestamp(),
            settled_at: None,
        }
    }

    pub fn pending_count(&self) -> u32 {
        self.expected_count
            .saturating_sub(self.completed_count + self.failed_count)
    }

    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }

    /// Percentage of settled children (0-100).
    pub fn percentage(&self) -> u8 {
        if self.expected_count == 0 {
            return 0;
        }
        (((self.completed_count + self.failed_count) * 100) / self.expected_count) as u8
    }
}

/// One row of the append-only job history log.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub job_id: String,
    pub batch_id: String,
    pub state: JobState,
    pub attempt: u32,
    pub failure_kind: Option<FailureKind>,
    pub failure_message: Option<String>,
    pub timestamp: i64,
}

/// A recorded (path, fingerprint) for a file already committed to the
/// organized library tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalEntry {
    pub path: String,
    pub fingerprint: String,
    pub artist_key: String,
    pub title_key: String,
    pub added_at: i64,
}

/// Snapshot of the queue by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub retry_waiting: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Aggregate pipeline statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub active_jobs: usize,
    pub failed_jobs: usize,
    pub total_downloads: usize,
    pub successful_downloads: usize,
    pub success_rate: f64,
    pub today_downloads: usize,
}
