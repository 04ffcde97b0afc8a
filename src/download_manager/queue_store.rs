//! Job queue storage and persistence.
//!
//! SQLite-backed storage for download jobs, batches, the append-only history
//! log and the canonical library index. The store exclusively owns job state
//! transitions; all mutations are guarded so a job can only move along the
//! legal state machine.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use super::models::*;
use super::schema::PIPELINE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;

/// Result of recording a settled child job on its batch.
#[derive(Debug, Clone)]
pub struct BatchSettlement {
    pub batch: Batch,
    /// True only for the call whose increment made the batch settle.
    pub just_settled: bool,
}

/// Trait for job queue storage operations.
pub trait JobQueueStore: Send + Sync {
    // === Queue Management ===

    /// Add a new job to the queue.
    fn enqueue(&self, job: &Job) -> Result<()>;

    /// Add a group of jobs in a single transaction.
    fn enqueue_all(&self, jobs: &[Job]) -> Result<()>;

    /// Get a job by ID.
    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Atomically claim the next queued job (Queued -> Running, attempt + 1).
    ///
    /// Jobs in the preferred lane are taken first, FIFO within a lane; falls
    /// back to the other lane when the preferred one is empty.
    fn claim_next(&self, preferred: JobLane) -> Result<Option<Job>>;

    /// List jobs with optional state filter, newest first.
    fn list_jobs(&self, state: Option<JobState>, limit: usize, offset: usize)
        -> Result<Vec<Job>>;

    /// All jobs belonging to a batch, in creation order.
    fn jobs_for_batch(&self, batch_id: &str) -> Result<Vec<Job>>;

    /// 1-based FIFO position among queued jobs of the same lane.
    fn queue_position(&self, id: &str) -> Result<Option<usize>>;

    // === State Transitions (atomic) ===

    /// Running -> Succeeded, recording produced paths.
    fn mark_succeeded(&self, id: &str, result_paths: &[String]) -> Result<Job>;

    /// Running -> Failed with the failure recorded.
    fn mark_failed(&self, id: &str, failure: &JobFailure) -> Result<Job>;

    /// Running -> RetryWaiting with the next retry time and failure recorded.
    fn mark_retry_waiting(&self, id: &str, next_retry_at: i64, failure: &JobFailure)
        -> Result<Job>;

    /// RetryWaiting -> Queued for every job whose retry time has passed.
    /// Returns the promoted jobs.
    fn promote_retry_ready(&self, now: i64) -> Result<Vec<Job>>;

    /// Queued -> Failed(Cancelled). Returns the cancelled job, or None if the
    /// job was not in Queued state.
    fn cancel_queued(&self, id: &str) -> Result<Option<Job>>;

    // === Batches ===

    fn create_batch(&self, batch: &Batch) -> Result<()>;
    fn get_batch(&self, id: &str) -> Result<Option<Batch>>;
    fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<Batch>>;

    /// Atomically count one settled child against the batch and detect
    /// settlement. The guarded update sets `settled_at` at most once, so
    /// exactly one caller ever observes `just_settled == true`.
    fn record_child_settled(&self, batch_id: &str, failed: bool) -> Result<BatchSettlement>;

    // === History (append-only) ===

    /// Append one history row from a job snapshot.
    fn append_history(&self, job: &Job) -> Result<()>;

    fn history_for_batch(&self, batch_id: &str) -> Result<Vec<HistoryEntry>>;
    fn history_for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>>;
    fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// History rows with timestamps in `[since, until)`, oldest first.
    fn history_in_range(&self, since: i64, until: i64, limit: usize)
        -> Result<Vec<HistoryEntry>>;

    /// Count history rows recording a transition into `state`, optionally
    /// bounded to timestamps >= `since`.
    fn count_history(&self, state: JobState, since: Option<i64>) -> Result<usize>;

    // === Stats & Maintenance ===

    fn queue_stats(&self) -> Result<QueueStats>;

    /// Requeue jobs left Running by a previous process. The interrupted
    /// attempt is not counted against the retry ceiling.
    fn reconcile_on_startup(&self) -> Result<usize>;

    /// Delete terminal jobs last updated before `older_than`. History rows
    /// are kept; they are the durable record.
    fn prune_terminal_jobs(&self, older_than: i64) -> Result<usize>;

    // === Canonical Library Index ===

    fn insert_canonical_entry(&self, entry: &CanonicalEntry) -> Result<()>;
    fn remove_canonical_entry(&self, path: &str) -> Result<bool>;
    fn load_canonical_entries(&self) -> Result<Vec<CanonicalEntry>>;
}

/// SQLite-backed job queue store.
pub struct SqliteJobQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobQueueStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open(&db_path)?
        } else {
            let conn = Connection::open(&db_path)?;
            PIPELINE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new pipeline database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Pipeline database version {} does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = PIPELINE_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Pipeline database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        PIPELINE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteJobQueueStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        PIPELINE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok(SqliteJobQueueStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = PIPELINE_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating pipeline database from version {} to {}",
            current_version, target_version
        );

        for schema in PIPELINE_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running pipeline migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let quality_json: String = row.get("quality")?;
        let result_paths_json: String = row.get("result_paths")?;
        let failure_kind: Option<String> = row.get("failure_kind")?;
        let failure_message: Option<String> = row.get("failure_message")?;

        let failure = match (failure_kind, failure_message) {
            (Some(kind), message) => FailureKind::from_str(&kind).map(|kind| JobFailure {
                kind,
                message: message.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Job {
            id: row.get("id")?,
            batch_id: row.get("batch_id")?,
            kind: JobKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(JobKind::SingleTrack),
            lane: JobLane::from_i32(row.get("lane")?).unwrap_or(JobLane::Interactive),
            source_ref: row.get("source_ref")?,
            quality: serde_json::from_str(&quality_json).unwrap_or_default(),
            state: JobState::from_db_str(&row.get::<_, String>("state")?)
                .unwrap_or(JobState::Failed),
            attempt: row.get::<_, i64>("attempt")? as u32,
            max_attempts: row.get::<_, i64>("max_attempts")? as u32,
            title: row.get("title")?,
            artist: row.get("artist")?,
            album: row.get("album")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            next_retry_at: row.get("next_retry_at")?,
            failure,
            result_paths: serde_json::from_str(&result_paths_json).unwrap_or_default(),
        })
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
        Ok(Batch {
            id: row.get("id")?,
            kind: JobKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(JobKind::SingleTrack),
            description: row.get("description")?,
            expected_count: row.get::<_, i64>("expected_count")? as u32,
            completed_count: row.get::<_, i64>("completed_count")? as u32,
            failed_count: row.get::<_, i64>("failed_count")? as u32,
            created_at: row.get("created_at")?,
            settled_at: row.get("settled_at")?,
        })
    }

    fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            batch_id: row.get("batch_id")?,
            state: JobState::from_db_str(&row.get::<_, String>("state")?)
                .unwrap_or(JobState::Failed),
            attempt: row.get::<_, i64>("attempt")? as u32,
            failure_kind: row
                .get::<_, Option<String>>("failure_kind")?
                .and_then(|s| FailureKind::from_str(&s)),
            failure_message: row.get("failure_message")?,
            timestamp: row.get("timestamp")?,
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CanonicalEntry> {
        Ok(CanonicalEntry {
            path: row.get("path")?,
            fingerprint: row.get("fingerprint")?,
            artist_key: row.get("artist_key")?,
            title_key: row.get("title_key")?,
            added_at: row.get("added_at")?,
        })
    }

    fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
        conn.execute(
            r#"INSERT INTO download_jobs (
                id, batch_id, kind, lane, source_ref, quality, state, attempt,
                max_attempts, title, artist, album, created_at, updated_at,
                next_retry_at, failure_kind, failure_message, result_paths
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18
            )"#,
            rusqlite::params![
                job.id,
                job.batch_id,
                job.kind.as_str(),
                job.lane.as_i32(),
                job.source_ref,
                serde_json::to_string(&job.quality)?,
                job.state.as_db_str(),
                job.attempt,
                job.max_attempts,
                job.title,
                job.artist,
                job.album,
                job.created_at,
                job.updated_at,
                job.next_retry_at,
                job.failure.as_ref().map(|f| f.kind.as_str()),
                job.failure.as_ref().map(|f| f.message.clone()),
                serde_json::to_string(&job.result_paths)?,
            ],
        )?;
        Ok(())
    }

    fn get_job_locked(conn: &Connection, id: &str) -> Result<Option<Job>> {
        let mut stmt = conn.prepare("SELECT * FROM download_jobs WHERE id = ?1")?;
        let job = stmt.query_row([id], Self::row_to_job).optional()?;
        Ok(job)
    }

    fn require_job_locked(conn: &Connection, id: &str) -> Result<Job> {
        Self::get_job_locked(conn, id)?.with_context(|| format!("Job not found: {}", id))
    }
}

impl JobQueueStore for SqliteJobQueueStore {
    // === Queue Management ===

    fn enqueue(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_job(&conn, job)
    }

    fn enqueue_all(&self, jobs: &[Job]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for job in jobs {
            Self::insert_job(&tx, job)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::get_job_locked(&conn, id)
    }

    fn claim_next(&self, preferred: JobLane) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();

        let id: Option<String> = conn
            .query_row(
                r#"SELECT id FROM download_jobs
                   WHERE state = 'QUEUED'
                   ORDER BY (lane != ?1), created_at ASC, rowid ASC
                   LIMIT 1"#,
                [preferred.as_i32()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        // The connection mutex is held across both statements, so the row
        // cannot change between the select and the update.
        let updated = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'RUNNING', attempt = attempt + 1, updated_at = ?2
               WHERE id = ?1 AND state = 'QUEUED'"#,
            rusqlite::params![id, Self::now()],
        )?;
        if updated != 1 {
            bail!("Claim race on job {}", id);
        }

        Ok(Some(Self::require_job_locked(&conn, &id)?))
    }

    fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();

        let (sql, params): (String, Vec<Box<dyn rusqlite::ToSql>>) = match state {
            Some(s) => (
                r#"SELECT * FROM download_jobs
                   WHERE state = ?1
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?2 OFFSET ?3"#
                    .to_string(),
                vec![
                    Box::new(s.as_db_str().to_string()),
                    Box::new(limit as i64),
                    Box::new(offset as i64),
                ],
            ),
            None => (
                r#"SELECT * FROM download_jobs
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?1 OFFSET ?2"#
                    .to_string(),
                vec![Box::new(limit as i64), Box::new(offset as i64)],
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    fn jobs_for_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM download_jobs WHERE batch_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let jobs = stmt
            .query_map([batch_id], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn queue_position(&self, id: &str) -> Result<Option<usize>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, i32, i64, i64)> = conn
            .query_row(
                "SELECT state, lane, created_at, rowid FROM download_jobs WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((state, lane, created_at, rowid)) if state == "QUEUED" => {
                let position: i64 = conn.query_row(
                    r#"SELECT COUNT(*) + 1 FROM download_jobs
                       WHERE state = 'QUEUED' AND lane = ?1
                       AND (created_at < ?2 OR (created_at = ?2 AND rowid < ?3))"#,
                    rusqlite::params![lane, created_at, rowid],
                    |row| row.get(0),
                )?;
                Ok(Some(position as usize))
            }
            _ => Ok(None),
        }
    }

    // === State Transitions ===

    fn mark_succeeded(&self, id: &str, result_paths: &[String]) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'SUCCEEDED', result_paths = ?2, updated_at = ?3,
                   next_retry_at = NULL
               WHERE id = ?1 AND state = 'RUNNING'"#,
            rusqlite::params![id, serde_json::to_string(result_paths)?, Self::now()],
        )?;
        if updated != 1 {
            bail!("Job {} is not RUNNING, cannot mark succeeded", id);
        }
        Self::require_job_locked(&conn, id)
    }

    fn mark_failed(&self, id: &str, failure: &JobFailure) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'FAILED', failure_kind = ?2, failure_message = ?3,
                   updated_at = ?4, next_retry_at = NULL
               WHERE id = ?1 AND state = 'RUNNING'"#,
            rusqlite::params![id, failure.kind.as_str(), failure.message, Self::now()],
        )?;
        if updated != 1 {
            bail!("Job {} is not RUNNING, cannot mark failed", id);
        }
        Self::require_job_locked(&conn, id)
    }

    fn mark_retry_waiting(
        &self,
        id: &str,
        next_retry_at: i64,
        failure: &JobFailure,
    ) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'RETRY_WAITING', next_retry_at = ?2, failure_kind = ?3,
                   failure_message = ?4, updated_at = ?5
               WHERE id = ?1 AND state = 'RUNNING'"#,
            rusqlite::params![
                id,
                next_retry_at,
                failure.kind.as_str(),
                failure.message,
                Self::now()
            ],
        )?;
        if updated != 1 {
            bail!("Job {} is not RUNNING, cannot mark retry-waiting", id);
        }
        Self::require_job_locked(&conn, id)
    }

    fn promote_retry_ready(&self, now: i64) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();

        let ids: Vec<String> = conn
            .prepare(
                r#"SELECT id FROM download_jobs
                   WHERE state = 'RETRY_WAITING' AND next_retry_at <= ?1
                   ORDER BY next_retry_at ASC"#,
            )?
            .query_map([now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut promoted = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                r#"UPDATE download_jobs
                   SET state = 'QUEUED', next_retry_at = NULL, updated_at = ?2
                   WHERE id = ?1 AND state = 'RETRY_WAITING'"#,
                rusqlite::params![id, Self::now()],
            )?;
            promoted.push(Self::require_job_locked(&conn, &id)?);
        }

        Ok(promoted)
    }

    fn cancel_queued(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'FAILED', failure_kind = ?2, failure_message = ?3,
                   updated_at = ?4
               WHERE id = ?1 AND state = 'QUEUED'"#,
            rusqlite::params![
                id,
                FailureKind::Cancelled.as_str(),
                "cancelled while queued",
                Self::now()
            ],
        )?;
        if updated != 1 {
            return Ok(None);
        }
        Ok(Some(Self::require_job_locked(&conn, id)?))
    }

    // === Batches ===

    fn create_batch(&self, batch: &Batch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO download_batches (
                id, kind, description, expected_count, completed_count,
                failed_count, created_at, settled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            rusqlite::params![
                batch.id,
                batch.kind.as_str(),
                batch.description,
                batch.expected_count,
                batch.completed_count,
                batch.failed_count,
                batch.created_at,
                batch.settled_at,
            ],
        )?;
        Ok(())
    }

    fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM download_batches WHERE id = ?1")?;
        let batch = stmt.query_row([id], Self::row_to_batch).optional()?;
        Ok(batch)
    }

    fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<Batch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM download_batches
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?1 OFFSET ?2"#,
        )?;
        let batches = stmt
            .query_map(rusqlite::params![limit as i64, offset as i64], Self::row_to_batch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    fn record_child_settled(&self, batch_id: &str, failed: bool) -> Result<BatchSettlement> {
        let conn = self.conn.lock().unwrap();

        let sql = if failed {
            "UPDATE download_batches SET failed_count = failed_count + 1 WHERE id = ?1"
        } else {
            "UPDATE download_batches SET completed_count = completed_count + 1 WHERE id = ?1"
        };
        let updated = conn.execute(sql, [batch_id])?;
        if updated != 1 {
            bail!("Batch not found: {}", batch_id);
        }

        // The guarded update fires for exactly one caller: the first one to
        // observe completed + failed == expected with settled_at still unset.
        let just_settled = conn.execute(
            r#"UPDATE download_batches
               SET settled_at = ?2
               WHERE id = ?1 AND settled_at IS NULL
               AND completed_count + failed_count >= expected_count"#,
            rusqlite::params![batch_id, Self::now()],
        )? == 1;

        let batch = conn
            .prepare("SELECT * FROM download_batches WHERE id = ?1")?
            .query_row([batch_id], Self::row_to_batch)?;

        Ok(BatchSettlement {
            batch,
            just_settled,
        })
    }

    // === History ===

    fn append_history(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO job_history (
                job_id, batch_id, state, attempt, failure_kind, failure_message, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            rusqlite::params![
                job.id,
                job.batch_id,
                job.state.as_db_str(),
                job.attempt,
                job.failure.as_ref().map(|f| f.kind.as_str()),
                job.failure.as_ref().map(|f| f.message.clone()),
                Self::now(),
            ],
        )?;
        Ok(())
    }

    fn history_for_batch(&self, batch_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM job_history WHERE batch_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([batch_id], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn history_for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM job_history WHERE job_id = ?1 ORDER BY id ASC")?;
        let entries = stmt
            .query_map([job_id], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM job_history ORDER BY id DESC LIMIT ?1")?;
        let entries = stmt
            .query_map([limit as i64], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn history_in_range(
        &self,
        since: i64,
        until: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM job_history
               WHERE timestamp >= ?1 AND timestamp < ?2
               ORDER BY id ASC
               LIMIT ?3"#,
        )?;
        let entries = stmt
            .query_map(
                rusqlite::params![since, until, limit as i64],
                Self::row_to_history,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn count_history(&self, state: JobState, since: Option<i64>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = match since {
            Some(since) => conn.query_row(
                "SELECT COUNT(*) FROM job_history WHERE state = ?1 AND timestamp >= ?2",
                rusqlite::params![state.as_db_str(), since],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM job_history WHERE state = ?1",
                [state.as_db_str()],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }

    // === Stats & Maintenance ===

    fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let mut stats = QueueStats::default();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM download_jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (state, count) = row?;
            match JobState::from_db_str(&state) {
                Some(JobState::Queued) => stats.queued = count,
                Some(JobState::Running) => stats.running = count,
                Some(JobState::RetryWaiting) => stats.retry_waiting = count,
                Some(JobState::Succeeded) => stats.succeeded = count,
                Some(JobState::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    fn reconcile_on_startup(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let requeued = conn.execute(
            r#"UPDATE download_jobs
               SET state = 'QUEUED',
                   attempt = CASE WHEN attempt > 0 THEN attempt - 1 ELSE 0 END,
                   updated_at = ?1
               WHERE state = 'RUNNING'"#,
            [Self::now()],
        )?;
        Ok(requeued)
    }

    fn prune_terminal_jobs(&self, older_than: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            r#"DELETE FROM download_jobs
               WHERE state IN ('SUCCEEDED', 'FAILED') AND updated_at < ?1"#,
            [older_than],
        )?;
        Ok(deleted)
    }

    // === Canonical Library Index ===

    fn insert_canonical_entry(&self, entry: &CanonicalEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO canonical_library (path, fingerprint, artist_key, title_key, added_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            rusqlite::params![
                entry.path,
                entry.fingerprint,
                entry.artist_key,
                entry.title_key,
                entry.added_at,
            ],
        )?;
        Ok(())
    }

    fn remove_canonical_entry(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM canonical_library WHERE path = ?1", [path])?;
        Ok(deleted == 1)
    }

    fn load_canonical_entries(&self) -> Result<Vec<CanonicalEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM canonical_library ORDER BY added_at ASC")?;
        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteJobQueueStore {
        SqliteJobQueueStore::in_memory().unwrap()
    }

    fn make_batch(id: &str, expected: u32) -> Batch {
        Batch::new(id.to_string(), JobKind::Playlist, "test batch".to_string(), expected)
    }

    fn make_job(id: &str, batch_id: &str, kind: JobKind) -> Job {
        Job::new(
            id.to_string(),
            batch_id.to_string(),
            kind,
            format!("yt:{}", id),
            QualityPolicy::default(),
            3,
        )
    }

    fn seed(store: &SqliteJobQueueStore, batch_id: &str, jobs: &[Job]) {
        store
            .create_batch(&make_batch(batch_id, jobs.len() as u32))
            .unwrap();
        store.enqueue_all(jobs).unwrap();
    }

    #[test]
    fn enqueue_and_get_roundtrip() {
        let store = store();
        let job = make_job("j1", "b1", JobKind::SingleTrack)
            .with_display(Some("Song".into()), Some("Artist".into()), None);
        store.create_batch(&make_batch("b1", 1)).unwrap();
        store.enqueue(&job).unwrap();

        let loaded = store.get_job("j1").unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.title.as_deref(), Some("Song"));
        assert_eq!(loaded.quality, QualityPolicy::default());
        assert!(loaded.result_paths.is_empty());
    }

    #[test]
    fn claim_increments_attempt_and_sets_running() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);

        let claimed = store.claim_next(JobLane::Interactive).unwrap().unwrap();
        assert_eq!(claimed.id, "j1");
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempt, 1);

        // Nothing else to claim
        assert!(store.claim_next(JobLane::Interactive).unwrap().is_none());
    }

    #[test]
    fn claim_is_fifo_within_lane() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("j1", "b1", JobKind::SingleTrack),
                make_job("j2", "b1", JobKind::SingleTrack),
            ],
        );

        assert_eq!(store.claim_next(JobLane::Interactive).unwrap().unwrap().id, "j1");
        assert_eq!(store.claim_next(JobLane::Interactive).unwrap().unwrap().id, "j2");
    }

    #[test]
    fn claim_prefers_requested_lane_with_fallback() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("bulk1", "b1", JobKind::BulkSync),
                make_job("int1", "b1", JobKind::SingleTrack),
            ],
        );

        // Interactive preferred: picks int1 even though bulk1 is older
        assert_eq!(
            store.claim_next(JobLane::Interactive).unwrap().unwrap().id,
            "int1"
        );
        // Interactive preferred again: lane empty, falls back to bulk
        assert_eq!(
            store.claim_next(JobLane::Interactive).unwrap().unwrap().id,
            "bulk1"
        );
    }

    #[test]
    fn bulk_preference_picks_bulk_first() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("int1", "b1", JobKind::SingleTrack),
                make_job("bulk1", "b1", JobKind::BulkSync),
            ],
        );
        assert_eq!(store.claim_next(JobLane::Bulk).unwrap().unwrap().id, "bulk1");
    }

    #[test]
    fn succeed_requires_running() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);

        assert!(store.mark_succeeded("j1", &["a".into()]).is_err());

        store.claim_next(JobLane::Interactive).unwrap().unwrap();
        let job = store
            .mark_succeeded("j1", &["/music/A/B/01 - T.mp3".to_string()])
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result_paths, vec!["/music/A/B/01 - T.mp3".to_string()]);
    }

    #[test]
    fn fail_records_failure() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);
        store.claim_next(JobLane::Interactive).unwrap().unwrap();

        let failure = JobFailure::new(FailureKind::NotFound, "gone");
        let job = store.mark_failed("j1", &failure).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure, Some(failure));
    }

    #[test]
    fn retry_waiting_then_promote() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);
        store.claim_next(JobLane::Interactive).unwrap().unwrap();

        let failure = JobFailure::new(FailureKind::TransientNetwork, "timeout");
        let now = chrono::Utc::now().timestamp();
        let job = store.mark_retry_waiting("j1", now - 1, &failure).unwrap();
        assert_eq!(job.state, JobState::RetryWaiting);
        assert_eq!(job.next_retry_at, Some(now - 1));

        let promoted = store.promote_retry_ready(now).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].state, JobState::Queued);
        assert!(promoted[0].next_retry_at.is_none());
        // Attempt count survives the round trip
        assert_eq!(promoted[0].attempt, 1);
    }

    #[test]
    fn promote_skips_future_retries() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);
        store.claim_next(JobLane::Interactive).unwrap().unwrap();

        let failure = JobFailure::new(FailureKind::RateLimited, "429");
        let now = chrono::Utc::now().timestamp();
        store.mark_retry_waiting("j1", now + 3600, &failure).unwrap();

        assert!(store.promote_retry_ready(now).unwrap().is_empty());
    }

    #[test]
    fn cancel_queued_only_cancels_queued() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("j1", "b1", JobKind::SingleTrack),
                make_job("j2", "b1", JobKind::SingleTrack),
            ],
        );

        let cancelled = store.cancel_queued("j1").unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Failed);
        assert_eq!(cancelled.failure.as_ref().unwrap().kind, FailureKind::Cancelled);

        store.claim_next(JobLane::Interactive).unwrap().unwrap();
        assert!(store.cancel_queued("j2").unwrap().is_none());
    }

    #[test]
    fn settlement_fires_exactly_once() {
        let store = store();
        store.create_batch(&make_batch("b1", 3)).unwrap();

        let s1 = store.record_child_settled("b1", false).unwrap();
        assert!(!s1.just_settled);
        let s2 = store.record_child_settled("b1", true).unwrap();
        assert!(!s2.just_settled);
        let s3 = store.record_child_settled("b1", false).unwrap();
        assert!(s3.just_settled);
        assert_eq!(s3.batch.completed_count, 2);
        assert_eq!(s3.batch.failed_count, 1);
        assert!(s3.batch.is_settled());
    }

    #[test]
    fn queue_position_is_per_lane() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("bulk1", "b1", JobKind::BulkSync),
                make_job("int1", "b1", JobKind::SingleTrack),
                make_job("int2", "b1", JobKind::SingleTrack),
            ],
        );

        // Interactive positions ignore the bulk job ahead of them
        assert_eq!(store.queue_position("int1").unwrap(), Some(1));
        assert_eq!(store.queue_position("int2").unwrap(), Some(2));
        assert_eq!(store.queue_position("bulk1").unwrap(), Some(1));

        store.claim_next(JobLane::Interactive).unwrap().unwrap();
        assert_eq!(store.queue_position("int1").unwrap(), None);
        assert_eq!(store.queue_position("int2").unwrap(), Some(1));
    }

    #[test]
    fn history_appends_and_counts() {
        let store = store();
        let job = make_job("j1", "b1", JobKind::SingleTrack);
        seed(&store, "b1", std::slice::from_ref(&job));

        store.append_history(&job).unwrap();
        let claimed = store.claim_next(JobLane::Interactive).unwrap().unwrap();
        store.append_history(&claimed).unwrap();
        let done = store.mark_succeeded("j1", &["p".into()]).unwrap();
        store.append_history(&done).unwrap();

        let history = store.history_for_job("j1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].state, JobState::Queued);
        assert_eq!(history[1].state, JobState::Running);
        assert_eq!(history[2].state, JobState::Succeeded);

        assert_eq!(store.count_history(JobState::Succeeded, None).unwrap(), 1);
        assert_eq!(store.count_history(JobState::Failed, None).unwrap(), 0);

        let batch_history = store.history_for_batch("b1").unwrap();
        assert_eq!(batch_history.len(), 3);

        // Time-range query: everything so far falls inside a window around now
        let now = chrono::Utc::now().timestamp();
        let in_range = store.history_in_range(now - 60, now + 60, 100).unwrap();
        assert_eq!(in_range.len(), 3);
        assert!(store.history_in_range(now + 60, now + 120, 100).unwrap().is_empty());
    }

    #[test]
    fn reconcile_requeues_running_without_consuming_attempt() {
        let store = store();
        seed(&store, "b1", &[make_job("j1", "b1", JobKind::SingleTrack)]);
        store.claim_next(JobLane::Interactive).unwrap().unwrap();

        let requeued = store.reconcile_on_startup().unwrap();
        assert_eq!(requeued, 1);

        let job = store.get_job("j1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);

        // Claim again: attempt goes back to 1, never past the ceiling
        let claimed = store.claim_next(JobLane::Interactive).unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
    }

    #[test]
    fn prune_removes_only_old_terminal_jobs() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("j1", "b1", JobKind::SingleTrack),
                make_job("j2", "b1", JobKind::SingleTrack),
            ],
        );
        store.claim_next(JobLane::Interactive).unwrap().unwrap();
        store.mark_succeeded("j1", &["p".into()]).unwrap();

        // Nothing newer than the cutoff in the future direction
        let future = chrono::Utc::now().timestamp() + 10;
        let pruned = store.prune_terminal_jobs(future).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_job("j1").unwrap().is_none());
        assert!(store.get_job("j2").unwrap().is_some());
    }

    #[test]
    fn queue_stats_counts_by_state() {
        let store = store();
        seed(
            &store,
            "b1",
            &[
                make_job("j1", "b1", JobKind::SingleTrack),
                make_job("j2", "b1", JobKind::SingleTrack),
                make_job("j3", "b1", JobKind::BulkSync),
            ],
        );
        store.claim_next(JobLane::Interactive).unwrap().unwrap();

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[test]
    fn canonical_entries_roundtrip() {
        let store = store();
        let entry = CanonicalEntry {
            path: "/music/A/B/01 - T.mp3".to_string(),
            fingerprint: "abc123".to_string(),
            artist_key: "a".to_string(),
            title_key: "t".to_string(),
            added_at: 1700000000,
        };
        store.insert_canonical_entry(&entry).unwrap();

        let loaded = store.load_canonical_entries().unwrap();
        assert_eq!(loaded, vec![entry.clone()]);

        assert!(store.remove_canonical_entry(&entry.path).unwrap());
        assert!(!store.remove_canonical_entry(&entry.path).unwrap());
        assert!(store.load_canonical_entries().unwrap().is_empty());
    }

    #[test]
    fn duplicate_canonical_path_is_rejected() {
        let store = store();
        let entry = CanonicalEntry {
            path: "/music/x.mp3".to_string(),
            fingerprint: "f1".to_string(),
            artist_key: "a".to_string(),
            title_key: "t".to_string(),
            added_at: 1700000000,
        };
        store.insert_canonical_entry(&entry).unwrap();
        assert!(store.insert_canonical_entry(&entry).is_err());
    }
}
