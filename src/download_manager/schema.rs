//! Database schema for tunedock.db.
//!
//! Defines versioned schema migrations for the job queue, batches, history
//! log and canonical library index.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema};

const DOWNLOAD_BATCHES_TABLE_V1: Table = Table {
    name: "download_batches",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("description", &SqlType::Text, non_null = true),
        sqlite_column!("expected_count", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "completed_count",
            &SqlType::Integer,
            default_value = Some("0")
        ),
        sqlite_column!("failed_count", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("settled_at", &SqlType::Integer),
    ],
    indices: &[("idx_batches_created", "created_at")],
};

const DOWNLOAD_JOBS_TABLE_V1: Table = Table {
    name: "download_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "batch_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "download_batches",
                foreign_column: "id",
            })
        ),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("lane", &SqlType::Integer, non_null = true),
        sqlite_column!("source_ref", &SqlType::Text, non_null = true),
        sqlite_column!("quality", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("attempt", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("title", &SqlType::Text),
        sqlite_column!("artist", &SqlType::Text),
        sqlite_column!("album", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("next_retry_at", &SqlType::Integer),
        sqlite_column!("failure_kind", &SqlType::Text),
        sqlite_column!("failure_message", &SqlType::Text),
        sqlite_column!("result_paths", &SqlType::Text, default_value = Some("'[]'")),
    ],
    indices: &[
        ("idx_jobs_state_lane", "state, lane, created_at"),
        ("idx_jobs_batch", "batch_id"),
        ("idx_jobs_next_retry", "next_retry_at"),
    ],
};

const JOB_HISTORY_TABLE_V1: Table = Table {
    name: "job_history",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("batch_id", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("attempt", &SqlType::Integer, non_null = true),
        sqlite_column!("failure_kind", &SqlType::Text),
        sqlite_column!("failure_message", &SqlType::Text),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_history_job", "job_id"),
        ("idx_history_batch", "batch_id"),
        ("idx_history_timestamp", "timestamp"),
    ],
};

const CANONICAL_LIBRARY_TABLE_V1: Table = Table {
    name: "canonical_library",
    columns: &[
        sqlite_column!("path", &SqlType::Text, is_primary_key = true),
        sqlite_column!("fingerprint", &SqlType::Text, non_null = true),
        sqlite_column!("artist_key", &SqlType::Text, non_null = true),
        sqlite_column!("title_key", &SqlType::Text, non_null = true),
        sqlite_column!("added_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_library_fingerprint", "fingerprint"),
        ("idx_library_key", "artist_key, title_key"),
    ],
};

pub const PIPELINE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        DOWNLOAD_BATCHES_TABLE_V1,
        DOWNLOAD_JOBS_TABLE_V1,
        JOB_HISTORY_TABLE_V1,
        CANONICAL_LIBRARY_TABLE_V1,
    ],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &PIPELINE_VERSIONED_SCHEMAS[0];
        schema.create(&conn).expect("schema should create");
        schema.validate(&conn).expect("schema should validate");
    }

    #[test]
    fn all_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        PIPELINE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"download_batches".to_string()));
        assert!(tables.contains(&"download_jobs".to_string()));
        assert!(tables.contains(&"job_history".to_string()));
        assert!(tables.contains(&"canonical_library".to_string()));
    }

    #[test]
    fn deleting_batch_cascades_to_jobs() {
        let conn = Connection::open_in_memory().unwrap();
        PIPELINE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        conn.execute(
            r#"INSERT INTO download_batches (id, kind, description, expected_count, created_at)
               VALUES ('b1', 'PLAYLIST', 'test', 1, 1700000000)"#,
            [],
        )
        .unwrap();
        conn.execute(
            r#"INSERT INTO download_jobs (
                id, batch_id, kind, lane, source_ref, quality, state, max_attempts,
                created_at, updated_at
            ) VALUES ('j1', 'b1', 'PLAYLIST', 1, 'yt:x', '{}', 'QUEUED', 3, 1700000000, 1700000000)"#,
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM download_batches WHERE id = 'b1'", [])
            .unwrap();

        let jobs: i32 = conn
            .query_row("SELECT COUNT(*) FROM download_jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(jobs, 0);
    }
}
