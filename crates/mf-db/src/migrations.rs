//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use mf_core::{Error, Result};
use rusqlite::Connection;

/// V1: jobs, their append-only stage results, and the task queue.
const V1_INITIAL: &str = r#"
CREATE TABLE jobs (
    id               TEXT PRIMARY KEY,
    state            TEXT NOT NULL DEFAULT 'pending',
    input_ref        TEXT NOT NULL,
    input_format     TEXT NOT NULL,
    pipeline_kind    TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 3,
    final_output_ref TEXT,
    error_stage      TEXT,
    error_message    TEXT,
    report           TEXT,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    finished_at      TEXT,
    CHECK (
        (state IN ('pending', 'running')
            AND final_output_ref IS NULL AND error_stage IS NULL)
        OR (state = 'succeeded'
            AND final_output_ref IS NOT NULL AND error_stage IS NULL)
        OR (state = 'failed'
            AND final_output_ref IS NULL AND error_stage IS NOT NULL)
    )
);

CREATE INDEX idx_jobs_state ON jobs(state);
CREATE INDEX idx_jobs_created ON jobs(created_at);

CREATE TABLE stage_results (
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    seq          INTEGER NOT NULL,
    stage_name   TEXT NOT NULL,
    attempt      INTEGER NOT NULL,
    status       TEXT NOT NULL,
    failure_kind TEXT,
    message      TEXT,
    output_refs  TEXT NOT NULL DEFAULT '[]',
    log          TEXT NOT NULL DEFAULT 'null',
    duration_ms  INTEGER NOT NULL DEFAULT 0,
    started_at   TEXT NOT NULL,
    PRIMARY KEY (job_id, seq),
    UNIQUE (job_id, stage_name, attempt)
);

CREATE TABLE task_queue (
    job_id           TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
    enqueued_at_ms   INTEGER NOT NULL,
    available_at_ms  INTEGER NOT NULL,
    leased_by        TEXT,
    lease_expires_ms INTEGER,
    deliveries       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_task_queue_available ON task_queue(available_at_ms);
"#;

/// Ordered list of (version, SQL) pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit()
            .map_err(|e| Error::database(e.to_string()))?;

        tracing::debug!("Applied migration V{version}");
    }

    Ok(())
}
