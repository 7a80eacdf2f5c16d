//! Row mapping between SQLite and the job model.
//!
//! Enums are stored in their `Display` form, timestamps as RFC 3339 text,
//! and structured fields (`output_refs`, `log`, `report`) as JSON text.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use mf_core::{ArtifactRef, Job, JobError, JobId, Report, StageResult};
use rusqlite::types::Type;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Parse a UUID-based ID from a text column.
pub(crate) fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e))?;
    Ok(T::from(uuid))
}

/// Parse an enum stored in its string form.
fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_opt_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|v| v.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parse_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

/// Format a timestamp for storage. Fixed precision keeps text ordering
/// consistent with time ordering.
pub(crate) fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Column list matching [`job_from_row`].
pub const JOB_COLS: &str = "id, state, input_ref, input_format, pipeline_kind, retry_count,
    max_retries, final_output_ref, error_stage, error_message, report, created_at,
    started_at, finished_at";

/// Build a [`Job`] from a row selected with [`JOB_COLS`]. Stage results are
/// loaded separately and left empty here.
pub fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let error_stage: Option<String> = row.get(8)?;
    let error_message: Option<String> = row.get(9)?;
    let report: Option<String> = row.get(10)?;
    let report = report
        .map(|s| serde_json::from_str::<Report>(&s).map_err(|e| conversion_error(10, e)))
        .transpose()?;

    Ok(Job {
        id: parse_id::<JobId>(row, 0)?,
        state: parse_enum(row, 1)?,
        input_ref: ArtifactRef::new(row.get::<_, String>(2)?),
        input_format: parse_enum(row, 3)?,
        pipeline_kind: parse_enum(row, 4)?,
        stage_results: Vec::new(),
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        final_output_ref: row.get::<_, Option<String>>(7)?.map(ArtifactRef::new),
        error: error_stage.map(|stage| JobError {
            stage,
            message: error_message.unwrap_or_default(),
        }),
        report,
        created_at: parse_time(row, 11)?,
        started_at: parse_opt_time(row, 12)?,
        finished_at: parse_opt_time(row, 13)?,
    })
}

// ---------------------------------------------------------------------------
// StageResult
// ---------------------------------------------------------------------------

/// Column list matching [`stage_result_from_row`].
pub const STAGE_RESULT_COLS: &str = "stage_name, attempt, status, failure_kind, message,
    output_refs, log, duration_ms, started_at";

pub fn stage_result_from_row(row: &rusqlite::Row) -> rusqlite::Result<StageResult> {
    let duration_ms: i64 = row.get(7)?;
    Ok(StageResult {
        stage_name: row.get(0)?,
        attempt: row.get(1)?,
        status: parse_enum(row, 2)?,
        failure: parse_opt_enum(row, 3)?,
        message: row.get(4)?,
        output_refs: parse_json(row, 5)?,
        log: parse_json(row, 6)?,
        duration: Duration::from_millis(duration_ms.max(0) as u64),
        started_at: parse_time(row, 8)?,
    })
}
