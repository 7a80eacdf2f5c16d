//! Append-only stage result log.

use mf_core::{Error, JobId, Result, StageResult};
use rusqlite::Connection;

use crate::models::{fmt_time, stage_result_from_row, STAGE_RESULT_COLS};

/// Append `result` at position `seq` of the job's log.
pub fn insert_stage_result(
    conn: &Connection,
    job_id: JobId,
    seq: usize,
    result: &StageResult,
) -> Result<()> {
    let output_refs =
        serde_json::to_string(&result.output_refs).map_err(|e| Error::database(e))?;
    let log = serde_json::to_string(&result.log).map_err(|e| Error::database(e))?;

    conn.execute(
        "INSERT INTO stage_results (job_id, seq, stage_name, attempt, status, failure_kind,
             message, output_refs, log, duration_ms, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            job_id.to_string(),
            seq as i64,
            result.stage_name,
            result.attempt,
            result.status.as_str(),
            result.failure.map(|k| k.as_str()),
            result.message,
            output_refs,
            log,
            result.duration.as_millis() as i64,
            fmt_time(&result.started_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// All results for a job in append order.
pub fn list_for_job(conn: &Connection, job_id: JobId) -> Result<Vec<StageResult>> {
    let q = format!(
        "SELECT {STAGE_RESULT_COLS} FROM stage_results WHERE job_id = ?1 ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([job_id.to_string()], stage_result_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
