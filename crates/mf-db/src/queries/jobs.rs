//! Job record operations.
//!
//! These functions touch the `jobs` table only; stage results live in
//! [`stage_results`](super::stage_results) and are stitched on by callers.

use mf_core::{Error, Job, JobId, JobState, Result};
use rusqlite::Connection;

use crate::models::{fmt_time, job_from_row, JOB_COLS};

fn report_json(job: &Job) -> Result<Option<String>> {
    job.report
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::database(e))
}

/// Insert a new job row.
pub fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, state, input_ref, input_format, pipeline_kind, retry_count,
             max_retries, final_output_ref, error_stage, error_message, report, created_at,
             started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            job.id.to_string(),
            job.state.as_str(),
            job.input_ref.to_string(),
            job.input_format.as_str(),
            job.pipeline_kind.as_str(),
            job.retry_count,
            job.max_retries,
            job.final_output_ref.as_ref().map(|r| r.to_string()),
            job.error.as_ref().map(|e| e.stage.as_str()),
            job.error.as_ref().map(|e| e.message.as_str()),
            report_json(job)?,
            fmt_time(&job.created_at),
            job.started_at.as_ref().map(fmt_time),
            job.finished_at.as_ref().map(fmt_time),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Get a job row by ID, without stage results.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1");
    let result = conn.query_row(&q, [id.to_string()], job_from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Write back every mutable column of `job`.
pub fn update_job(conn: &Connection, job: &Job) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET state = ?1, retry_count = ?2, max_retries = ?3,
                 final_output_ref = ?4, error_stage = ?5, error_message = ?6, report = ?7,
                 started_at = ?8, finished_at = ?9
             WHERE id = ?10",
            rusqlite::params![
                job.state.as_str(),
                job.retry_count,
                job.max_retries,
                job.final_output_ref.as_ref().map(|r| r.to_string()),
                job.error.as_ref().map(|e| e.stage.as_str()),
                job.error.as_ref().map(|e| e.message.as_str()),
                report_json(job)?,
                job.started_at.as_ref().map(fmt_time),
                job.finished_at.as_ref().map(fmt_time),
                job.id.to_string(),
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// List job rows, newest first, with optional state filter and pagination.
pub fn list_jobs(
    conn: &Connection,
    state: Option<JobState>,
    offset: i64,
    limit: i64,
) -> Result<Vec<Job>> {
    let (q, params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = if let Some(s) = state {
        (
            format!(
                "SELECT {JOB_COLS} FROM jobs WHERE state = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
            ),
            vec![
                Box::new(s.as_str().to_string()),
                Box::new(limit),
                Box::new(offset),
            ],
        )
    } else {
        (
            format!(
                "SELECT {JOB_COLS} FROM jobs
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ),
            vec![Box::new(limit), Box::new(offset)],
        )
    };

    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Count jobs per state.
pub fn count_by_state(conn: &Connection) -> Result<Vec<(JobState, i64)>> {
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    rows.into_iter()
        .map(|(s, n)| Ok((s.parse()?, n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use chrono::{Duration, Utc};
    use mf_core::{ArtifactRef, InputFormat, Report};

    fn new_job(ext: InputFormat) -> Job {
        Job::new(
            JobId::new(),
            ArtifactRef::new(format!("/data/in.{}", ext.extension())),
            ext,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn insert_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let job = new_job(InputFormat::ThreeMf);
        insert_job(&conn, &job).unwrap();

        let found = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(found.state, JobState::Pending);
        assert_eq!(found.input_format, InputFormat::ThreeMf);
        assert_eq!(found.pipeline_kind, job.pipeline_kind);
        assert_eq!(found.input_ref, job.input_ref);
    }

    #[test]
    fn get_missing_is_none() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        assert!(get_job(&conn, JobId::new()).unwrap().is_none());
    }

    #[test]
    fn update_round_trips_terminal_fields() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let mut job = new_job(InputFormat::Stl);
        insert_job(&conn, &job).unwrap();

        job.start(Utc::now()).unwrap();
        let report = Report {
            slicing_status: Some("SUCCESS".into()),
            ..Report::default()
        };
        job.succeed(ArtifactRef::new("/data/out.gcode"), report.clone(), Utc::now())
            .unwrap();
        assert!(update_job(&conn, &job).unwrap());

        let found = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(found.state, JobState::Succeeded);
        assert_eq!(found.final_output_ref, job.final_output_ref);
        assert_eq!(found.report, Some(report));
        assert!(found.error.is_none());
    }

    #[test]
    fn list_newest_first_with_filter() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        let mut old = new_job(InputFormat::Obj);
        old.created_at = Utc::now() - Duration::minutes(5);
        insert_job(&conn, &old).unwrap();

        let mut running = new_job(InputFormat::Glb);
        insert_job(&conn, &running).unwrap();
        running.start(Utc::now()).unwrap();
        update_job(&conn, &running).unwrap();

        let all = list_jobs(&conn, None, 0, 100).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, running.id);

        let pending = list_jobs(&conn, Some(JobState::Pending), 0, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, old.id);

        let page = list_jobs(&conn, None, 1, 1).unwrap();
        assert_eq!(page[0].id, old.id);
    }

    #[test]
    fn counts_by_state() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_job(&conn, &new_job(InputFormat::Obj)).unwrap();
        insert_job(&conn, &new_job(InputFormat::Stl)).unwrap();

        let counts = count_by_state(&conn).unwrap();
        assert_eq!(counts, vec![(JobState::Pending, 2)]);
    }
}
