//! SQLite-backed [`JobStore`].

use mf_core::store::{JobMutator, JobStore};
use mf_core::{Error, Job, JobId, JobState, Result};
use rusqlite::{Connection, TransactionBehavior};

use crate::pool::{get_conn, DbPool};
use crate::queries::{jobs, stage_results};

/// Job store over a pooled SQLite database.
///
/// `update` runs inside an `IMMEDIATE` transaction, so concurrent updates
/// to the same job serialize on the database write lock and a reader never
/// sees the job row and its stage results out of step.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DbPool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Number of jobs in each state.
    pub fn counts(&self) -> Result<Vec<(JobState, i64)>> {
        let conn = get_conn(&self.pool)?;
        jobs::count_by_state(&conn)
    }
}

fn load(conn: &Connection, id: JobId) -> Result<Job> {
    let mut job = jobs::get_job(conn, id)?.ok_or_else(|| Error::not_found("job", id))?;
    job.stage_results = stage_results::list_for_job(conn, id)?;
    Ok(job)
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: &Job) -> Result<()> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        jobs::insert_job(&tx, job)?;
        for (seq, result) in job.stage_results.iter().enumerate() {
            stage_results::insert_stage_result(&tx, job.id, seq, result)?;
        }
        tx.commit().map_err(|e| Error::database(e.to_string()))
    }

    fn get(&self, id: JobId) -> Result<Job> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        let job = load(&tx, id)?;
        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        Ok(job)
    }

    fn update(&self, id: JobId, mutator: JobMutator) -> Result<Job> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::database(e.to_string()))?;

        let before = load(&tx, id)?;
        let mut job = before.clone();
        mutator(&mut job)?;

        if job.id != id {
            return Err(Error::InvalidTransition(format!(
                "job {id} cannot change its id"
            )));
        }
        let kept = before.stage_results.len();
        if job.stage_results.len() < kept || job.stage_results[..kept] != before.stage_results[..]
        {
            return Err(Error::InvalidTransition(format!(
                "stage results of job {id} are append-only"
            )));
        }

        jobs::update_job(&tx, &job)?;
        for (seq, result) in job.stage_results.iter().enumerate().skip(kept) {
            stage_results::insert_stage_result(&tx, id, seq, result)?;
        }
        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        Ok(job)
    }

    fn list(&self, state: Option<JobState>, offset: i64, limit: i64) -> Result<Vec<Job>> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        let mut rows = jobs::list_jobs(&tx, state, offset, limit)?;
        for job in &mut rows {
            job.stage_results = stage_results::list_for_job(&tx, job.id)?;
        }
        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        Ok(rows)
    }
}
