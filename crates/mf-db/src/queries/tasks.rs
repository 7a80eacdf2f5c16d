//! Task queue table operations.
//!
//! Times are integer epoch milliseconds so that lease comparisons happen in
//! SQL. An entry is claimable when it is available and either unleased or
//! its lease has expired.

use mf_core::{Error, JobId, Result};
use rusqlite::Connection;

use crate::models::parse_id;

/// A claimed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub job_id: JobId,
    pub deliveries: u32,
}

/// Insert or reset the entry for `job_id`. An entry whose lease is still
/// live is left alone; its holder is working on it.
pub fn enqueue(conn: &Connection, job_id: JobId, now_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO task_queue (job_id, enqueued_at_ms, available_at_ms)
         VALUES (?1, ?2, ?2)
         ON CONFLICT(job_id) DO UPDATE SET
             available_at_ms = excluded.available_at_ms,
             leased_by = NULL,
             lease_expires_ms = NULL
         WHERE task_queue.leased_by IS NULL
            OR task_queue.lease_expires_ms <= excluded.available_at_ms",
        rusqlite::params![job_id.to_string(), now_ms],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Atomically lease the oldest claimable entry to `worker`.
pub fn claim_next(
    conn: &Connection,
    worker: &str,
    now_ms: i64,
    lease_ms: i64,
) -> Result<Option<ClaimedTask>> {
    let result = conn.query_row(
        "UPDATE task_queue
         SET leased_by = ?1, lease_expires_ms = ?2 + ?3, deliveries = deliveries + 1
         WHERE job_id = (
             SELECT job_id FROM task_queue
             WHERE available_at_ms <= ?2
               AND (leased_by IS NULL OR lease_expires_ms <= ?2)
             ORDER BY enqueued_at_ms ASC, rowid ASC LIMIT 1
         )
         RETURNING job_id, deliveries",
        rusqlite::params![worker, now_ms, lease_ms],
        |row| {
            Ok(ClaimedTask {
                job_id: parse_id(row, 0)?,
                deliveries: row.get(1)?,
            })
        },
    );
    match result {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Delete the entry if `worker` still holds its lease.
pub fn ack(conn: &Connection, job_id: JobId, worker: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM task_queue WHERE job_id = ?1 AND leased_by = ?2",
            rusqlite::params![job_id.to_string(), worker],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Push the lease deadline forward if `worker` still holds it.
pub fn touch(
    conn: &Connection,
    job_id: JobId,
    worker: &str,
    now_ms: i64,
    lease_ms: i64,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE task_queue SET lease_expires_ms = ?3 + ?4
             WHERE job_id = ?1 AND leased_by = ?2",
            rusqlite::params![job_id.to_string(), worker, now_ms, lease_ms],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Clear leases that expired at or before `now_ms`. Live leases are kept,
/// since another process may still be renewing them.
/// Returns the number of entries released.
pub fn release_expired(conn: &Connection, now_ms: i64) -> Result<usize> {
    conn.execute(
        "UPDATE task_queue SET leased_by = NULL, lease_expires_ms = NULL
         WHERE leased_by IS NOT NULL AND lease_expires_ms <= ?1",
        [now_ms],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Number of entries, leased or not.
pub fn count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use crate::queries::jobs::insert_job;
    use chrono::Utc;
    use mf_core::{ArtifactRef, InputFormat, Job};

    fn job(conn: &Connection) -> JobId {
        let job = Job::new(
            JobId::new(),
            ArtifactRef::new("/in.obj"),
            InputFormat::Obj,
            3,
            Utc::now(),
        );
        insert_job(conn, &job).unwrap();
        job.id
    }

    #[test]
    fn claim_is_fifo_and_exclusive() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        let b = job(&conn);
        enqueue(&conn, a, 100).unwrap();
        enqueue(&conn, b, 200).unwrap();

        let first = claim_next(&conn, "w1", 1_000, 500).unwrap().unwrap();
        assert_eq!(first.job_id, a);
        assert_eq!(first.deliveries, 1);

        let second = claim_next(&conn, "w2", 1_000, 500).unwrap().unwrap();
        assert_eq!(second.job_id, b);

        assert!(claim_next(&conn, "w3", 1_000, 500).unwrap().is_none());
        assert_eq!(count(&conn).unwrap(), 2);
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        enqueue(&conn, a, 0).unwrap();

        claim_next(&conn, "w1", 10, 100).unwrap().unwrap();
        assert!(claim_next(&conn, "w2", 50, 100).unwrap().is_none());

        let again = claim_next(&conn, "w2", 110, 100).unwrap().unwrap();
        assert_eq!(again.job_id, a);
        assert_eq!(again.deliveries, 2);

        // the original holder lost the lease, so its ack is a no-op
        assert!(!ack(&conn, a, "w1").unwrap());
        assert!(ack(&conn, a, "w2").unwrap());
        assert_eq!(count(&conn).unwrap(), 0);
    }

    #[test]
    fn touch_extends_lease() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        enqueue(&conn, a, 0).unwrap();
        claim_next(&conn, "w1", 0, 100).unwrap().unwrap();

        assert!(touch(&conn, a, "w1", 90, 100).unwrap());
        assert!(claim_next(&conn, "w2", 150, 100).unwrap().is_none());
        assert!(!touch(&conn, a, "w2", 150, 100).unwrap());
    }

    #[test]
    fn release_expired_keeps_live_leases() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        let b = job(&conn);
        enqueue(&conn, a, 0).unwrap();
        enqueue(&conn, b, 1).unwrap();
        claim_next(&conn, "w1", 0, 100).unwrap().unwrap();
        claim_next(&conn, "w1", 0, 10_000).unwrap().unwrap();

        assert_eq!(release_expired(&conn, 500).unwrap(), 1);
        let again = claim_next(&conn, "w2", 500, 10_000).unwrap().unwrap();
        assert_eq!(again.job_id, a);
        assert!(claim_next(&conn, "w3", 500, 10_000).unwrap().is_none());
    }

    #[test]
    fn re_enqueue_leaves_live_lease_alone() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        enqueue(&conn, a, 0).unwrap();
        claim_next(&conn, "w1", 0, 10_000).unwrap().unwrap();
        enqueue(&conn, a, 5).unwrap();

        assert_eq!(count(&conn).unwrap(), 1);
        assert!(claim_next(&conn, "w2", 6, 10_000).unwrap().is_none());
        assert!(touch(&conn, a, "w1", 6, 10_000).unwrap());
    }

    #[test]
    fn re_enqueue_resets_expired_lease() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = job(&conn);
        enqueue(&conn, a, 0).unwrap();
        claim_next(&conn, "w1", 0, 100).unwrap().unwrap();
        enqueue(&conn, a, 200).unwrap();

        assert!(!touch(&conn, a, "w1", 201, 100).unwrap());
        assert!(claim_next(&conn, "w2", 201, 100).unwrap().is_some());
    }
}
