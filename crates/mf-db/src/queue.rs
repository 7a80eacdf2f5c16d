//! SQLite-backed [`TaskQueue`] with lease-based redelivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mf_core::queue::{Delivery, TaskQueue};
use mf_core::{JobId, Result};
use tokio::sync::Notify;

use crate::pool::{get_conn, DbPool};
use crate::queries::tasks;

/// Durable FIFO queue in the `task_queue` table.
///
/// Waiting consumers are woken by [`Notify`] on enqueue and fall back to
/// polling every `poll_interval`, which also picks up entries whose lease
/// expired.
pub struct SqliteTaskQueue {
    pool: DbPool,
    notify: Notify,
    lease: Duration,
    poll_interval: Duration,
}

impl SqliteTaskQueue {
    pub fn new(pool: DbPool, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            notify: Notify::new(),
            lease,
            poll_interval,
        }
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }

    /// Lease the next claimable entry without waiting.
    pub fn try_dequeue(&self, worker: &str) -> Result<Option<Delivery>> {
        let conn = get_conn(&self.pool)?;
        let claimed =
            tasks::claim_next(&conn, worker, Utc::now().timestamp_millis(), self.lease_ms())?;
        Ok(claimed.map(|t| Delivery {
            job_id: t.job_id,
            worker: worker.to_string(),
            attempt: t.deliveries,
        }))
    }

    /// Clear leases whose holder stopped renewing them. Leases another
    /// live process is still touching are kept.
    pub fn release_stale_leases(&self) -> Result<usize> {
        let conn = get_conn(&self.pool)?;
        let n = tasks::release_expired(&conn, Utc::now().timestamp_millis())?;
        if n > 0 {
            self.notify.notify_waiters();
        }
        Ok(n)
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        {
            let conn = get_conn(&self.pool)?;
            tasks::enqueue(&conn, job_id, Utc::now().timestamp_millis())?;
        }
        tracing::debug!(job_id = %job_id, "Enqueued job");
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, worker: &str) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.try_dequeue(worker)? {
                tracing::debug!(
                    job_id = %delivery.job_id,
                    worker,
                    attempt = delivery.attempt,
                    "Dequeued job"
                );
                return Ok(delivery);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        if !tasks::ack(&conn, delivery.job_id, &delivery.worker)? {
            tracing::warn!(
                job_id = %delivery.job_id,
                worker = %delivery.worker,
                "Ack ignored: lease no longer held"
            );
        }
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        tasks::touch(
            &conn,
            delivery.job_id,
            &delivery.worker,
            Utc::now().timestamp_millis(),
            self.lease_ms(),
        )?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let conn = get_conn(&self.pool)?;
        Ok(tasks::count(&conn)?.max(0) as usize)
    }
}
