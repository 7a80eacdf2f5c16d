//! Task queue contract.
//!
//! Decouples admission from execution. Delivery is at-least-once: a
//! [`Delivery`] that is not acknowledged (worker crash, shutdown mid-job)
//! becomes visible again once its lease expires, so consumers must treat
//! redelivery of a job they have already progressed as a resume.

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::JobId;

/// A claimed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Worker that holds the lease.
    pub worker: String,
    /// How many times this entry has been handed out, including this one.
    pub attempt: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make `job_id` available to workers. Re-enqueueing an id already in
    /// the queue resets its entry.
    async fn enqueue(&self, job_id: JobId) -> Result<()>;

    /// Wait until an entry is available and lease it to `worker`.
    async fn dequeue(&self, worker: &str) -> Result<Delivery>;

    /// Remove a finished entry. A no-op if the lease was lost to another worker.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Extend the lease of an in-progress entry.
    async fn touch(&self, delivery: &Delivery) -> Result<()>;

    /// Number of entries waiting or leased.
    async fn len(&self) -> Result<usize>;
}
