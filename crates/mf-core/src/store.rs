//! Job persistence contract.
//!
//! The store holds job records and their append-only stage results. It never
//! inspects artifact contents, only [`ArtifactRef`](crate::model::ArtifactRef)s.

use crate::error::Result;
use crate::ids::JobId;
use crate::model::{Job, JobState};

/// Mutation applied to a job inside [`JobStore::update`].
pub type JobMutator = Box<dyn FnOnce(&mut Job) -> Result<()> + Send>;

/// Durable record of jobs.
///
/// Implementations must apply [`update`](JobStore::update) atomically per job
/// and serve [`get`](JobStore::get) from a consistent snapshot, so a status
/// poll never observes a half-written update.
pub trait JobStore: Send + Sync {
    /// Persist a freshly admitted job.
    fn create(&self, job: &Job) -> Result<()>;

    /// Fetch a job, or [`Error::NotFound`](crate::Error::NotFound).
    fn get(&self, id: JobId) -> Result<Job>;

    /// Load, mutate and write back a job as one atomic step, returning the
    /// updated record. If the mutator errors nothing is written.
    ///
    /// Stage results are append-only: a mutator that removes or rewrites
    /// existing results is rejected.
    fn update(&self, id: JobId, mutator: JobMutator) -> Result<Job>;

    /// List jobs, newest first, optionally filtered by state.
    fn list(&self, state: Option<JobState>, offset: i64, limit: i64) -> Result<Vec<Job>>;
}
