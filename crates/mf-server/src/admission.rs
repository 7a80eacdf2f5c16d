//! Upload admission: the only way a job comes into existence.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use mf_core::events::{EventBus, EventPayload};
use mf_core::queue::TaskQueue;
use mf_core::store::JobStore;
use mf_core::{Error, InputFormat, Job, JobId, Rejection, Result};
use mf_tools::ArtifactStore;

/// Checks uploads and turns accepted ones into queued jobs.
pub struct Admission {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    artifacts: Arc<ArtifactStore>,
    events: Arc<EventBus>,
    max_upload_bytes: u64,
    max_retries: u32,
}

impl Admission {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        artifacts: Arc<ArtifactStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            events,
            max_upload_bytes: 100 * 1024 * 1024,
            max_retries: 3,
        }
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Retry budget given to each new job.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Refuse an upload of `size` bytes with the declared `extension`, or
    /// return its format.
    pub fn check(&self, extension: &str, size: u64) -> Result<InputFormat> {
        let format = InputFormat::from_extension(extension).ok_or_else(|| {
            let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
            Error::AdmissionRejected(Rejection::UnsupportedExtension(ext))
        })?;
        if size > self.max_upload_bytes {
            return Err(Error::AdmissionRejected(Rejection::TooLarge {
                size,
                limit: self.max_upload_bytes,
            }));
        }
        Ok(format)
    }

    /// Admit the staged file at `upload`.
    ///
    /// The upload is moved into the new job's directory on success and
    /// deleted on rejection; either way the caller no longer owns it.
    ///
    /// # Errors
    ///
    /// [`Error::AdmissionRejected`] for an unsupported extension or an
    /// oversized file; no job is created in that case.
    pub async fn submit(&self, upload: &Path, extension: &str) -> Result<Job> {
        let size = std::fs::metadata(upload)?.len();
        let format = match self.check(extension, size) {
            Ok(format) => format,
            Err(e) => {
                discard(upload);
                tracing::info!(extension, size, "Upload rejected: {e}");
                return Err(e);
            }
        };

        let job_id = JobId::new();
        let job = match self.materialize(job_id, upload, format) {
            Ok(job) => job,
            Err(e) => {
                discard(upload);
                if let Err(purge_err) = self.artifacts.purge(job_id) {
                    tracing::warn!(job_id = %job_id, "Failed to purge after admission error: {purge_err}");
                }
                return Err(e);
            }
        };

        self.queue.enqueue(job_id).await?;
        tracing::info!(job_id = %job_id, format = %format, size, "Job admitted");
        self.events.broadcast(EventPayload::JobQueued { job_id });
        Ok(job)
    }

    fn materialize(&self, job_id: JobId, upload: &Path, format: InputFormat) -> Result<Job> {
        self.artifacts.allocate(job_id)?;
        let input = self.artifacts.import_input(job_id, upload, format)?;
        let job = Job::new(job_id, input, format, self.max_retries, Utc::now());
        self.store.create(&job)?;
        Ok(job)
    }
}

fn discard(upload: &Path) {
    if let Err(e) = std::fs::remove_file(upload) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %upload.display(), "Failed to remove staged upload: {e}");
        }
    }
}
