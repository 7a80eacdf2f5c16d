//! Run one model through the pipeline without starting the server.

use std::path::Path;

use mf_core::config::Config;
use mf_core::queue::TaskQueue;
use mf_core::{Error, Job, Result};
use mf_pipeline::{RunOutcome, StageRegistry};
use mf_server::context::AppContext;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Admit `input` as a new job and drive it to a terminal state in-process.
///
/// Job state lives in an in-memory database; artifacts go to the configured
/// storage root as usual, so the result file outlives the call.
pub async fn run_file(config: Config, input: &Path, cancel: &CancellationToken) -> Result<Job> {
    if !input.is_file() {
        return Err(Error::Validation(format!(
            "input file does not exist: {}",
            input.display()
        )));
    }
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string();

    let tools = mf_server::discover_tools(&config);
    let stages = StageRegistry::with_builtin(tools.clone(), &config.tools);
    let ctx = AppContext::new(config, mf_db::init_memory_pool()?, tools, stages)?;
    ctx.admission.check(&extension, std::fs::metadata(input)?.len())?;

    // Admission takes ownership of the upload, so hand it a copy.
    let staged = ctx.artifacts.staging_dir().join(Uuid::new_v4().to_string());
    std::fs::copy(input, &staged)?;
    let job = ctx.admission.submit(&staged, &extension).await?;

    let delivery = ctx.queue.dequeue("local").await?;
    let outcome = ctx.executor.run(job.id, cancel).await?;
    ctx.queue.ack(&delivery).await?;

    if outcome == RunOutcome::Cancelled {
        return Err(Error::Internal(format!("job {} was interrupted", job.id)));
    }
    ctx.store.get(job.id)
}
