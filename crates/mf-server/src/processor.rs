//! Background job processor.
//!
//! A fixed pool of workers, each taking one delivery from the task queue and
//! driving it through the [`PipelineExecutor`](mf_pipeline::PipelineExecutor)
//! before taking the next. While a job runs its lease is renewed so other
//! processes do not pick it up.

use std::time::Duration;

use mf_core::queue::{Delivery, TaskQueue};
use mf_core::{Error, JobState};
use mf_pipeline::RunOutcome;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start `workers` processing tasks and wait until all have stopped.
///
/// Runs until the cancellation token is triggered.
pub async fn run_processor(ctx: AppContext, workers: usize, cancel: CancellationToken) {
    match ctx.queue.release_stale_leases() {
        Ok(0) => {}
        Ok(n) => tracing::info!("Released {n} stale queue leases"),
        Err(e) => tracing::warn!("Failed to release stale leases: {e}"),
    }

    let mut set = JoinSet::new();
    for i in 0..workers.max(1) {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let worker = format!("worker-{}-{i}", std::process::id());
        set.spawn(async move { run_worker(ctx, worker, cancel).await });
    }
    tracing::info!(workers, "Job processor started");

    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            tracing::error!("Worker task panicked: {e}");
        }
    }
    tracing::info!("Job processor stopped");
}

async fn run_worker(ctx: AppContext, worker: String, cancel: CancellationToken) {
    tracing::debug!(worker = %worker, "Worker started");
    loop {
        let delivery = tokio::select! {
            () = cancel.cancelled() => break,
            result = ctx.queue.dequeue(&worker) => result,
        };

        match delivery {
            Ok(delivery) => process_delivery(&ctx, delivery, &cancel).await,
            Err(e) => {
                tracing::error!(worker = %worker, "Dequeue failed: {e}");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
            }
        }
    }
    tracing::debug!(worker = %worker, "Worker stopped");
}

/// Run one delivery to completion and acknowledge it unless it was
/// interrupted.
async fn process_delivery(ctx: &AppContext, delivery: Delivery, cancel: &CancellationToken) {
    let job_id = delivery.job_id;
    tracing::info!(
        job_id = %job_id,
        worker = %delivery.worker,
        delivery = delivery.attempt,
        "Processing job"
    );

    let heartbeat = CancellationToken::new();
    let beat = tokio::spawn(keep_alive(
        ctx.clone(),
        delivery.clone(),
        ctx.config.queue.heartbeat(),
        heartbeat.clone(),
    ));

    let result = ctx.executor.run(job_id, cancel).await;
    heartbeat.cancel();
    let _ = beat.await;

    let ack = match result {
        Ok(RunOutcome::Cancelled) => {
            tracing::info!(job_id = %job_id, "Job interrupted, leaving it queued");
            false
        }
        Ok(outcome) => {
            tracing::debug!(job_id = %job_id, ?outcome, "Delivery finished");
            true
        }
        Err(Error::NotFound { .. }) => {
            tracing::warn!(job_id = %job_id, "Queued job no longer exists, dropping delivery");
            true
        }
        Err(e) => {
            // Left unacknowledged: the lease expires and the job is retried
            // from its persisted state.
            tracing::error!(job_id = %job_id, "Job processing error: {e}");
            false
        }
    };

    if ack {
        if let Err(e) = ctx.queue.ack(&delivery).await {
            tracing::error!(job_id = %job_id, "Failed to acknowledge delivery: {e}");
        }
    }
}

/// Renew the lease on `delivery` every `period` until `stop` fires.
async fn keep_alive(
    ctx: AppContext,
    delivery: Delivery,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = ctx.queue.touch(&delivery).await {
                    tracing::warn!(job_id = %delivery.job_id, "Lease renewal failed: {e}");
                }
            }
        }
    }
}

/// Put every unfinished job back on the queue.
///
/// Covers jobs admitted but never enqueued (crash between commit and
/// enqueue). Entries another process holds a live lease on are left with
/// it. Returns how many jobs were enqueued.
pub async fn requeue_unfinished(ctx: &AppContext) -> mf_core::Result<usize> {
    const PAGE: i64 = 500;
    let mut requeued = 0;
    for state in [JobState::Pending, JobState::Running] {
        let mut offset = 0;
        loop {
            let jobs = ctx.store.list(Some(state), offset, PAGE)?;
            for job in &jobs {
                ctx.queue.enqueue(job.id).await?;
                requeued += 1;
            }
            if (jobs.len() as i64) < PAGE {
                break;
            }
            offset += PAGE;
        }
    }
    Ok(requeued)
}
