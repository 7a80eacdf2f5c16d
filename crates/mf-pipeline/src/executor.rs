//! Pipeline executor: drives one job through its resolved stages.
//!
//! Every transition is committed to the [`JobStore`] before the next step
//! begins, so a job interrupted at any point (worker crash, shutdown,
//! redelivered queue message) resumes from its persisted stage results:
//!
//! - a terminal job is left untouched, only scratch cleanup runs again;
//! - a stage whose latest result is `Ok` is skipped and its recorded outputs
//!   feed the stages after it;
//! - a stage whose latest result is `Failed` on a running job was scheduled
//!   for retry and is re-invoked with the next attempt number.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mf_core::config::default_advisories;
use mf_core::events::{EventBus, EventPayload};
use mf_core::store::JobStore;
use mf_core::{ArtifactKind, FailureKind, Job, JobId, JobState, Result, StageResult};
use mf_tools::ArtifactStore;
use tokio_util::sync::CancellationToken;

use crate::definition::{PipelineDefinition, StageDescriptor};
use crate::factory::StageRegistry;
use crate::report::{aggregate, AdvisoryRule};
use crate::retry::RetryPolicy;
use crate::stage::{StageOutcome, StageRequest};

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(3600);

/// How a call to [`PipelineExecutor::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// Stopped by the cancellation token. The job is still `Running` and
    /// resumes on its next delivery.
    Cancelled,
}

/// Result of driving a single stage.
enum Step {
    Advance(Job),
    Stop(RunOutcome),
}

/// Sole mutator of job state and stage results.
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    artifacts: Arc<ArtifactStore>,
    definition: Arc<PipelineDefinition>,
    stages: StageRegistry,
    retry: RetryPolicy,
    default_timeout: Duration,
    advisories: Vec<AdvisoryRule>,
    events: Arc<EventBus>,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<ArtifactStore>,
        definition: Arc<PipelineDefinition>,
        stages: StageRegistry,
    ) -> Self {
        Self {
            store,
            artifacts,
            definition,
            stages,
            retry: RetryPolicy::default(),
            default_timeout: DEFAULT_STAGE_TIMEOUT,
            advisories: default_advisories().iter().map(AdvisoryRule::from).collect(),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for stages whose descriptor sets none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_advisories(mut self, advisories: Vec<AdvisoryRule>) -> Self {
        self.advisories = advisories;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Drive `job_id` until it is terminal or `cancel` fires.
    ///
    /// Safe to call any number of times for the same job.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (job store unavailable, job missing)
    /// are returned as errors; stage failures end in [`RunOutcome::Failed`].
    pub async fn run(&self, job_id: JobId, cancel: &CancellationToken) -> Result<RunOutcome> {
        let mut job = self.store.get(job_id)?;

        if job.state.is_terminal() {
            tracing::debug!(job_id = %job_id, state = %job.state, "Job already terminal");
            self.cleanup(job_id);
            return Ok(match job.state {
                JobState::Succeeded => RunOutcome::Succeeded,
                _ => RunOutcome::Failed,
            });
        }

        if job.state == JobState::Pending {
            job = self
                .store
                .update(job_id, Box::new(|job: &mut Job| job.start(Utc::now())))?;
            tracing::info!(job_id = %job_id, format = %job.input_format, "Job started");
            self.events.broadcast(EventPayload::JobStarted { job_id });
        } else {
            tracing::info!(
                job_id = %job_id,
                recorded = job.stage_results.len(),
                "Resuming job"
            );
        }

        let plan = self.definition.resolve(job.input_format);
        let Some(last) = plan.last() else {
            return self.fail(
                job_id,
                "pipeline",
                format!("no stages apply to .{} inputs", job.input_format),
            );
        };

        let mut latest: HashMap<ArtifactKind, PathBuf> = HashMap::from([(
            job.input_format.artifact_kind(),
            job.input_ref.path().to_path_buf(),
        )]);

        for descriptor in &plan {
            if cancel.is_cancelled() {
                tracing::info!(job_id = %job_id, "Job cancelled between stages");
                return Ok(RunOutcome::Cancelled);
            }

            let done = job
                .latest_result(&descriptor.name)
                .is_some_and(StageResult::is_ok);
            if done {
                tracing::debug!(job_id = %job_id, stage = %descriptor.name, "Stage already completed");
            } else {
                match self.run_stage(job, descriptor, &latest, cancel).await? {
                    Step::Advance(updated) => job = updated,
                    Step::Stop(outcome) => return Ok(outcome),
                }
            }

            let first_output = job
                .latest_result(&descriptor.name)
                .and_then(|r| r.output_refs.first());
            if let (Some(kind), Some(output)) = (descriptor.output, first_output) {
                latest.insert(kind, output.path().to_path_buf());
            }
        }

        let Some(produced) = job
            .latest_result(&last.name)
            .and_then(|r| r.output_refs.first())
        else {
            return self.fail(job_id, &last.name, "final stage produced no output");
        };

        let sealed = match self.artifacts.finalize(job_id, produced.path()) {
            Ok(sealed) => sealed,
            Err(e) => return self.fail(job_id, &last.name, format!("storage error: {e}")),
        };

        let report = aggregate(&plan, &job.stage_results, &self.advisories);
        let output = sealed.clone();
        self.store.update(
            job_id,
            Box::new(move |job: &mut Job| job.succeed(output, report, Utc::now())),
        )?;

        tracing::info!(job_id = %job_id, output = %sealed, "Job succeeded");
        self.events.broadcast(EventPayload::JobCompleted { job_id });
        self.cleanup(job_id);
        Ok(RunOutcome::Succeeded)
    }

    /// Run `descriptor` until it succeeds, fails terminally, or is
    /// cancelled. Transient failures are retried here while the job's
    /// retry budget lasts.
    async fn run_stage(
        &self,
        mut job: Job,
        descriptor: &StageDescriptor,
        latest: &HashMap<ArtifactKind, PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let job_id = job.id;
        let stage = descriptor.name.as_str();

        let Some(executor) = self.stages.get(&descriptor.executor) else {
            let message = format!("unknown executor {:?}", descriptor.executor);
            return self.fail(job_id, stage, message).map(Step::Stop);
        };
        let Some(input) = latest.get(&descriptor.input) else {
            let message = format!("no {} artifact available", descriptor.input);
            return self.fail(job_id, stage, message).map(Step::Stop);
        };
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);

        loop {
            let attempt = job.attempts(stage) + 1;
            let output_dir = match self.artifacts.stage_output_path(job_id, stage) {
                Ok(dir) => dir,
                Err(e) => {
                    return self
                        .fail(job_id, stage, format!("storage error: {e}"))
                        .map(Step::Stop)
                }
            };
            let request = StageRequest {
                job_id,
                inputs: vec![input.clone()],
                output_dir,
                config: descriptor.clone(),
                timeout,
            };

            tracing::info!(job_id = %job_id, stage, attempt, "Starting stage");
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = tokio::select! {
                outcome = executor.execute(&request) => outcome,
                () = cancel.cancelled() => {
                    tracing::warn!(job_id = %job_id, stage, attempt, "Stage cancelled");
                    return Ok(Step::Stop(RunOutcome::Cancelled));
                }
            };
            let duration = clock.elapsed();

            let outcome = match outcome {
                StageOutcome::Success { output_refs, .. }
                    if descriptor.output.is_some() && output_refs.is_empty() =>
                {
                    StageOutcome::failure(
                        FailureKind::MalformedOutput,
                        "stage succeeded without producing an output",
                    )
                }
                other => other,
            };

            let (kind, message) = match outcome {
                StageOutcome::Success { output_refs, log } => {
                    let result =
                        StageResult::ok(stage, attempt, output_refs, log, started_at, duration);
                    job = self
                        .store
                        .update(job_id, Box::new(move |job: &mut Job| job.record(result)))?;
                    tracing::info!(
                        job_id = %job_id,
                        stage,
                        attempt,
                        elapsed_ms = duration.as_millis() as u64,
                        "Stage completed"
                    );
                    self.events.broadcast(EventPayload::StageCompleted {
                        job_id,
                        stage: stage.to_string(),
                        attempt,
                    });
                    return Ok(Step::Advance(job));
                }
                StageOutcome::Failure { kind, message } => (kind, message),
            };

            let result = StageResult::failed(
                stage,
                attempt,
                kind,
                message.clone(),
                started_at,
                duration,
            );
            self.events.broadcast(EventPayload::StageFailed {
                job_id,
                stage: stage.to_string(),
                attempt,
                kind,
                message: message.clone(),
            });

            if self.retry.is_transient(kind) && job.can_retry() {
                let backoff = self.retry.backoff(job.retry_count);
                job = self.store.update(
                    job_id,
                    Box::new(move |job: &mut Job| {
                        job.record(result)?;
                        job.schedule_retry()
                    }),
                )?;
                tracing::warn!(
                    job_id = %job_id,
                    stage,
                    attempt,
                    failure = %kind,
                    retry = job.retry_count,
                    max_retries = job.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Stage failed, retrying: {message}"
                );
                self.events.broadcast(EventPayload::StageRetrying {
                    job_id,
                    stage: stage.to_string(),
                    next_attempt: attempt + 1,
                    backoff_ms: backoff.as_millis() as u64,
                });

                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = cancel.cancelled() => return Ok(Step::Stop(RunOutcome::Cancelled)),
                }
                continue;
            }

            let failed_stage = stage.to_string();
            let error = message.clone();
            self.store.update(
                job_id,
                Box::new(move |job: &mut Job| {
                    job.record(result)?;
                    job.fail(failed_stage, error, Utc::now())
                }),
            )?;
            self.after_failure(job_id, stage, kind.as_str(), &message);
            return Ok(Step::Stop(RunOutcome::Failed));
        }
    }

    /// Mark the job failed without a stage attempt (storage errors,
    /// unresolvable plans).
    fn fail(
        &self,
        job_id: JobId,
        stage: &str,
        message: impl Into<String>,
    ) -> Result<RunOutcome> {
        let message = message.into();
        let failed_stage = stage.to_string();
        let error = message.clone();
        self.store.update(
            job_id,
            Box::new(move |job: &mut Job| job.fail(failed_stage, error, Utc::now())),
        )?;
        self.after_failure(job_id, stage, "infrastructure", &message);
        Ok(RunOutcome::Failed)
    }

    fn after_failure(&self, job_id: JobId, stage: &str, cause: &str, message: &str) {
        tracing::error!(job_id = %job_id, stage, cause, "Job failed: {message}");
        self.events.broadcast(EventPayload::JobFailed {
            job_id,
            stage: stage.to_string(),
            error: message.to_string(),
        });
        self.cleanup(job_id);
    }

    /// Remove stage scratch space. Failures are logged, never fatal.
    fn cleanup(&self, job_id: JobId) {
        if let Err(e) = self.artifacts.purge_intermediates(job_id) {
            tracing::warn!(job_id = %job_id, "Failed to purge intermediates: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageExecutor;
    use async_trait::async_trait;
    use mf_core::{ArtifactRef, InputFormat, JobStatus, StageStatus};
    use mf_db::{init_memory_pool, SqliteJobStore};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Fake {
        /// Write `file` into the output dir and report it.
        Produce(&'static str, Value),
        /// Succeed without outputs.
        Record(Value),
        Fail(FailureKind),
        Hang,
    }

    struct FakeStage {
        key: &'static str,
        script: Mutex<VecDeque<Fake>>,
        fallback: Fake,
        calls: AtomicU32,
        inputs: Mutex<Vec<PathBuf>>,
    }

    impl FakeStage {
        fn new(key: &'static str, script: Vec<Fake>, fallback: Fake) -> Arc<Self> {
            Arc::new(Self {
                key,
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
                inputs: Mutex::new(Vec::new()),
            })
        }

        fn always(key: &'static str, fake: Fake) -> Arc<Self> {
            Self::new(key, vec![], fake)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageExecutor for FakeStage {
        fn name(&self) -> &'static str {
            self.key
        }

        async fn execute(&self, request: &StageRequest) -> StageOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(request.inputs[0].clone());
            assert_eq!(
                std::fs::read_dir(&request.output_dir).unwrap().count(),
                0,
                "output dir must start empty"
            );
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match step {
                Fake::Produce(file, log) => {
                    let path = request.output_dir.join(file);
                    std::fs::write(&path, self.key).unwrap();
                    StageOutcome::success(vec![ArtifactRef::new(path)], log)
                }
                Fake::Record(log) => StageOutcome::success(vec![], log),
                Fake::Fail(kind) => StageOutcome::failure(kind, format!("{} failed", self.key)),
                Fake::Hang => std::future::pending().await,
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteJobStore>,
        artifacts: Arc<ArtifactStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).unwrap());
            let store = Arc::new(SqliteJobStore::new(init_memory_pool().unwrap()));
            Self {
                _dir: dir,
                store,
                artifacts,
            }
        }

        fn admit(&self, format: InputFormat, max_retries: u32) -> JobId {
            let id = JobId::new();
            self.artifacts.allocate(id).unwrap();
            let upload = self
                .artifacts
                .staging_dir()
                .join(format!("{id}.{}", format.extension()));
            std::fs::write(&upload, b"model").unwrap();
            let input = self.artifacts.import_input(id, &upload, format).unwrap();
            let job = Job::new(id, input, format, max_retries, Utc::now());
            self.store.create(&job).unwrap();
            id
        }

        fn job(&self, id: JobId) -> Job {
            self.store.get(id).unwrap()
        }

        fn executor(&self, stages: &[Arc<FakeStage>]) -> PipelineExecutor {
            let mut registry = StageRegistry::new();
            for stage in stages {
                registry.register(stage.key, stage.clone());
            }
            PipelineExecutor::new(
                self.store.clone(),
                self.artifacts.clone(),
                Arc::new(PipelineDefinition::default()),
                registry,
            )
            .with_retry(RetryPolicy::immediate(3))
        }
    }

    fn mesh(name: &'static str) -> Fake {
        Fake::Produce(name, json!({}))
    }

    fn pipeline(
        slice: Arc<FakeStage>,
    ) -> (Arc<FakeStage>, Arc<FakeStage>, Arc<FakeStage>, Arc<FakeStage>) {
        (
            FakeStage::always("convert", mesh("converted.obj")),
            FakeStage::always("validate", Fake::Record(json!({"manifold": true}))),
            FakeStage::always("repair", mesh("repaired.stl")),
            slice,
        )
    }

    #[tokio::test]
    async fn direct_job_runs_to_success() {
        let fx = Fixture::new();
        let slice = FakeStage::always(
            "slice",
            Fake::Produce("model.gcode", json!({"output": "Low bed adhesion"})),
        );
        let (convert, validate, repair, slice) = pipeline(slice);
        let executor = fx.executor(&[convert.clone(), validate, repair.clone(), slice.clone()]);
        let mut events = executor.events().subscribe();
        let id = fx.admit(InputFormat::Stl, 3);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Succeeded);

        let job = fx.job(id);
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(convert.calls(), 0);
        let names: Vec<_> = job.stage_results.iter().map(|r| r.stage_name.as_str()).collect();
        assert_eq!(names, vec!["validate", "repair", "slice"]);

        // Slice consumed the repaired mesh, not the upload.
        let slice_input = slice.inputs.lock().unwrap()[0].clone();
        assert_eq!(slice_input.file_name().unwrap(), "repaired.stl");

        let output = job.final_output_ref.clone().unwrap();
        assert!(output.path().starts_with(fx.artifacts.job_dir(id).join("output")));
        assert!(fx.artifacts.exists(&output));
        assert!(fx.artifacts.exists(&job.input_ref));
        assert!(!fx.artifacts.job_dir(id).join("stages").exists());

        let report = job.report.unwrap();
        assert_eq!(report.slicing_status.as_deref(), Some("SUCCESS"));
        assert_eq!(report.validation, Some(json!({"manifold": true})));
        assert_eq!(report.warnings.len(), 1);

        assert_eq!(
            events.recv().await.unwrap().payload,
            EventPayload::JobStarted { job_id: id }
        );
    }

    #[tokio::test]
    async fn archive_job_converts_first() {
        let fx = Fixture::new();
        let (convert, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert.clone(), validate.clone(), repair, slice]);
        let id = fx.admit(InputFormat::ThreeMf, 3);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(convert.calls(), 1);
        assert_eq!(
            convert.inputs.lock().unwrap()[0].file_name().unwrap(),
            "input.3mf"
        );
        assert_eq!(
            validate.inputs.lock().unwrap()[0].file_name().unwrap(),
            "converted.obj"
        );
    }

    #[tokio::test]
    async fn unsupported_conversion_fails_without_validation() {
        let fx = Fixture::new();
        let convert = FakeStage::always("convert", Fake::Fail(FailureKind::UnsupportedInput));
        let (_, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert.clone(), validate.clone(), repair, slice]);
        let id = fx.admit(InputFormat::ThreeMf, 3);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(convert.calls(), 1);
        assert_eq!(validate.calls(), 0);

        let job = fx.job(id);
        assert_eq!(
            job.status(),
            JobStatus::Failed {
                stage: "convert".into(),
                message: "convert failed".into(),
            }
        );
        assert!(job.final_output_ref.is_none());
        assert!(!fx.artifacts.job_dir(id).join("stages").exists());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fx = Fixture::new();
        let slice = FakeStage::new(
            "slice",
            vec![
                Fake::Fail(FailureKind::ToolTimedOut),
                Fake::Fail(FailureKind::ToolCrashed),
            ],
            mesh("model.gcode"),
        );
        let (convert, validate, repair, slice) = pipeline(slice);
        let executor = fx.executor(&[convert, validate, repair, slice.clone()]);
        let id = fx.admit(InputFormat::Obj, 3);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(slice.calls(), 3);

        let job = fx.job(id);
        assert_eq!(job.retry_count, 2);
        let attempts: Vec<_> = job
            .stage_results
            .iter()
            .filter(|r| r.stage_name == "slice")
            .map(|r| (r.attempt, r.status))
            .collect();
        assert_eq!(
            attempts,
            vec![
                (1, StageStatus::Failed),
                (2, StageStatus::Failed),
                (3, StageStatus::Ok)
            ]
        );
        let summary = job.report.unwrap().stages;
        assert_eq!(summary.last().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn retries_stop_at_budget() {
        let fx = Fixture::new();
        let (convert, validate, repair, slice) = pipeline(FakeStage::always(
            "slice",
            Fake::Fail(FailureKind::ToolCrashed),
        ));
        let executor = fx.executor(&[convert, validate, repair, slice.clone()]);
        let id = fx.admit(InputFormat::Stl, 2);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(slice.calls(), 3);

        let job = fx.job(id);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.unwrap().stage, "slice");
        assert!(job.stage_results.len() <= 3 * (1 + 2));
    }

    #[tokio::test]
    async fn timeouts_are_retried_up_to_the_budget() {
        let fx = Fixture::new();
        let repair = FakeStage::always("repair", Fake::Fail(FailureKind::ToolTimedOut));
        let (convert, validate, _, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate, repair.clone(), slice.clone()]);
        let id = fx.admit(InputFormat::Stl, 2);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(repair.calls(), 3);
        assert_eq!(slice.calls(), 0);

        let job = fx.job(id);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.unwrap().stage, "repair");
        let last = job.stage_results.last().unwrap();
        assert_eq!(last.failure, Some(FailureKind::ToolTimedOut));
    }

    #[tokio::test]
    async fn deterministic_failures_are_not_retried() {
        let fx = Fixture::new();
        let validate = FakeStage::always("validate", Fake::Fail(FailureKind::MalformedOutput));
        let (convert, _, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate.clone(), repair.clone(), slice]);
        let id = fx.admit(InputFormat::Glb, 3);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(validate.calls(), 1);
        assert_eq!(repair.calls(), 0);
        assert_eq!(fx.job(id).retry_count, 0);
    }

    #[tokio::test]
    async fn missing_declared_output_is_malformed() {
        let fx = Fixture::new();
        let repair = FakeStage::always("repair", Fake::Record(json!({})));
        let (convert, validate, _, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate, repair.clone(), slice]);
        let id = fx.admit(InputFormat::Stl, 3);

        assert_eq!(
            executor.run(id, &CancellationToken::new()).await.unwrap(),
            RunOutcome::Failed
        );
        assert_eq!(repair.calls(), 1);
        let result = fx.job(id).latest_result("repair").cloned().unwrap();
        assert_eq!(result.failure, Some(FailureKind::MalformedOutput));
    }

    #[tokio::test]
    async fn redelivery_of_finished_job_is_a_no_op() {
        let fx = Fixture::new();
        let (convert, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate.clone(), repair, slice.clone()]);
        let id = fx.admit(InputFormat::Stl, 3);
        let cancel = CancellationToken::new();

        executor.run(id, &cancel).await.unwrap();
        let first = fx.job(id);
        let again = executor.run(id, &cancel).await.unwrap();

        assert_eq!(again, RunOutcome::Succeeded);
        assert_eq!(fx.job(id), first);
        assert_eq!(validate.calls(), 1);
        assert_eq!(slice.calls(), 1);
    }

    #[tokio::test]
    async fn running_job_resumes_after_completed_stages() {
        let fx = Fixture::new();
        let id = fx.admit(InputFormat::Stl, 3);

        // A previous worker validated and repaired, then died.
        let repaired = fx.artifacts.stage_output_path(id, "repair").unwrap().join("repaired.stl");
        std::fs::write(&repaired, b"mesh").unwrap();
        let repaired_ref = ArtifactRef::new(&repaired);
        fx.store
            .update(
                id,
                Box::new(move |job: &mut Job| {
                    let now = Utc::now();
                    job.start(now)?;
                    job.record(StageResult::ok("validate", 1, vec![], json!({}), now, Duration::ZERO))?;
                    job.record(StageResult::ok("repair", 1, vec![repaired_ref], json!({}), now, Duration::ZERO))
                }),
            )
            .unwrap();

        let (convert, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate.clone(), repair.clone(), slice.clone()]);
        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(validate.calls(), 0);
        assert_eq!(repair.calls(), 0);
        assert_eq!(slice.calls(), 1);
        assert_eq!(slice.inputs.lock().unwrap()[0], repaired);
    }

    #[tokio::test]
    async fn scheduled_retry_resumes_at_next_attempt() {
        let fx = Fixture::new();
        let id = fx.admit(InputFormat::Stl, 3);
        fx.store
            .update(
                id,
                Box::new(|job: &mut Job| {
                    let now = Utc::now();
                    job.start(now)?;
                    job.record(StageResult::failed(
                        "validate",
                        1,
                        FailureKind::ToolTimedOut,
                        "timed out",
                        now,
                        Duration::ZERO,
                    ))?;
                    job.schedule_retry()
                }),
            )
            .unwrap();

        let (convert, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate.clone(), repair, slice]);
        executor.run(id, &CancellationToken::new()).await.unwrap();

        let job = fx.job(id);
        assert_eq!(validate.calls(), 1);
        assert_eq!(job.latest_result("validate").unwrap().attempt, 2);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_job_running_and_resumable() {
        let fx = Fixture::new();
        let slice = FakeStage::new("slice", vec![Fake::Hang], mesh("model.gcode"));
        let (convert, validate, repair, slice) = pipeline(slice);
        let executor = fx.executor(&[convert, validate, repair, slice.clone()]);
        let id = fx.admit(InputFormat::Stl, 3);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = executor.run(id, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(fx.job(id).state, JobState::Running);

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(slice.calls(), 2);
        // The interrupted attempt left no record, so the rerun is attempt 1.
        assert_eq!(fx.job(id).latest_result("slice").unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn storage_error_fails_job() {
        let fx = Fixture::new();
        let (convert, validate, repair, slice) =
            pipeline(FakeStage::always("slice", mesh("model.gcode")));
        let executor = fx.executor(&[convert, validate.clone(), repair, slice]);
        let id = fx.admit(InputFormat::Stl, 3);
        fx.artifacts.purge(id).unwrap();

        let outcome = executor.run(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(validate.calls(), 0);
        let error = fx.job(id).error.unwrap();
        assert_eq!(error.stage, "validate");
        assert!(error.message.starts_with("storage error"));
    }

    #[tokio::test]
    async fn missing_job_is_an_error() {
        let fx = Fixture::new();
        let executor = fx.executor(&[]);
        let err = executor
            .run(JobId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, mf_core::Error::NotFound { .. }));
    }
}
