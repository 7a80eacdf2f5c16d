//! Job domain model: states, formats, stage results and the aggregated report.
//!
//! All enums serialize in snake_case and implement `Display` / `FromStr` with
//! the same spelling, which is also the representation stored in the
//! database.
//!
//! [`Job`] owns its state machine. The transition methods ([`Job::start`],
//! [`Job::record`], [`Job::schedule_retry`], [`Job::succeed`], [`Job::fail`])
//! are the only way the executor mutates a job, and each one refuses to run
//! from the wrong state, which keeps the terminal-state invariant (exactly one
//! of `final_output_ref` / `error`) true by construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::JobId;

/// Implement `Display` and `FromStr` for a fieldless enum from a single
/// variant/string table.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// The canonical string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(Error::Validation(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted and queued; no worker has claimed it yet.
    Pending,
    /// Claimed by a worker; stages are executing.
    Running,
    /// Every stage succeeded and the output is sealed.
    Succeeded,
    /// A stage failed terminally.
    Failed,
}

string_enum!(JobState {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl JobState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

// ---------------------------------------------------------------------------
// InputFormat / PipelineKind / ArtifactKind
// ---------------------------------------------------------------------------

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Obj,
    Stl,
    Glb,
    Gltf,
    #[serde(rename = "3mf")]
    ThreeMf,
}

string_enum!(InputFormat {
    Obj => "obj",
    Stl => "stl",
    Glb => "glb",
    Gltf => "gltf",
    ThreeMf => "3mf",
});

impl InputFormat {
    /// Every supported format.
    pub const ALL: [InputFormat; 5] = [
        InputFormat::Obj,
        InputFormat::Stl,
        InputFormat::Glb,
        InputFormat::Gltf,
        InputFormat::ThreeMf,
    ];

    /// Resolve a declared extension (with or without the leading dot,
    /// case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.as_str() == ext)
    }

    /// Resolve the format from a file path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Which pipeline family this format needs.
    pub fn pipeline_kind(&self) -> PipelineKind {
        match self {
            InputFormat::ThreeMf => PipelineKind::PackagedArchive,
            _ => PipelineKind::Direct,
        }
    }

    /// The artifact kind an upload of this format represents.
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            InputFormat::ThreeMf => ArtifactKind::PackagedArchive,
            _ => ArtifactKind::Mesh,
        }
    }
}

/// Pipeline family derived from the input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Directly processable mesh formats.
    Direct,
    /// Archive formats that need extracting into a mesh first.
    PackagedArchive,
}

string_enum!(PipelineKind {
    Direct => "direct",
    PackagedArchive => "packaged_archive",
});

/// Kind of artifact a stage consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    PackagedArchive,
    Mesh,
    Sliced,
}

string_enum!(ArtifactKind {
    PackagedArchive => "packaged_archive",
    Mesh => "mesh",
    Sliced => "sliced",
});

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

/// Reference to a file owned by the artifact store.
///
/// The job store only ever holds these; it never opens the files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(PathBuf);

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Final path component, used as the download filename.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

/// Outcome status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
}

string_enum!(StageStatus {
    Ok => "ok",
    Failed => "failed",
});

/// Typed reason a stage attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool exited non-zero, was killed by a signal, or could not start.
    ToolCrashed,
    /// The tool exceeded its timeout and was killed.
    ToolTimedOut,
    /// The tool ran but its output could not be located or parsed.
    MalformedOutput,
    /// The stage cannot handle the given input.
    UnsupportedInput,
}

string_enum!(FailureKind {
    ToolCrashed => "tool_crashed",
    ToolTimedOut => "tool_timed_out",
    MalformedOutput => "malformed_output",
    UnsupportedInput => "unsupported_input",
});

/// Serde helpers to (de)serialize `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Durations are kept to the millisecond, the precision they are stored at.
fn whole_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Record of one stage attempt. Append-only on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    /// 1-based attempt number for this stage within the job.
    pub attempt: u32,
    pub status: StageStatus,
    pub output_refs: Vec<ArtifactRef>,
    /// Structured diagnostics emitted by the stage.
    pub log: serde_json::Value,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl StageResult {
    /// Build a successful attempt record.
    pub fn ok(
        stage_name: impl Into<String>,
        attempt: u32,
        output_refs: Vec<ArtifactRef>,
        log: serde_json::Value,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            attempt,
            status: StageStatus::Ok,
            output_refs,
            log,
            duration: whole_millis(duration),
            failure: None,
            message: None,
            started_at,
        }
    }

    /// Build a failed attempt record.
    pub fn failed(
        stage_name: impl Into<String>,
        attempt: u32,
        kind: FailureKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            attempt,
            status: StageStatus::Failed,
            output_refs: Vec::new(),
            log: serde_json::Value::Null,
            duration: whole_millis(duration),
            failure: Some(kind),
            message: Some(message.into()),
            started_at,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StageStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A warning surfaced to the client in the aggregated report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Per-stage summary in the aggregated report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub attempts: u32,
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Aggregated result attached to a succeeded job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    /// Structured record emitted by the validation stage, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<serde_json::Value>,
    pub stages: Vec<StageSummary>,
    pub warnings: Vec<Warning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slicing_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Cause of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Name of the stage that failed.
    pub stage: String,
    pub message: String,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// One end-to-end processing request for a single uploaded artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub input_ref: ArtifactRef,
    pub input_format: InputFormat,
    pub pipeline_kind: PipelineKind,
    pub stage_results: Vec<StageResult>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_output_ref: Option<ArtifactRef>,
    pub error: Option<JobError>,
    pub report: Option<Report>,
}

impl Job {
    /// Create a new `Pending` job.
    pub fn new(
        id: JobId,
        input_ref: ArtifactRef,
        input_format: InputFormat,
        max_retries: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: JobState::Pending,
            input_ref,
            input_format,
            pipeline_kind: input_format.pipeline_kind(),
            stage_results: Vec::new(),
            retry_count: 0,
            max_retries,
            created_at,
            started_at: None,
            finished_at: None,
            final_output_ref: None,
            error: None,
            report: None,
        }
    }

    fn expect_state(&self, expected: JobState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidTransition(format!(
                "cannot {action} job {} in state {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// `Pending -> Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_state(JobState::Pending, "start")?;
        self.state = JobState::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// Append a stage attempt. Only valid while running.
    pub fn record(&mut self, result: StageResult) -> Result<()> {
        self.expect_state(JobState::Running, "record a stage result on")?;
        self.stage_results.push(result);
        Ok(())
    }

    /// Whether another retry fits in the budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Consume one retry from the budget.
    pub fn schedule_retry(&mut self) -> Result<()> {
        self.expect_state(JobState::Running, "retry")?;
        if !self.can_retry() {
            return Err(Error::InvalidTransition(format!(
                "job {} exhausted its {} retries",
                self.id, self.max_retries
            )));
        }
        self.retry_count += 1;
        Ok(())
    }

    /// `Running -> Succeeded`.
    pub fn succeed(
        &mut self,
        output: ArtifactRef,
        report: Report,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_state(JobState::Running, "complete")?;
        self.state = JobState::Succeeded;
        self.final_output_ref = Some(output);
        self.report = Some(report);
        self.error = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// `Running -> Failed`.
    pub fn fail(
        &mut self,
        stage: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.expect_state(JobState::Running, "fail")?;
        self.state = JobState::Failed;
        self.error = Some(JobError {
            stage: stage.into(),
            message: message.into(),
        });
        self.final_output_ref = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// The most recent attempt recorded for `stage`.
    pub fn latest_result(&self, stage: &str) -> Option<&StageResult> {
        self.stage_results
            .iter()
            .rev()
            .find(|r| r.stage_name == stage)
    }

    /// Number of attempts recorded for `stage`.
    pub fn attempts(&self, stage: &str) -> u32 {
        self.stage_results
            .iter()
            .filter(|r| r.stage_name == stage)
            .count() as u32
    }

    /// Client-facing view of the job.
    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running {
                stage_results: self.stage_results.clone(),
            },
            JobState::Succeeded => JobStatus::Succeeded {
                output: self.final_output_ref.clone(),
                report: self.report.clone().unwrap_or_default(),
            },
            JobState::Failed => {
                let error = self.error.clone().unwrap_or_else(|| JobError {
                    stage: "unknown".into(),
                    message: "job failed".into(),
                });
                JobStatus::Failed {
                    stage: error.stage,
                    message: error.message,
                }
            }
        }
    }
}

/// What a status poll sees: one of not-yet-started, running with partial
/// log, succeeded with output, failed with cause.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running {
        stage_results: Vec<StageResult>,
    },
    Succeeded {
        output: Option<ArtifactRef>,
        report: Report,
    },
    Failed {
        stage: String,
        message: String,
    },
}
