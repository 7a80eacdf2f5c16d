//! The [`StageExecutor`] trait defines a single pipeline stage.
//!
//! A stage receives the paths of its input artifacts and an empty output
//! directory, runs its tool, and reports either the files it produced or a
//! typed failure. Tool failures are data, not errors: the executor decides
//! whether they are retried.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mf_core::{ArtifactRef, FailureKind, JobId};

use crate::definition::StageDescriptor;

/// Everything a stage needs for one attempt.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: JobId,
    /// Input artifacts, most relevant first.
    pub inputs: Vec<PathBuf>,
    /// Empty directory owned by this attempt.
    pub output_dir: PathBuf,
    /// The descriptor this stage runs under (name, extra args).
    pub config: StageDescriptor,
    pub timeout: Duration,
}

impl StageRequest {
    /// The primary input path.
    pub fn input(&self) -> Option<&std::path::Path> {
        self.inputs.first().map(PathBuf::as_path)
    }
}

/// Result of one stage attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success {
        output_refs: Vec<ArtifactRef>,
        log: serde_json::Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl StageOutcome {
    pub fn success(output_refs: Vec<ArtifactRef>, log: serde_json::Value) -> Self {
        StageOutcome::Success { output_refs, log }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        StageOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }
}

/// A single step in a processing pipeline.
///
/// Implementations differ only in how they build the tool invocation and
/// interpret its output. They must not retry internally.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Adapter key (e.g. "slice").
    fn name(&self) -> &'static str;

    /// Run one attempt.
    async fn execute(&self, request: &StageRequest) -> StageOutcome;
}
