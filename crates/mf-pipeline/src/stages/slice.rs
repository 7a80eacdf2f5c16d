//! Slicing into printer instructions.

use std::sync::Arc;

use async_trait::async_trait;
use mf_core::{ArtifactRef, FailureKind};
use mf_tools::output::pick_output;
use mf_tools::tools::SLICER;
use mf_tools::ToolRegistry;

use super::{
    accepted_input, command_failure, required_tool, tool_command, transcript_log, MESH_EXTENSIONS,
};
use crate::stage::{StageExecutor, StageOutcome, StageRequest};

/// Preferred extensions of sliced output.
const SLICED_EXTENSIONS: &[&str] = &["gcode", "bgcode"];

/// Runs `<slicer> --gcode --output <dir> <model>`.
///
/// The slicer's transcript is kept in the log so advisories can be matched
/// against it.
pub struct SliceStage {
    tools: Arc<ToolRegistry>,
}

impl SliceStage {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StageExecutor for SliceStage {
    fn name(&self) -> &'static str {
        "slice"
    }

    async fn execute(&self, request: &StageRequest) -> StageOutcome {
        let mut accepted = MESH_EXTENSIONS.to_vec();
        accepted.push("3mf");
        let input = match accepted_input(request, &accepted) {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let slicer = match required_tool(&self.tools, SLICER) {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };

        let result = tool_command(slicer, request)
            .arg("--gcode")
            .arg("--output")
            .arg_path(&request.output_dir)
            .arg_path(input)
            .execute()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) => return command_failure(e),
        };

        match pick_output(&request.output_dir, SLICED_EXTENSIONS) {
            Ok(Some(produced)) => StageOutcome::success(
                vec![ArtifactRef::new(produced)],
                transcript_log(&out.output),
            ),
            Ok(None) => StageOutcome::failure(
                FailureKind::MalformedOutput,
                "slicer produced no output files",
            ),
            Err(e) => StageOutcome::failure(
                FailureKind::MalformedOutput,
                format!("cannot read slicer output directory: {e}"),
            ),
        }
    }
}
