//! Extract a printable mesh from a 3MF package.

use std::sync::Arc;

use async_trait::async_trait;
use mf_core::{ArtifactRef, FailureKind};
use mf_tools::tools::SLICER;
use mf_tools::ToolRegistry;

use super::{accepted_input, command_failure, required_tool, tool_command, transcript_log};
use crate::stage::{StageExecutor, StageOutcome, StageRequest};

const OUTPUT_NAME: &str = "converted.obj";

/// Runs `<slicer> --export-obj --output <dir>/converted.obj <input.3mf>`.
pub struct ConvertStage {
    tools: Arc<ToolRegistry>,
}

impl ConvertStage {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StageExecutor for ConvertStage {
    fn name(&self) -> &'static str {
        "convert"
    }

    async fn execute(&self, request: &StageRequest) -> StageOutcome {
        let input = match accepted_input(request, &["3mf"]) {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let slicer = match required_tool(&self.tools, SLICER) {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };

        let output = request.output_dir.join(OUTPUT_NAME);
        let result = tool_command(slicer, request)
            .arg("--export-obj")
            .arg("--output")
            .arg_path(&output)
            .arg_path(input)
            .execute()
            .await;

        match result {
            Ok(out) if output.is_file() => StageOutcome::success(
                vec![ArtifactRef::new(output)],
                transcript_log(&out.output),
            ),
            Ok(_) => StageOutcome::failure(
                FailureKind::MalformedOutput,
                format!("slicer exited cleanly but did not write {OUTPUT_NAME}"),
            ),
            Err(e) => command_failure(e),
        }
    }
}
