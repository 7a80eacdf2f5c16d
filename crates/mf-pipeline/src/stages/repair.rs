//! Mesh repair via a configurable command.

use std::sync::Arc;

use async_trait::async_trait;
use mf_core::{ArtifactRef, FailureKind};
use mf_tools::tools::REPAIR;
use mf_tools::ToolRegistry;

use super::{
    accepted_input, command_failure, required_tool, tool_command, transcript_log, MESH_EXTENSIONS,
};
use crate::stage::{StageExecutor, StageOutcome, StageRequest};

const OUTPUT_NAME: &str = "repaired.stl";

/// Runs `<repair command...> <input> <dir>/repaired.stl`.
pub struct RepairStage {
    tools: Arc<ToolRegistry>,
}

impl RepairStage {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StageExecutor for RepairStage {
    fn name(&self) -> &'static str {
        "repair"
    }

    async fn execute(&self, request: &StageRequest) -> StageOutcome {
        let input = match accepted_input(request, MESH_EXTENSIONS) {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let repair = match required_tool(&self.tools, REPAIR) {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };

        let output = request.output_dir.join(OUTPUT_NAME);
        let result = tool_command(repair, request)
            .arg_path(input)
            .arg_path(&output)
            .execute()
            .await;

        match result {
            Ok(out) if output.is_file() => StageOutcome::success(
                vec![ArtifactRef::new(output)],
                transcript_log(&out.output),
            ),
            Ok(_) => StageOutcome::failure(
                FailureKind::MalformedOutput,
                format!("repair command did not write {OUTPUT_NAME}"),
            ),
            Err(e) => command_failure(e),
        }
    }
}
