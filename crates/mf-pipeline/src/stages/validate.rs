//! Geometric validation in headless Blender.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mf_core::FailureKind;
use mf_tools::output::parse_last_json_line;
use mf_tools::tools::BLENDER;
use mf_tools::ToolRegistry;
use serde_json::Value;

use super::{accepted_input, command_failure, required_tool, tail, tool_command, MESH_EXTENSIONS};
use crate::stage::{StageExecutor, StageOutcome, StageRequest};

/// Runs `<blender> -b -P <script> -- <model>`.
///
/// The script must print its findings as a JSON object on the last line of
/// output; that object becomes the stage log.
pub struct ValidateStage {
    tools: Arc<ToolRegistry>,
    script: PathBuf,
}

impl ValidateStage {
    pub fn new(tools: Arc<ToolRegistry>, script: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            script: script.into(),
        }
    }
}

#[async_trait]
impl StageExecutor for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn execute(&self, request: &StageRequest) -> StageOutcome {
        let input = match accepted_input(request, MESH_EXTENSIONS) {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let blender = match required_tool(&self.tools, BLENDER) {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };
        if !self.script.is_file() {
            return StageOutcome::failure(
                FailureKind::UnsupportedInput,
                format!("validation script {} not found", self.script.display()),
            );
        }

        let result = tool_command(blender, request)
            .arg("-b")
            .arg("-P")
            .arg_path(&self.script)
            .arg("--")
            .arg_path(input)
            .execute()
            .await;

        match result {
            Ok(out) => match parse_last_json_line(&out.output) {
                Some(record) => StageOutcome::success(Vec::new(), Value::Object(record)),
                None => StageOutcome::failure(
                    FailureKind::MalformedOutput,
                    format!(
                        "validator did not end its output with a JSON object: {}",
                        tail(out.output.trim(), 512)
                    ),
                ),
            },
            Err(e) => command_failure(e),
        }
    }
}
