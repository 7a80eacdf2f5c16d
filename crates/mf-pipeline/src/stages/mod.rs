//! Built-in stage adapters.
//!
//! Each adapter wraps one external tool. They share input checking, command
//! construction and the mapping from [`CommandError`] to a typed
//! [`StageOutcome`] failure; what differs is the argument list and how the
//! produced files are found.

mod convert;
mod repair;
mod slice;
mod validate;

pub use convert::ConvertStage;
pub use repair::RepairStage;
pub use slice::SliceStage;
pub use validate::ValidateStage;

use std::path::Path;

use mf_core::FailureKind;
use mf_tools::{CommandError, ToolCommand, ToolConfig, ToolRegistry};
use serde_json::json;

use crate::stage::{StageOutcome, StageRequest};

/// Extensions of directly processable mesh files.
pub(crate) const MESH_EXTENSIONS: &[&str] = &["obj", "stl", "glb", "gltf"];

/// Tool transcripts kept in stage logs are truncated to their tail.
const MAX_TRANSCRIPT_BYTES: usize = 64 * 1024;

/// The primary input, if its extension is one of `accepted`.
pub(crate) fn accepted_input<'a>(
    request: &'a StageRequest,
    accepted: &[&str],
) -> Result<&'a Path, StageOutcome> {
    let input = request.input().ok_or_else(|| {
        StageOutcome::failure(FailureKind::UnsupportedInput, "stage received no input")
    })?;
    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !accepted.contains(&ext.as_str()) {
        return Err(StageOutcome::failure(
            FailureKind::UnsupportedInput,
            format!(
                "{} does not accept .{ext} input (expected one of: {})",
                request.config.name,
                accepted.join(", ")
            ),
        ));
    }
    if !input.is_file() {
        return Err(StageOutcome::failure(
            FailureKind::UnsupportedInput,
            format!("input {} does not exist", input.display()),
        ));
    }
    Ok(input)
}

/// Look up a tool, reporting a missing one as unsupported input.
pub(crate) fn required_tool<'a>(
    tools: &'a ToolRegistry,
    name: &str,
) -> Result<&'a ToolConfig, StageOutcome> {
    tools.get(name).ok_or_else(|| {
        StageOutcome::failure(
            FailureKind::UnsupportedInput,
            format!("{name} is not available on this host"),
        )
    })
}

/// A command for `tool` running in the request's output directory.
pub(crate) fn tool_command(tool: &ToolConfig, request: &StageRequest) -> ToolCommand {
    let mut cmd = ToolCommand::new(tool.path.clone());
    cmd.args(tool.base_args.iter().cloned())
        .args(request.config.args.iter().cloned())
        .timeout(request.timeout)
        .current_dir(&request.output_dir);
    cmd
}

/// The last `max` bytes of `text`, cut at a character boundary.
pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Structured log carrying a tool transcript.
pub(crate) fn transcript_log(output: &str) -> serde_json::Value {
    json!({ "output": tail(output, MAX_TRANSCRIPT_BYTES) })
}

/// Map a failed invocation to a stage failure.
pub(crate) fn command_failure(err: CommandError) -> StageOutcome {
    let kind = match &err {
        CommandError::TimedOut { .. } => FailureKind::ToolTimedOut,
        CommandError::Spawn { .. } | CommandError::Failed { .. } | CommandError::Wait { .. } => {
            FailureKind::ToolCrashed
        }
    };
    let detail = tail(err.output().trim(), 2048);
    let message = if detail.is_empty() {
        err.to_string()
    } else {
        format!("{err}: {detail}")
    };
    StageOutcome::failure(kind, message)
}
