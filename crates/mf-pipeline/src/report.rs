//! Result aggregation: fold a job's stage results into its [`Report`].

use mf_core::config::AdvisoryConfig;
use mf_core::{Report, StageResult, StageStatus, StageSummary, Warning};
use serde_json::Value;

use crate::definition::StageDescriptor;

/// Executor key of the stage whose log becomes `Report::validation`.
const VALIDATE_EXECUTOR: &str = "validate";
/// Executor key whose success sets `Report::slicing_status`.
const SLICE_EXECUTOR: &str = "slice";
const VALIDATION_WARNING: &str = "VALIDATION";

/// A log signature mapped to a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryRule {
    /// Substring searched for in stage log strings.
    pub token: String,
    pub kind: String,
    pub message: String,
}

impl From<&AdvisoryConfig> for AdvisoryRule {
    fn from(cfg: &AdvisoryConfig) -> Self {
        Self {
            token: cfg.token.clone(),
            kind: cfg.kind.clone(),
            message: cfg.message.clone(),
        }
    }
}

/// Whether any string anywhere inside `value` contains `token`.
fn log_contains(value: &Value, token: &str) -> bool {
    match value {
        Value::String(s) => s.contains(token),
        Value::Array(items) => items.iter().any(|v| log_contains(v, token)),
        Value::Object(map) => map.values().any(|v| log_contains(v, token)),
        _ => false,
    }
}

/// Warnings a validator reported in its `warnings` array.
fn validator_warnings(log: &Value) -> Vec<Warning> {
    let Some(items) = log.get("warnings").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Warning {
                kind: VALIDATION_WARNING.into(),
                message: s.clone(),
            }),
            Value::Object(obj) => {
                let message = obj.get("message")?.as_str()?.to_string();
                let kind = obj
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(VALIDATION_WARNING)
                    .to_string();
                Some(Warning { kind, message })
            }
            _ => None,
        })
        .collect()
}

fn push_unique(warnings: &mut Vec<Warning>, warning: Warning) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

/// Build the report for a finished job.
///
/// `stages` is the resolved pipeline the results came from; it tells which
/// stage is the validator and which is the slicer.
pub fn aggregate(
    stages: &[&StageDescriptor],
    results: &[StageResult],
    rules: &[AdvisoryRule],
) -> Report {
    let latest_ok = |executor: &str| {
        stages
            .iter()
            .filter(|d| d.executor == executor)
            .filter_map(|d| {
                results
                    .iter()
                    .rev()
                    .find(|r| r.stage_name == d.name)
                    .filter(|r| r.is_ok())
            })
            .last()
    };

    let validation = latest_ok(VALIDATE_EXECUTOR).map(|r| r.log.clone());
    let slicing_status = latest_ok(SLICE_EXECUTOR).map(|_| "SUCCESS".to_string());

    let mut summaries: Vec<StageSummary> = Vec::new();
    for result in results {
        match summaries.iter_mut().find(|s| s.name == result.stage_name) {
            Some(summary) => {
                summary.attempts += 1;
                summary.status = result.status;
                summary.duration_ms += result.duration.as_millis() as u64;
            }
            None => summaries.push(StageSummary {
                name: result.stage_name.clone(),
                attempts: 1,
                status: result.status,
                duration_ms: result.duration.as_millis() as u64,
            }),
        }
    }

    let mut warnings = Vec::new();
    if let Some(log) = &validation {
        for w in validator_warnings(log) {
            push_unique(&mut warnings, w);
        }
    }
    for rule in rules {
        let hit = results
            .iter()
            .filter(|r| r.status == StageStatus::Ok)
            .any(|r| log_contains(&r.log, &rule.token));
        if hit {
            push_unique(
                &mut warnings,
                Warning {
                    kind: rule.kind.clone(),
                    message: rule.message.clone(),
                },
            );
        }
    }

    Report {
        validation,
        stages: summaries,
        warnings,
        slicing_status,
    }
}
