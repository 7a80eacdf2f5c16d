//! Pipeline layout: which stages run, in what order, for which inputs.

use std::collections::HashSet;
use std::time::Duration;

use mf_core::config::StageConfig;
use mf_core::{ArtifactKind, Error, InputFormat, Result};

/// One configured stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub name: String,
    /// Key into the [`StageRegistry`](crate::StageRegistry).
    pub executor: String,
    /// Artifact kind consumed.
    pub input: ArtifactKind,
    /// Artifact kind produced, if the stage produces files.
    pub output: Option<ArtifactKind>,
    /// Input formats this stage applies to; empty means all.
    pub only_for: Vec<InputFormat>,
    /// Per-stage timeout override.
    pub timeout: Option<Duration>,
    /// Extra tool arguments.
    pub args: Vec<String>,
}

impl StageDescriptor {
    pub fn new(
        name: impl Into<String>,
        executor: impl Into<String>,
        input: ArtifactKind,
        output: Option<ArtifactKind>,
    ) -> Self {
        Self {
            name: name.into(),
            executor: executor.into(),
            input,
            output,
            only_for: Vec::new(),
            timeout: None,
            args: Vec::new(),
        }
    }

    /// Restrict the stage to the given input formats.
    pub fn only_for(mut self, formats: impl IntoIterator<Item = InputFormat>) -> Self {
        self.only_for = formats.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether this stage runs for jobs of `format`.
    pub fn applies_to(&self, format: InputFormat) -> bool {
        self.only_for.is_empty() || self.only_for.contains(&format)
    }
}

impl From<&StageConfig> for StageDescriptor {
    fn from(cfg: &StageConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            executor: cfg.executor.clone(),
            input: cfg.input,
            output: cfg.output,
            only_for: cfg.only_for.clone(),
            timeout: cfg.timeout_secs.map(Duration::from_secs),
            args: cfg.args.clone(),
        }
    }
}

/// Ordered list of stage descriptors shared by all jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    stages: Vec<StageDescriptor>,
}

impl PipelineDefinition {
    pub fn new(stages: Vec<StageDescriptor>) -> Self {
        Self { stages }
    }

    pub fn from_config(stages: &[StageConfig]) -> Self {
        Self::new(stages.iter().map(StageDescriptor::from).collect())
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// The stages a job of `format` runs, in order.
    pub fn resolve(&self, format: InputFormat) -> Vec<&StageDescriptor> {
        self.stages.iter().filter(|s| s.applies_to(format)).collect()
    }

    /// Reject layouts that cannot run.
    ///
    /// Stage names must be unique. For every supported input format, each
    /// resolved stage must consume an artifact kind that the upload or an
    /// earlier stage provides, and the last stage must produce one.
    pub fn check(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::pipeline("definition", "pipeline has no stages"));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(Error::pipeline(
                    stage.name.as_str(),
                    "duplicate stage name",
                ));
            }
        }

        for format in InputFormat::ALL {
            let plan = self.resolve(format);
            let mut available = HashSet::from([format.artifact_kind()]);

            for stage in &plan {
                if !available.contains(&stage.input) {
                    return Err(Error::pipeline(
                        stage.name.as_str(),
                        format!(
                            "no {} artifact is available for .{} inputs",
                            stage.input,
                            format.extension()
                        ),
                    ));
                }
                if let Some(out) = stage.output {
                    available.insert(out);
                }
            }

            match plan.last() {
                None => {
                    return Err(Error::pipeline(
                        "definition",
                        format!("no stages apply to .{} inputs", format.extension()),
                    ))
                }
                Some(last) if last.output.is_none() => {
                    return Err(Error::pipeline(
                        last.name.as_str(),
                        "the final stage must produce an artifact",
                    ))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self::from_config(&mf_core::config::default_pipeline())
    }
}
