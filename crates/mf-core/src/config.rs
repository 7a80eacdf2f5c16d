//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries all
//! sub-configs for the server, artifact storage, external tools, retry policy,
//! queue and pipeline layout. Every section defaults sensibly so an empty
//! file is valid. Environment variables override the tool and storage
//! settings after the file is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{ArtifactKind, InputFormat};

/// Locations searched when no config path is given.
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./meshforge.toml",
    "./config.toml",
    "~/.config/meshforge/config.toml",
    "/etc/meshforge/config.toml",
];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    /// Ordered stage descriptors. Stages with `only_for` set are skipped for
    /// other input formats.
    pub pipeline: Vec<StageConfig>,
    /// Log signatures that add an advisory warning to the report.
    pub advisories: Vec<AdvisoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            tools: ToolsConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            pipeline: default_pipeline(),
            advisories: default_advisories(),
        }
    }
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Load config from `custom_path`, else the first default location that
    /// exists, else defaults. Environment overrides are applied in every case.
    pub fn load_or_default(custom_path: Option<&Path>) -> Result<Self> {
        let mut config = match custom_path {
            Some(path) => Self::load(path)?,
            None => {
                let found = DEFAULT_CONFIG_PATHS.iter().find_map(|p| {
                    let expanded = shellexpand::tilde(p);
                    let path = PathBuf::from(expanded.as_ref());
                    path.exists().then_some(path)
                });
                match found {
                    Some(path) => {
                        tracing::info!("Loading config from {}", path.display());
                        Self::load(&path)?
                    }
                    None => {
                        tracing::info!("No config file found; using defaults");
                        Self::default()
                    }
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("BLENDER_BIN") {
            self.tools.blender_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BLENDER_SCRIPT") {
            self.tools.validate_script = PathBuf::from(v);
        }
        if let Some(v) = get("SLICER_BIN") {
            self.tools.slicer_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("REPAIR_CMD") {
            let parts: Vec<String> = v.split_whitespace().map(String::from).collect();
            if !parts.is_empty() {
                self.tools.repair_command = parts;
            }
        }
        if let Some(v) = get("MAX_FILE_SIZE_MB") {
            match v.parse() {
                Ok(mb) => self.server.max_upload_mb = mb,
                Err(_) => tracing::warn!("Ignoring invalid MAX_FILE_SIZE_MB={v}"),
            }
        }
        if let Some(v) = get("UPLOAD_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }
        if self.server.workers == 0 {
            warnings.push("server.workers is 0; no jobs will be processed".into());
        }
        if self.server.max_upload_mb == 0 {
            warnings.push("server.max_upload_mb is 0; every upload will be rejected".into());
        }
        if self.retry.stage_timeout_secs == 0 {
            warnings.push("retry.stage_timeout_secs is 0; every stage will time out".into());
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            warnings.push("retry.backoff_base_ms exceeds retry.backoff_max_ms".into());
        }
        if self.queue.lease_secs < MIN_LEASE_SECS {
            warnings.push(format!(
                "queue.lease_secs is below {MIN_LEASE_SECS}; using {MIN_LEASE_SECS}"
            ));
        }
        if self.tools.validate_script.as_os_str().is_empty() {
            warnings.push("tools.validate_script is not set; validate stages will fail".into());
        } else if !self.tools.validate_script.is_file() {
            warnings.push(format!(
                "tools.validate_script {} does not exist; validate stages will fail",
                self.tools.validate_script.display()
            ));
        }
        if self.tools.repair_command.is_empty() {
            warnings.push("tools.repair_command is empty; repair stages will fail".into());
        }
        for script in self.tools.missing_repair_scripts() {
            warnings.push(format!(
                "tools.repair_command script {} does not exist; repair stages will fail",
                script.display()
            ));
        }
        if self.pipeline.is_empty() {
            warnings.push("pipeline has no stages".into());
        }
        for (i, adv) in self.advisories.iter().enumerate() {
            if adv.token.trim().is_empty() {
                warnings.push(format!("advisories[{i}].token is empty"));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Upload size limit in MiB.
    pub max_upload_mb: u64,
    /// Number of concurrent pipeline workers.
    pub workers: usize,
}

impl ServerConfig {
    /// Upload size limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_path: PathBuf::from("./data/meshforge.db"),
            max_upload_mb: 100,
            workers: 2,
        }
    }
}

/// Artifact storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for per-job working directories and staged uploads.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/artifacts"),
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Headless Blender used for validation. Discovered in `PATH` when unset.
    pub blender_path: Option<PathBuf>,
    /// Script Blender runs to validate a model; its last output line must be
    /// a JSON object.
    pub validate_script: PathBuf,
    /// CLI slicer used for 3MF extraction and slicing. Discovered in `PATH`
    /// when unset.
    pub slicer_path: Option<PathBuf>,
    /// Mesh repair command; input and output paths are appended.
    pub repair_command: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            blender_path: None,
            validate_script: PathBuf::new(),
            slicer_path: None,
            repair_command: Vec::new(),
        }
    }
}

/// Interpreter script extensions recognised in `repair_command` arguments.
const SCRIPT_EXTENSIONS: &[&str] = &["py", "sh", "pl", "rb", "js"];

impl ToolsConfig {
    /// Arguments of `repair_command` that name a script file which does not
    /// exist. A missing script makes every repair fail the same way.
    pub fn missing_repair_scripts(&self) -> Vec<PathBuf> {
        self.repair_command
            .iter()
            .skip(1)
            .filter(|arg| names_script(arg))
            .map(PathBuf::from)
            .filter(|path| !path.is_file())
            .collect()
    }
}

fn names_script(arg: &str) -> bool {
    if arg.starts_with('-') {
        return false;
    }
    arg.contains(std::path::MAIN_SEPARATOR)
        || Path::new(arg)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SCRIPT_EXTENSIONS.contains(&e))
}

/// Stage retry and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries available to a job across all of its stages.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Treat `ToolCrashed` as transient. Timeouts are always transient.
    pub retry_on_crash: bool,
    /// Default per-stage timeout.
    pub stage_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            retry_on_crash: true,
            stage_timeout_secs: 3_600,
        }
    }
}

/// Task queue lease and polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a delivery stays leased without a heartbeat before it is
    /// handed to another worker.
    pub lease_secs: u64,
    /// Fallback polling interval while waiting for work.
    pub poll_interval_ms: u64,
}

/// Shortest lease honoured; the heartbeat renews at a third of it.
pub const MIN_LEASE_SECS: u64 = 3;

impl QueueConfig {
    /// Effective lease, shared by the queue and the worker heartbeat.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(MIN_LEASE_SECS))
    }

    /// How often a worker renews its lease.
    pub fn heartbeat(&self) -> Duration {
        self.lease() / 3
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_secs: 600,
            poll_interval_ms: 1_000,
        }
    }
}

/// One stage descriptor as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Adapter key: `convert`, `validate`, `repair` or `slice`.
    pub executor: String,
    /// Artifact kind the stage consumes.
    pub input: ArtifactKind,
    /// Artifact kind the stage produces, if it produces files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ArtifactKind>,
    /// Restrict the stage to these input formats (empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only_for: Vec<InputFormat>,
    /// Per-stage timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extra arguments passed through to the tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl StageConfig {
    fn new(name: &str, input: ArtifactKind, output: Option<ArtifactKind>) -> Self {
        Self {
            name: name.into(),
            executor: name.into(),
            input,
            output,
            only_for: Vec::new(),
            timeout_secs: None,
            args: Vec::new(),
        }
    }
}

/// Default layout: extract archives, then validate, repair, slice.
pub fn default_pipeline() -> Vec<StageConfig> {
    let mut convert = StageConfig::new(
        "convert",
        ArtifactKind::PackagedArchive,
        Some(ArtifactKind::Mesh),
    );
    convert.only_for = vec![InputFormat::ThreeMf];

    vec![
        convert,
        StageConfig::new("validate", ArtifactKind::Mesh, None),
        StageConfig::new("repair", ArtifactKind::Mesh, Some(ArtifactKind::Mesh)),
        StageConfig::new("slice", ArtifactKind::Mesh, Some(ArtifactKind::Sliced)),
    ]
}

/// A log signature that adds an advisory warning to the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Substring searched for in every stage log.
    pub token: String,
    /// Warning `type` field.
    pub kind: String,
    pub message: String,
}

/// Default advisories.
pub fn default_advisories() -> Vec<AdvisoryConfig> {
    vec![AdvisoryConfig {
        token: "Low bed adhesion".into(),
        kind: "SLICING".into(),
        message: "Detected print stability issues: Low bed adhesion. \
                  Consider enabling supports and brim."
            .into(),
    }]
}
