//! External tool detection and management.
//!
//! The [`ToolRegistry`] discovers and caches the locations of the external
//! CLI tools the pipeline drives (Blender for validation, a CLI slicer for
//! 3MF extraction and slicing, and a mesh repair command) and provides
//! lookup methods for the stage adapters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mf_core::config::ToolsConfig;
use serde::{Deserialize, Serialize};

pub const BLENDER: &str = "blender";
pub const SLICER: &str = "slicer";
pub const REPAIR: &str = "repair";

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &[BLENDER, SLICER, REPAIR];

/// Executables searched in `PATH` for the slicer, in order.
const SLICER_CANDIDATES: &[&str] = &["prusa-slicer", "PrusaSlicer", "bambu-studio", "orca-slicer"];

/// A resolved external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Registry name (e.g. "slicer").
    pub name: String,
    /// Resolved path to the executable.
    pub path: PathBuf,
    /// Arguments placed before any per-invocation arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base_args: Vec<String>,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found.
    pub available: bool,
    /// Version string (first line of `--version` output), if available.
    pub version: Option<String>,
    /// Resolved path to the executable.
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool configurations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

/// Use `custom` if it exists, otherwise look each candidate up in `PATH`.
fn resolve(custom: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(p) = custom {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        if let Ok(found) = which::which(p) {
            return Some(found);
        }
        tracing::warn!("Configured tool path {} does not exist", p.display());
    }
    candidates.iter().find_map(|c| which::which(c).ok())
}

impl ToolRegistry {
    /// Discover tools by searching `PATH` (or using overrides from config).
    ///
    /// A configured path that exists is used directly. Otherwise
    /// [`which::which`] locates the tool. Tools that are not found are
    /// omitted from the registry; stages that need them report
    /// `UnsupportedInput`. So is a repair command whose script argument is
    /// missing.
    pub fn discover(tools_config: &ToolsConfig) -> Self {
        let mut registry = Self::default();

        if let Some(path) = resolve(tools_config.blender_path.as_deref(), &[BLENDER]) {
            registry.insert(ToolConfig {
                name: BLENDER.into(),
                path,
                base_args: Vec::new(),
            });
        }

        if let Some(path) = resolve(tools_config.slicer_path.as_deref(), SLICER_CANDIDATES) {
            registry.insert(ToolConfig {
                name: SLICER.into(),
                path,
                base_args: Vec::new(),
            });
        }

        let missing_scripts = tools_config.missing_repair_scripts();
        for script in &missing_scripts {
            tracing::warn!("Repair script {} does not exist", script.display());
        }
        if let Some((program, rest)) = tools_config
            .repair_command
            .split_first()
            .filter(|_| missing_scripts.is_empty())
        {
            if let Some(path) = resolve(Some(Path::new(program)), &[]) {
                registry.insert(ToolConfig {
                    name: REPAIR.into(),
                    path,
                    base_args: rest.to_vec(),
                });
            }
        }

        for name in KNOWN_TOOLS {
            match registry.tools.get(*name) {
                Some(cfg) => tracing::debug!(tool = name, path = %cfg.path.display(), "Tool found"),
                None => tracing::warn!(tool = name, "Tool not found"),
            }
        }

        registry
    }

    /// Register or replace a tool.
    pub fn insert(&mut self, tool: ToolConfig) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.get(name)
    }

    /// Return a reference to the [`ToolConfig`] for the given tool, or an
    /// [`mf_core::Error::Tool`] if the tool was not found during discovery.
    pub fn require(&self, name: &str) -> mf_core::Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            mf_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(&cfg.path),
                    path: Some(cfg.path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }

    /// Iterate over all registered tool configs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolConfig)> {
        self.tools.iter()
    }
}

/// Run `<tool> --version` and return the first non-empty line of output.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|s| s.to_string())
}
