//! # mf-tools
//!
//! External tool plumbing for the meshforge pipeline.
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to
//!   Blender, the CLI slicer and the mesh repair command.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout,
//!   working directory and merged output capture.
//! - **Artifact storage** ([`ArtifactStore`]) -- per-job directories with
//!   stage scratch space, sealing and purge.
//! - **Output helpers** ([`output`]) -- locate produced files and parse
//!   structured tool output.

pub mod artifacts;
pub mod command;
pub mod output;
pub mod tools;

pub use artifacts::ArtifactStore;
pub use command::{CommandError, ToolCommand, ToolOutput};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
