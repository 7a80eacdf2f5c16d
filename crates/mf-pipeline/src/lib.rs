//! # mf-pipeline
//!
//! Orchestration of multi-stage 3D model processing jobs.
//!
//! This crate provides:
//!
//! - **[`StageExecutor`]** trait -- one pipeline stage: run an external tool
//!   on the current artifact and report a typed [`StageOutcome`].
//! - **Built-in stages** ([`stages`]) -- convert (3MF extraction), validate,
//!   repair, slice.
//! - **[`PipelineDefinition`]** -- ordered stage descriptors with per-format
//!   branches, checked at startup.
//! - **[`RetryPolicy`]** -- transient failure classification and backoff.
//! - **[`aggregate`]** -- folds stage results into the client-facing report.
//! - **[`PipelineExecutor`]** -- drives one job through its stages, persisting
//!   every transition, and resumes cleanly on redelivery.

pub mod definition;
pub mod executor;
pub mod factory;
pub mod report;
pub mod retry;
pub mod stage;
pub mod stages;

// Re-export key types at the crate root.
pub use definition::{PipelineDefinition, StageDescriptor};
pub use executor::{PipelineExecutor, RunOutcome};
pub use factory::StageRegistry;
pub use report::{aggregate, AdvisoryRule};
pub use retry::RetryPolicy;
pub use stage::{StageExecutor, StageOutcome, StageRequest};
