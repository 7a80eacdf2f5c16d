//! Database query modules.

pub mod jobs;
pub mod stage_results;
pub mod tasks;
