//! mf-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other mf-* crates,
//! providing type-safe identifiers, a unified error type, the job domain
//! model, application configuration, a broadcast event bus, and the
//! [`JobStore`](store::JobStore) / [`TaskQueue`](queue::TaskQueue) contracts
//! the orchestrator is written against.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod queue;
pub mod store;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Rejection, Result};
pub use ids::*;
pub use model::*;
