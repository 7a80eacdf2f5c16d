//! mf-db: SQLite persistence for jobs and the task queue.
//!
//! Provides an r2d2 connection pool with embedded migrations, row mapping
//! for the job model, raw query modules, and the two orchestrator-facing
//! implementations: [`SqliteJobStore`](store::SqliteJobStore) and
//! [`SqliteTaskQueue`](queue::SqliteTaskQueue).

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod queue;
pub mod store;

pub use pool::{init_memory_pool, init_pool, DbPool};
pub use queue::SqliteTaskQueue;
pub use store::SqliteJobStore;
