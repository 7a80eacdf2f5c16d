//! Service-oriented application context.
//!
//! [`AppContext`] is the central struct shared across all route handlers via
//! Axum state and by the background workers. It only holds `Arc`s, so it is
//! cheap to clone.

use std::sync::Arc;
use std::time::Duration;

use mf_core::config::Config;
use mf_core::events::EventBus;
use mf_core::queue::TaskQueue;
use mf_core::store::JobStore;
use mf_core::Result;
use mf_db::{DbPool, SqliteJobStore, SqliteTaskQueue};
use mf_pipeline::{AdvisoryRule, PipelineDefinition, PipelineExecutor, RetryPolicy, StageRegistry};
use mf_tools::{ArtifactStore, ToolRegistry};

use crate::admission::Admission;

/// Application context shared by all request handlers (via Axum state).
#[derive(Clone)]
pub struct AppContext {
    /// Database connection pool, for read-only dashboards.
    pub db: DbPool,
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<SqliteTaskQueue>,
    pub artifacts: Arc<ArtifactStore>,
    /// External tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Broadcast event bus for SSE.
    pub event_bus: Arc<EventBus>,
    pub executor: Arc<PipelineExecutor>,
    pub admission: Arc<Admission>,
}

impl AppContext {
    /// Wire every component from `config`.
    ///
    /// # Errors
    ///
    /// Fails if the artifact root cannot be created or the pipeline layout
    /// does not resolve against `stages`.
    pub fn new(
        config: Config,
        db: DbPool,
        tools: Arc<ToolRegistry>,
        stages: StageRegistry,
    ) -> Result<Self> {
        let definition = PipelineDefinition::from_config(&config.pipeline);
        definition.check()?;
        stages.check(&definition)?;

        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let queue = Arc::new(SqliteTaskQueue::new(
            db.clone(),
            config.queue.lease(),
            Duration::from_millis(config.queue.poll_interval_ms),
        ));
        let artifacts = Arc::new(ArtifactStore::new(&config.storage.root)?);
        let event_bus = Arc::new(EventBus::default());

        let executor = PipelineExecutor::new(
            store.clone(),
            artifacts.clone(),
            Arc::new(definition),
            stages,
        )
        .with_retry(RetryPolicy::from_config(&config.retry))
        .with_default_timeout(Duration::from_secs(config.retry.stage_timeout_secs))
        .with_advisories(config.advisories.iter().map(AdvisoryRule::from).collect())
        .with_events(event_bus.clone());

        let admission = Admission::new(
            store.clone(),
            queue.clone() as Arc<dyn TaskQueue>,
            artifacts.clone(),
            event_bus.clone(),
        )
        .with_max_upload_bytes(config.server.max_upload_bytes())
        .with_max_retries(config.retry.max_retries);

        Ok(Self {
            db,
            config: Arc::new(config),
            store,
            queue,
            artifacts,
            tools,
            event_bus,
            executor: Arc::new(executor),
            admission: Arc::new(admission),
        })
    }
}
