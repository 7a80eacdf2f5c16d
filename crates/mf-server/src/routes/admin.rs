//! Dashboard, tool availability and health handlers.

use axum::extract::State;
use axum::Json;
use mf_core::JobState;
use mf_core::queue::TaskQueue;
use serde::Serialize;

use crate::context::AppContext;
use crate::error::AppError;

/// Job counts and queue depth.
#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct DashboardResponse {
    pub jobs: DashboardJobs,
    /// Entries waiting in or leased from the task queue.
    pub queue_depth: usize,
    pub recent_events: usize,
}

/// Job count per state.
#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct DashboardJobs {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Availability of one external tool.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ToolResponse {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}

/// GET /api/dashboard
#[utoipa::path(
    get,
    path = "/api/dashboard",
    responses(
        (status = 200, description = "Job statistics", body = DashboardResponse)
    )
)]
pub async fn dashboard(State(ctx): State<AppContext>) -> Result<Json<DashboardResponse>, AppError> {
    let counts = {
        let conn = mf_db::pool::get_conn(&ctx.db)?;
        mf_db::queries::jobs::count_by_state(&conn)?
    };

    let mut jobs = DashboardJobs::default();
    for (state, n) in counts {
        match state {
            JobState::Pending => jobs.pending = n,
            JobState::Running => jobs.running = n,
            JobState::Succeeded => jobs.succeeded = n,
            JobState::Failed => jobs.failed = n,
        }
    }

    Ok(Json(DashboardResponse {
        jobs,
        queue_depth: ctx.queue.len().await?,
        recent_events: ctx.event_bus.recent_events(100).len(),
    }))
}

/// GET /api/tools
#[utoipa::path(
    get,
    path = "/api/tools",
    responses(
        (status = 200, description = "External tool availability", body = Vec<ToolResponse>)
    )
)]
pub async fn tools(State(ctx): State<AppContext>) -> Json<Vec<ToolResponse>> {
    let infos = ctx
        .tools
        .check_all()
        .into_iter()
        .map(|info| ToolResponse {
            name: info.name,
            available: info.available,
            version: info.version,
            path: info.path.map(|p| p.display().to_string()),
        })
        .collect();
    Json(infos)
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
