//! Axum router construction.
//!
//! Builds the application router with all route groups, middleware layers
//! and the OpenAPI document.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::context::AppContext;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    info(title = "meshforge", description = "3D model processing jobs"),
    paths(
        routes::jobs::list_jobs,
        routes::jobs::submit_job,
        routes::jobs::get_job,
        routes::jobs::download_result,
        routes::admin::dashboard,
        routes::admin::tools,
    ),
    components(schemas(
        routes::jobs::JobResponse,
        routes::jobs::UploadForm,
        routes::admin::DashboardResponse,
        routes::admin::DashboardJobs,
        routes::admin::ToolResponse,
    ))
)]
pub struct ApiDoc;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/jobs",
            get(routes::jobs::list_jobs)
                // Uploads are size-checked while streaming to disk.
                .post(routes::jobs::submit_job)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/jobs/{id}", get(routes::jobs::get_job))
        .route("/jobs/{id}/file", get(routes::jobs::download_result))
        .route("/events", get(routes::events::events_handler))
        .route("/dashboard", get(routes::admin::dashboard))
        .route("/tools", get(routes::admin::tools))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }));

    Router::new()
        .route("/health", get(routes::admin::health))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
