//! HTTP API tests: admission, status, listing, download and service routes.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use mf_core::queue::TaskQueue;

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_creates_pending_job() {
    let harness = TestHarness::new();
    let (status, json) = harness.upload("Cube.STL", b"solid cube\n").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["state"], "pending");
    assert_eq!(json["input_format"], "stl");
    assert_eq!(json["retry_count"], 0);
    assert_eq!(json["max_retries"], 3);
    assert!(json["download_url"].is_null());
    assert_eq!(harness.ctx.queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let harness = TestHarness::new();
    let (status, json) = harness.upload("payload.exe", b"MZ").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "unsupported_extension");
    assert!(harness.ctx.store.list(None, 0, 10).unwrap().is_empty());
    assert_eq!(harness.ctx.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let harness = TestHarness::builder().max_upload_mb(1).build();
    let body = vec![b'x'; 1024 * 1024 + 1];
    let (status, json) = harness.upload("huge.stl", &body).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["code"], "file_too_large");
    assert!(harness.ctx.store.list(None, 0, 10).unwrap().is_empty());
    // The partial upload is not left in staging.
    let staged = std::fs::read_dir(harness.ctx.artifacts.staging_dir())
        .unwrap()
        .count();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let harness = TestHarness::new();
    let req = axum::http::Request::post("/api/jobs")
        .header("content-type", "multipart/form-data; boundary=x")
        .body(axum::body::Body::from("--x--\r\n"))
        .unwrap();
    let (status, json) = harness.request(req).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "validation_error");
}

// ---------------------------------------------------------------------------
// Status and listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_404() {
    let harness = TestHarness::new();
    let id = mf_core::JobId::new();
    let (status, json) = harness.get(&format!("/api/jobs/{id}")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "not_found");
}

#[tokio::test]
async fn malformed_job_id_is_400() {
    let harness = TestHarness::new();
    let (status, _) = harness.get("/api/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_filters_by_state() {
    let harness = TestHarness::new();
    let done = harness.submit("a.stl", b"solid a\n").await;
    harness.run_next().await;
    let waiting = harness.submit("b.obj", b"o b\n").await;

    let (status, all) = harness.get("/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, pending) = harness.get("/api/jobs?state=pending").await;
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], waiting.to_string());

    let (_, succeeded) = harness.get("/api/jobs?state=succeeded").await;
    assert_eq!(succeeded[0]["id"], done.to_string());

    let (status, _) = harness.get("/api/jobs?state=exploded").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn download_before_completion_is_409() {
    let harness = TestHarness::new();
    let id = harness.submit("cube.stl", b"solid cube\n").await;

    let (status, json) = harness.get(&format!("/api/jobs/{id}/file")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "not_ready");
}

#[tokio::test]
async fn download_of_reclaimed_result_is_410() {
    let harness = TestHarness::new();
    let id = harness.submit("cube.stl", b"solid cube\n").await;
    harness.run_next().await;

    // Reclamation happens outside the service.
    harness.ctx.artifacts.purge(id).unwrap();

    let (status, json) = harness.get(&format!("/api/jobs/{id}/file")).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(json["code"], "result_expired");
}

#[tokio::test]
async fn download_sets_attachment_name() {
    let harness = TestHarness::new();
    let id = harness.submit("cube.stl", b"solid cube\n").await;
    harness.run_next().await;

    let response = tower::ServiceExt::oneshot(
        mf_server::router::build_router(harness.ctx.clone()),
        axum::http::Request::get(format!("/api/jobs/{id}/file"))
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(disposition, "attachment; filename=\"model.gcode\"");
}

// ---------------------------------------------------------------------------
// Service routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok() {
    let harness = TestHarness::new();
    let (status, json) = harness.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn tools_lists_every_tool() {
    let harness = TestHarness::builder().without_slicer().build();
    let (status, json) = harness.get("/api/tools").await;
    assert_eq!(status, StatusCode::OK);

    let tools = json.as_array().unwrap();
    assert_eq!(tools.len(), 3);
    let slicer = tools.iter().find(|t| t["name"] == "slicer").unwrap();
    assert_eq!(slicer["available"], false);
    let blender = tools.iter().find(|t| t["name"] == "blender").unwrap();
    assert_eq!(blender["available"], true);
}

#[tokio::test]
async fn dashboard_counts_jobs() {
    let harness = TestHarness::new();
    harness.submit("a.stl", b"solid a\n").await;
    harness.submit("b.stl", b"solid b\n").await;

    let (status, json) = harness.get("/api/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["jobs"]["pending"], 2);
    assert_eq!(json["queue_depth"], 2);
}

#[tokio::test]
async fn openapi_document_lists_job_routes() {
    let harness = TestHarness::new();
    let (status, json) = harness.get("/api/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["paths"]["/api/jobs"].is_object());
    assert!(json["paths"]["/api/jobs/{id}/file"].is_object());
}
