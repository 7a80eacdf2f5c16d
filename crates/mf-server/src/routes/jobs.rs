//! Job route handlers: upload, status, listing and result download.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mf_core::{Error, Job, JobId, JobState, JobStatus, Rejection};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::AppError;

/// Multipart field carrying the model file.
const UPLOAD_FIELD: &str = "file";

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsParams {
    /// `pending`, `running`, `succeeded` or `failed`.
    pub state: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Multipart upload form.
#[derive(utoipa::ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    /// The model; its filename extension selects the pipeline.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

/// Job response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub state: String,
    pub input_format: String,
    pub pipeline_kind: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// State-specific detail: partial stage log while running, report on
    /// success, failing stage and message on failure.
    #[schema(value_type = Object)]
    pub status: JobStatus,
    /// Set once the result can be downloaded.
    pub download_url: Option<String>,
}

impl JobResponse {
    pub fn from_model(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            state: job.state.to_string(),
            input_format: job.input_format.to_string(),
            pipeline_kind: job.pipeline_kind.to_string(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
            status: job.status(),
            download_url: (job.state == JobState::Succeeded)
                .then(|| format!("/api/jobs/{}/file", job.id)),
        }
    }
}

fn parse_job_id(id: &str) -> Result<JobId, Error> {
    id.parse()
        .map_err(|_| Error::Validation("Invalid job ID".into()))
}

/// GET /api/jobs
#[utoipa::path(
    get,
    path = "/api/jobs",
    params(ListJobsParams),
    responses(
        (status = 200, description = "List jobs, newest first", body = Vec<JobResponse>),
        (status = 400, description = "Unknown state filter")
    )
)]
pub async fn list_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let state = params
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()?;
    let limit = params.limit.clamp(1, 500);
    let jobs = ctx.store.list(state, params.offset.max(0), limit)?;
    Ok(Json(jobs.iter().map(JobResponse::from_model).collect()))
}

/// POST /api/jobs
///
/// Multipart upload with the model in the `file` field. The extension of the
/// uploaded filename selects the pipeline.
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Job admitted", body = JobResponse),
        (status = 400, description = "Unsupported extension or missing file"),
        (status = 413, description = "File too large")
    )
)]
pub async fn submit_job(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let extension = FsPath::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        // Refuse unknown formats before reading the body.
        ctx.admission.check(&extension, 0)?;

        let staged = ctx.artifacts.staging_dir().join(Uuid::new_v4().to_string());
        let limit = ctx.admission.max_upload_bytes();
        if let Err(e) = stream_to_file(&mut field, &staged, limit).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }

        let job = ctx.admission.submit(&staged, &extension).await?;
        return Ok((StatusCode::CREATED, Json(JobResponse::from_model(&job))));
    }

    Err(Error::Validation(format!("missing `{UPLOAD_FIELD}` field")).into())
}

/// Write a multipart field to `dest`, stopping as soon as it exceeds `limit`.
async fn stream_to_file(
    field: &mut axum::extract::multipart::Field<'_>,
    dest: &FsPath,
    limit: u64,
) -> Result<(), Error> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| Error::Validation(format!("upload interrupted: {e}")))?
    {
        written += chunk.len() as u64;
        if written > limit {
            return Err(Error::AdmissionRejected(Rejection::TooLarge {
                size: written,
                limit,
            }));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// GET /api/jobs/{id}
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job status", body = JobResponse),
        (status = 404, description = "Job not found")
    )
)]
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = ctx.store.get(parse_job_id(&id)?)?;
    Ok(Json(JobResponse::from_model(&job)))
}

/// GET /api/jobs/{id}/file
#[utoipa::path(
    get,
    path = "/api/jobs/{id}/file",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Result file"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job has not succeeded"),
        (status = 410, description = "Result file no longer exists")
    )
)]
pub async fn download_result(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let job_id = parse_job_id(&id)?;
    let job = ctx.store.get(job_id)?;
    if job.state != JobState::Succeeded {
        return Err(Error::NotReady(format!("job {job_id} is {}", job.state)).into());
    }

    let output = job
        .final_output_ref
        .filter(|r| ctx.artifacts.exists(r))
        .ok_or_else(|| Error::Expired(format!("result of job {job_id}")))?;
    let path: PathBuf = output.path().to_path_buf();
    let file_name = output.file_name().unwrap_or("result").to_string();

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Expired(format!("result of job {job_id}")).into())
        }
        Err(e) => return Err(Error::from(e).into()),
    };
    let size = file.metadata().await.map_err(Error::from)?.len();

    let body = Body::from_stream(ReaderStream::with_capacity(file, 64 * 1024));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH.as_str(), size.to_string()),
            (
                header::CONTENT_DISPOSITION.as_str(),
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}
