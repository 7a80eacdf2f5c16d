//! Shared test harness for integration tests.
//!
//! [`TestHarness`] builds a full [`AppContext`] on an in-memory database, an
//! artifact root in a temp dir and fake external tools written as shell
//! scripts. Every fake tool appends one line per invocation to
//! `<dir>/calls/<tool>.log`, which tests use to count invocations.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use mf_core::config::Config;
use mf_core::queue::TaskQueue;
use mf_core::{Job, JobId};
use mf_pipeline::{RunOutcome, StageRegistry};
use mf_server::context::AppContext;
use mf_server::router::build_router;
use mf_tools::tools::{BLENDER, REPAIR, SLICER};
use mf_tools::{ToolConfig, ToolRegistry};
use tokio_util::sync::CancellationToken;

const BOUNDARY: &str = "meshforge-test-boundary";

/// Validator output: a JSON record on the last line.
const BLENDER_BODY: &str = r#"echo "Blender 4.1 (headless)"
echo '{"manifold": true, "non_manifold_edges": 0, "warnings": []}'"#;

/// Repair copies input to output.
const REPAIR_OK: &str = r#"echo "repairing $1"; cp "$1" "$2""#;
const REPAIR_CRASH: &str = r#"echo "segmentation fault" >&2; exit 139"#;
/// Never finishes; the forked sleep keeps the pipe open too.
const REPAIR_HANG: &str = r#"echo "repairing $1"; sleep 30 & wait"#;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Repair {
    Ok,
    Crash,
    Hang,
}

/// The slicer both extracts 3MF archives and slices meshes.
const SLICER_BODY: &str = r#"case "$1" in
  --export-obj) echo "exporting"; echo "o cube" > "$3" ;;
  --gcode)
    echo "Slicing model"
    echo "Warning: Low bed adhesion on first layer"
    echo "Warning: Low bed adhesion near edge"
    echo "G1 X0 Y0" > "$3/model.gcode" ;;
esac"#;

/// Knobs for the fake tool set.
pub struct HarnessBuilder {
    slicer: bool,
    repair: Repair,
    max_retries: u32,
    max_upload_mb: u64,
}

impl HarnessBuilder {
    /// Leave the slicer off this host.
    pub fn without_slicer(mut self) -> Self {
        self.slicer = false;
        self
    }

    /// Make the repair command crash on every call.
    pub fn crashing_repair(mut self) -> Self {
        self.repair = Repair::Crash;
        self
    }

    /// Make the repair command hang until the one-second stage timeout
    /// kills it.
    pub fn hanging_repair(mut self) -> Self {
        self.repair = Repair::Hang;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn max_upload_mb(mut self, mb: u64) -> Self {
        self.max_upload_mb = mb;
        self
    }

    pub fn build(self) -> TestHarness {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(dir.path().join("calls")).unwrap();

        let mut config = Config::default();
        config.storage.root = dir.path().join("artifacts");
        config.server.max_upload_mb = self.max_upload_mb;
        config.retry.max_retries = self.max_retries;
        config.retry.backoff_base_ms = 1;
        config.retry.backoff_max_ms = 5;
        config.retry.stage_timeout_secs = if self.repair == Repair::Hang { 1 } else { 30 };
        config.queue.poll_interval_ms = 20;
        config.tools.validate_script = bin.join("validate.py");
        std::fs::write(&config.tools.validate_script, "# validation script\n").unwrap();

        let mut tools = ToolRegistry::default();
        let mut add = |name: &str, body: &str| {
            tools.insert(ToolConfig {
                name: name.into(),
                path: fake_tool(dir.path(), name, body),
                base_args: vec![],
            });
        };
        add(BLENDER, BLENDER_BODY);
        add(
            REPAIR,
            match self.repair {
                Repair::Ok => REPAIR_OK,
                Repair::Crash => REPAIR_CRASH,
                Repair::Hang => REPAIR_HANG,
            },
        );
        if self.slicer {
            add(SLICER, SLICER_BODY);
        }

        let tools = Arc::new(tools);
        let stages = StageRegistry::with_builtin(tools.clone(), &config.tools);
        let db = mf_db::init_memory_pool().unwrap();
        let ctx = AppContext::new(config, db, tools, stages).unwrap();
        let app = build_router(ctx.clone());

        TestHarness { ctx, app, dir }
    }
}

/// Write an executable script that logs its arguments and then runs `body`.
fn fake_tool(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = root.join("bin").join(name);
    let log = root.join("calls").join(format!("{name}.log"));
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"{}\"\n{body}\n",
        log.display()
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Full application wired to fake tools.
pub struct TestHarness {
    pub ctx: AppContext,
    app: Router,
    dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            slicer: true,
            repair: Repair::Ok,
            max_retries: 3,
            max_upload_mb: 10,
        }
    }

    /// Every tool available and well-behaved.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Send `req` through the router and decode the JSON body (or `Null`).
    pub async fn request(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, bytes) = self.request_raw(req).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn request_raw(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    /// `POST /api/jobs` with `bytes` as the `file` field.
    pub async fn upload(&self, file_name: &str, bytes: &[u8]) -> (StatusCode, serde_json::Value) {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let req = Request::post("/api/jobs")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        self.request(req).await
    }

    /// Upload and return the new job's ID.
    pub async fn submit(&self, file_name: &str, bytes: &[u8]) -> JobId {
        let (status, json) = self.upload(file_name, bytes).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().unwrap().parse().unwrap()
    }

    /// Take the next delivery and run it the way a worker would.
    pub async fn run_next(&self) -> RunOutcome {
        let delivery = self.ctx.queue.dequeue("test-worker").await.unwrap();
        let outcome = self
            .ctx
            .executor
            .run(delivery.job_id, &CancellationToken::new())
            .await
            .unwrap();
        if outcome != RunOutcome::Cancelled {
            self.ctx.queue.ack(&delivery).await.unwrap();
        }
        outcome
    }

    /// Run `job_id` again as if its delivery had been redelivered.
    pub async fn redeliver(&self, job_id: JobId) -> RunOutcome {
        self.ctx
            .executor
            .run(job_id, &CancellationToken::new())
            .await
            .unwrap()
    }

    pub fn job(&self, id: JobId) -> Job {
        self.ctx.store.get(id).unwrap()
    }

    /// How many times the fake `tool` was invoked.
    pub fn calls(&self, tool: &str) -> usize {
        std::fs::read_to_string(self.dir.path().join("calls").join(format!("{tool}.log")))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}
