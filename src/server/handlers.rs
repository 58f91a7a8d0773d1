use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::info;

use crate::data::DOCX_MIME;
use crate::job::{JobRegistry, JobSnapshot};
use crate::pipeline::Pipeline;
use crate::settings;

use super::jobs::{ServerError, create_job, download_path};
use super::models::{CancelResponse, CreateJobRequest};
use super::state::ServerState;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub async fn run_server(settings: settings::Settings, pipeline: Pipeline) -> Result<()> {
    let addr = settings.server_addr.clone();
    let app = router(settings, pipeline);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind server address {}", addr))?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(settings: settings::Settings, pipeline: Pipeline) -> Router {
    let state = Arc::new(ServerState {
        settings,
        registry: Arc::new(JobRegistry::new()),
        pipeline,
    });
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(create))
        .route("/jobs/:id", get(status))
        .route("/jobs/:id/cancel", post(cancel))
        .route("/jobs/:id/download", get(download))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(axum::middleware::from_fn(cors_middleware))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response<Body>, StatusCode> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return Ok(response);
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    Ok(response)
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type,authorization"),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static("content-disposition"),
    );
}

async fn create(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobSnapshot>), ServerError> {
    let snapshot = create_job(state.as_ref(), payload).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn status(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ServerError> {
    state
        .registry
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| ServerError::not_found(&id))
}

async fn cancel(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ServerError> {
    if state.registry.get(&id).is_none() {
        return Err(ServerError::not_found(&id));
    }
    let cancelled = state.registry.cancel(&id);
    info!(job = %id, cancelled, "cancellation requested");
    Ok(Json(CancelResponse { cancelled }))
}

async fn download(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Response<Body>, ServerError> {
    let path = download_path(state.as_ref(), &id)?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "translated.docx".to_string());

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(DOCX_MIME));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SkipPass;
    use crate::translations::LanguagePair;

    fn state(dir: &std::path::Path) -> Arc<ServerState> {
        let pipeline = Pipeline::new(
            Arc::new(crate::convert::SofficeConverter::new("soffice")),
            Arc::new(SkipPass),
            Arc::new(SkipPass),
            dir,
        );
        Arc::new(ServerState {
            settings: settings::Settings::default(),
            registry: Arc::new(JobRegistry::new()),
            pipeline,
        })
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path());
        let err = status(State(state.clone()), Path("missing".to_string()))
            .await
            .expect_err("status");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = cancel(State(state), Path("missing".to_string()))
            .await
            .expect_err("cancel");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_reports_whether_the_flag_was_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path());
        let job = state
            .registry
            .create("memo.docx", LanguagePair::new("en", "de"));

        let Json(response) = cancel(State(state.clone()), Path(job.id().to_string()))
            .await
            .expect("cancel");
        assert!(response.cancelled);

        job.mark_cancelled().expect("settle");
        let Json(response) = cancel(State(state.clone()), Path(job.id().to_string()))
            .await
            .expect("cancel");
        assert!(!response.cancelled);

        let Json(snapshot) = status(State(state), Path(job.id().to_string()))
            .await
            .expect("status");
        assert_eq!(snapshot.status, crate::job::JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn download_serves_the_output_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path());
        let job = state
            .registry
            .create("memo.docx", LanguagePair::new("en", "de"));
        let output = dir.path().join("memo.de.docx");
        std::fs::write(&output, b"PK").expect("write");
        job.transition(crate::job::JobStatus::ParsingDocx, 10, "")
            .expect("parse");
        job.transition(crate::job::JobStatus::Translating, 20, "")
            .expect("translate");
        job.transition(crate::job::JobStatus::Qa, 90, "").expect("qa");
        job.transition(crate::job::JobStatus::Packing, 95, "")
            .expect("pack");
        job.complete(&output, 1).expect("done");

        let response = download(State(state), Path(job.id().to_string()))
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], DOCX_MIME);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"memo.de.docx\""
        );
    }
}
