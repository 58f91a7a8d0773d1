use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::data::{self, SourceKind};
use crate::job::{JobSnapshot, JobStatus};
use crate::translations::LanguagePair;

use super::models::{CreateJobRequest, ErrorResponse};
use super::state::ServerState;

#[derive(Debug)]
pub(crate) struct ServerError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl ServerError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("job '{}' not found", id),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::internal(format!("{:#}", err))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Validates an upload, stores it under the job's directory and starts the
/// pipeline in the background.
pub(crate) async fn create_job(
    state: &ServerState,
    request: CreateJobRequest,
) -> Result<JobSnapshot, ServerError> {
    if request.file_name.trim().is_empty() {
        return Err(ServerError::bad_request("fileName is required"));
    }
    let bytes = BASE64
        .decode(request.data_base64.trim())
        .map_err(|err| ServerError::bad_request(format!("invalid dataBase64: {}", err)))?;
    if bytes.is_empty() {
        return Err(ServerError::bad_request("uploaded file is empty"));
    }
    let file_name = data::sanitize_file_name(&request.file_name);
    let Some(kind) = SourceKind::detect(&file_name, &bytes) else {
        return Err(ServerError::bad_request(format!(
            "unsupported file type: {} (expected .pdf or .docx)",
            file_name
        )));
    };
    let file_name = kind.file_name(&file_name);

    let languages = resolve_languages(state, &request);
    languages
        .validate()
        .map_err(|err| ServerError::bad_request(err.to_string()))?;

    prune_expired(state).await;

    let job = state.registry.create(&file_name, languages);
    let job_dir = state.pipeline.work_dir().join(job.id());
    let input = job_dir.join(&file_name);
    if let Err(err) = write_upload(&job_dir, &input, &bytes).await {
        if let Err(state_err) = job.fail(format!("failed to store upload: {}", err)) {
            debug!(job = %job.id(), "{}", state_err);
        }
        return Err(ServerError::internal(format!("failed to store upload: {}", err)));
    }
    info!(
        job = %job.id(),
        file = %file_name,
        source = %job.languages().source,
        target = %job.languages().target,
        "job created"
    );

    let pipeline = state.pipeline.clone();
    let task_job = job.clone();
    tokio::spawn(async move {
        pipeline.run(&task_job, &input).await;
    });
    Ok(job.snapshot())
}

fn resolve_languages(state: &ServerState, request: &CreateJobRequest) -> LanguagePair {
    let pick = |value: &Option<String>, fallback: &str| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    LanguagePair::new(
        pick(&request.source_lang, &state.settings.languages.source),
        pick(&request.target_lang, &state.settings.languages.target),
    )
}

async fn write_upload(job_dir: &Path, input: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(job_dir).await?;
    tokio::fs::write(input, bytes).await
}

async fn prune_expired(state: &ServerState) {
    for id in state.registry.prune(state.settings.retention) {
        let dir = state.pipeline.work_dir().join(&id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(job = %id, "removed expired job files"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(job = %id, "failed to remove {}: {}", dir.display(), err),
        }
    }
}

/// Output path of a finished job, or the reason it cannot be downloaded yet.
pub(crate) fn download_path(state: &ServerState, id: &str) -> Result<PathBuf, ServerError> {
    let job = state.registry.get(id).ok_or_else(|| ServerError::not_found(id))?.job();
    if job.status != JobStatus::Done {
        return Err(ServerError::conflict(format!(
            "job is {}, output is only available when done",
            job.status.as_str()
        )));
    }
    job.output_path
        .ok_or_else(|| ServerError::internal("finished job has no output"))
}
