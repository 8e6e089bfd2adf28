//! # Transcription Upload Handler
//!
//! `POST /transcribe` (also `/api/v1/transcribe`)
//!
//! ## Request:
//! Multipart form data:
//! - `file` (or `audio`): the audio file, required, exactly one
//! - `language`: optional ISO 639-1 hint (`auto` or empty to detect)
//! - `task`: optional, `transcribe` (default) or `translate`
//!
//! Any other field is rejected. The size limit is enforced while the upload
//! streams in, so an oversized body is refused before it is fully buffered.
//!
//! ## Modes:
//! - **poll** (`?wait=false`): 202 with the job id and queue position
//! - **wait** (`?wait=true`): block until the result is ready or the wait
//!   timeout passes; a timed-out wait still answers 202 with the job id
//!
//! Without `wait` in the query the configured `api.default_mode` decides.

use crate::config::{AppConfig, ResponseMode};
use crate::error::{AppError, AppResult};
use crate::handlers::jobs::result_response;
use crate::pipeline::Upload;
use crate::state::AppState;
use crate::transcription::engine::TranscriptionOptions;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Text fields are tiny; anything longer is a malformed request.
const MAX_TEXT_FIELD_BYTES: usize = 1024;

const FILE_FIELDS: [&str; 2] = ["file", "audio"];

#[derive(Debug, Deserialize)]
pub struct TranscribeQuery {
    pub wait: Option<bool>,
}

/// The parsed multipart form.
#[derive(Debug)]
struct UploadForm {
    filename: String,
    extension: String,
    bytes: Vec<u8>,
    fields: Vec<(String, String)>,
}

pub async fn transcribe(
    state: web::Data<AppState>,
    query: web::Query<TranscribeQuery>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let config = &state.config;
    let form = read_form(&mut payload, config, state.pipeline.max_artifact_bytes()).await?;
    let options = TranscriptionOptions::from_fields(&form.fields)?;

    let upload = Upload {
        filename: form.filename,
        extension: form.extension,
        bytes: form.bytes,
        options,
    };
    let enqueue_timeout = Duration::from_millis(config.pipeline.enqueue_timeout_ms);
    let submission = state.pipeline.submit(upload, enqueue_timeout).await?;
    let job_id = submission.job_id;

    let wait = query
        .wait
        .unwrap_or(config.api.default_mode == ResponseMode::Wait);
    if !wait {
        return Ok(HttpResponse::Accepted().json(json!({
            "job_id": job_id,
            "status": "queued",
            "queue_position": submission.queue_position,
            "size_bytes": submission.size_bytes,
            "sha256": submission.sha256,
            "status_url": format!("/api/v1/jobs/{}", job_id),
            "result_url": format!("/api/v1/jobs/{}/result", job_id),
        })));
    }

    debug!(job_id = %job_id, "Waiting for transcription result");
    let status = state
        .pipeline
        .wait(job_id, Duration::from_secs(config.api.wait_timeout_secs))
        .await;
    result_response(&state, job_id, status)
}

async fn read_form(
    payload: &mut Multipart,
    config: &AppConfig,
    max_bytes: u64,
) -> AppResult<UploadForm> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut fields = Vec::new();

    while let Some(item) = payload.next().await {
        let mut field: Field = item?;
        let disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
        let name = disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        if FILE_FIELDS.contains(&name.as_str()) {
            if file.is_some() {
                return Err(AppError::ValidationError(
                    "Exactly one audio file is allowed".to_string(),
                ));
            }
            let filename = disposition
                .get_filename()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| AppError::ValidationError("Uploaded file has no filename".to_string()))?
                .to_string();
            let extension = config.accepted_extension(&filename).ok_or_else(|| {
                AppError::ValidationError(format!(
                    "Unsupported file type '{}'. Allowed: {}",
                    filename,
                    config.storage.allowed_extensions.join(", ")
                ))
            })?;
            let bytes = read_limited(&mut field, max_bytes).await?;
            file = Some((filename, extension, bytes));
        } else {
            let bytes = read_limited(&mut field, MAX_TEXT_FIELD_BYTES as u64)
                .await
                .map_err(|_| AppError::ValidationError(format!("Field '{}' is too long", name)))?;
            let value = String::from_utf8(bytes)
                .map_err(|_| AppError::ValidationError(format!("Field '{}' is not UTF-8", name)))?;
            fields.push((name, value));
        }
    }

    let (filename, extension, bytes) = file
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    if bytes.is_empty() {
        return Err(AppError::ValidationError("Uploaded file is empty".to_string()));
    }
    Ok(UploadForm {
        filename,
        extension,
        bytes,
        fields,
    })
}

/// Collect a field's body, failing as soon as it grows past `limit`.
async fn read_limited(field: &mut Field, limit: u64) -> AppResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if (bytes.len() + chunk.len()) as u64 > limit {
            return Err(AppError::PayloadTooLarge(format!(
                "Upload exceeds the {} byte limit",
                limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
