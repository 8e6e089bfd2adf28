//! # Job Handlers
//!
//! ## Available Endpoints:
//! - `GET /api/v1/jobs` - Recent jobs, newest first (`?status=&limit=`)
//! - `GET /api/v1/jobs/{id}` - Job status and queue position
//! - `GET /api/v1/jobs/{id}/result` - Transcript once the job has finished
//! - `DELETE /api/v1/jobs/{id}` - Cancel a job
//! - `GET /api/v1/queue` - Queue and worker statistics
//! - `POST /api/v1/admin/cleanup` - Run one cleanup pass now
//!
//! ## Result status codes:
//! | Outcome   | Status |
//! |-----------|--------|
//! | succeeded | 200 with transcript |
//! | pending   | 202 with current status |
//! | failed    | 422 with failure cause |
//! | failed, `checkout_timeout` | 503 with cause and `Retry-After` |
//! | cancelled | 410 |
//! | unknown   | 404 (never submitted, or expired) |

use crate::error::{AppError, AppResult};
use crate::pipeline::job::{CancelOutcome, JobId, JobState};
use crate::pipeline::results::ResultStatus;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("'{}' is not a valid job id", raw)))
}

/// Turn a result lookup into a response. Shared with the upload handler's wait mode.
pub fn result_response(
    state: &AppState,
    job_id: JobId,
    status: ResultStatus,
) -> AppResult<HttpResponse> {
    match status {
        ResultStatus::Succeeded(result) => Ok(HttpResponse::Ok().json(result)),
        ResultStatus::Pending => {
            let record = state.pipeline.status(job_id);
            Ok(HttpResponse::Accepted().json(json!({
                "job_id": job_id,
                "status": record.as_ref().map(|r| r.status).unwrap_or(JobState::Queued),
                "queue_position": record.and_then(|r| r.queue_position),
                "result_url": format!("/api/v1/jobs/{}/result", job_id),
            })))
        }
        ResultStatus::Failed(cause) => Err(AppError::JobFailed(cause)),
        ResultStatus::Cancelled => Err(AppError::Gone(format!("Job {} was cancelled", job_id))),
        ResultStatus::Unknown => Err(AppError::NotFound(format!(
            "Job {} not found or its result has expired",
            job_id
        ))),
    }
}

pub async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let job_id = parse_job_id(&path)?;
    let record = state
        .pipeline
        .status(job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
    Ok(HttpResponse::Ok().json(record))
}

pub async fn get_result(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let job_id = parse_job_id(&path)?;
    let status = state.pipeline.result(job_id);
    result_response(&state, job_id, status)
}

pub async fn cancel_job(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let job_id = parse_job_id(&path)?;
    let outcome = state.pipeline.cancel(job_id).await?;
    let (status, message) = match outcome {
        CancelOutcome::Cancelled => ("cancelled", "Job cancelled before it started"),
        CancelOutcome::Requested => (
            "cancelling",
            "Job is running; its result will be discarded when inference returns",
        ),
    };
    Ok(HttpResponse::Ok().json(json!({
        "job_id": job_id,
        "status": status,
        "message": message,
    })))
}

pub async fn list_jobs(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let jobs = state.pipeline.list(status, limit);
    Ok(HttpResponse::Ok().json(json!({
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

pub async fn queue_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stats": state.pipeline.stats(),
    }))
}

pub async fn run_cleanup(state: web::Data<AppState>) -> HttpResponse {
    let report = state.pipeline.sweep_now().await;
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "cleanup": report,
    }))
}
