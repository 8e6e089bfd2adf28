//! # Error Handling
//!
//! HTTP-facing error type and its conversion into JSON error responses.
//!
//! ## Two layers:
//! - **PipelineError** (`pipeline::error`): typed failures from the transcription core
//! - **AppError** (here): what a handler returns; every variant maps to one status code
//!
//! ## Key Rust Concepts:
//! - **From trait**: `?` on a `PipelineError` converts it into the matching `AppError`
//! - **ResponseError trait**: actix turns an `Err(AppError)` from a handler into a response
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "overloaded",
//!     "message": "job queue is full",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::pipeline::error::{FailureCause, PipelineError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Seconds a client is told to wait before retrying an overloaded request.
const RETRY_AFTER_SECS: u64 = 5;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal / ConfigError**: server-side problems (500)
/// - **BadRequest / ValidationError**: client sent invalid data (400)
/// - **NotFound**: unknown or expired job (404)
/// - **Conflict**: the job is already in a terminal state (409)
/// - **Gone**: the job was cancelled, there is no transcript (410)
/// - **PayloadTooLarge**: upload over the size limit (413)
/// - **JobFailed**: the job ran and failed; the body carries the cause (422, or 503
///   when the cause is transient, e.g. no model instance freed up in time)
/// - **Overloaded**: queue full or no model capacity, retry later (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Conflict(String),
    Gone(String),
    PayloadTooLarge(String),
    JobFailed(FailureCause),
    Overloaded(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Gone(msg) => write!(f, "Gone: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::JobFailed(cause) => write!(f, "Job failed: {}", cause),
            AppError::Overloaded(msg) => write!(f, "Service overloaded: {}", msg),
        }
    }
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Conflict(_) => "conflict",
            AppError::Gone(_) => "cancelled",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::JobFailed(cause) if cause.kind.is_transient() => "overloaded",
            AppError::JobFailed(_) => "job_failed",
            AppError::Overloaded(_) => "overloaded",
        }
    }

    /// Whether the client should simply try again later.
    fn is_retryable(&self) -> bool {
        match self {
            AppError::Overloaded(_) => true,
            AppError::JobFailed(cause) => cause.kind.is_transient(),
            _ => false,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Conflict(msg)
            | AppError::Gone(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::Overloaded(msg) => msg.clone(),
            AppError::JobFailed(cause) => cause.message.clone(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Gone(_) => StatusCode::GONE,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::JobFailed(cause) if cause.kind.is_transient() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::JobFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        });
        if let AppError::JobFailed(cause) = self {
            body["error"]["cause"] = json!(cause.kind);
        }

        let mut response = HttpResponse::build(self.status_code());
        if self.is_retryable() {
            response.insert_header(("Retry-After", RETRY_AFTER_SECS.to_string()));
        }
        response.json(body)
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::QueueFull
            | PipelineError::QueueClosed
            | PipelineError::CheckoutTimeout
            | PipelineError::NoCapacity => AppError::Overloaded(err.to_string()),
            PipelineError::ArtifactTooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            PipelineError::ArtifactNotFound(_) | PipelineError::UnknownJob(_) => {
                AppError::NotFound(err.to_string())
            }
            PipelineError::InvalidOptions(msg) => AppError::ValidationError(msg),
            PipelineError::InvalidTransition { .. } | PipelineError::DuplicateJob(_) => {
                AppError::Conflict(err.to_string())
            }
            PipelineError::ModelLoadFailure { .. } | PipelineError::Io(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

/// Catch-all for startup and backend failures that reach a handler.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Malformed multipart body: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::FailureKind;
    use crate::pipeline::job::{JobId, JobState};

    #[test]
    fn test_pipeline_error_mapping() {
        let cases = [
            (PipelineError::QueueFull, StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::CheckoutTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (
                PipelineError::ArtifactTooLarge { size: 10, max: 5 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (PipelineError::UnknownJob(JobId::new()), StatusCode::NOT_FOUND),
            (
                PipelineError::InvalidOptions("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PipelineError::InvalidTransition {
                    from: JobState::Succeeded,
                    to: JobState::Cancelled,
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_overloaded_sets_retry_after() {
        let response = AppError::from(PipelineError::QueueFull).error_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &RETRY_AFTER_SECS.to_string()
        );
    }

    #[test]
    fn test_job_failed_is_unprocessable() {
        let err = AppError::JobFailed(FailureCause::new(FailureKind::InferenceTimeout, "slow"));
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("inference_timeout"));
        assert!(err.error_response().headers().get("Retry-After").is_none());
    }

    #[test]
    fn test_checkout_timeout_failure_asks_for_retry() {
        let err = AppError::JobFailed(FailureCause::new(FailureKind::CheckoutTimeout, "busy"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let response = err.error_response();
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &RETRY_AFTER_SECS.to_string()
        );
    }
}
