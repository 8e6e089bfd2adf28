//! # Pipeline Errors
//!
//! Typed failures for everything between upload and result. Two families live here:
//!
//! ## Key Types:
//! - **PipelineError**: returned synchronously by pipeline operations (enqueue,
//!   checkout, artifact IO, job transitions). HTTP handlers map these to status codes.
//! - **FailureCause**: recorded on a Job that reached `Failed`. It is data, not a
//!   Rust error, because it is stored in the result store and serialized to clients.

use crate::pipeline::job::{JobId, JobState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by pipeline operations.
///
/// ## Rust Concepts:
/// - **thiserror**: derives `Display` and `std::error::Error` from the `#[error]` attributes
/// - **#[from]**: lets `?` convert `std::io::Error` automatically
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The bounded queue stayed full for the whole enqueue timeout.
    #[error("job queue is full")]
    QueueFull,

    /// The queue has been closed for shutdown.
    #[error("job queue is closed")]
    QueueClosed,

    /// No model instance became available before the checkout deadline.
    #[error("timed out waiting for a model instance")]
    CheckoutTimeout,

    /// Every slot in the registry failed to load; nothing will ever become available.
    #[error("no model instance can be loaded")]
    NoCapacity,

    #[error("model load failed on slot {slot}: {reason}")]
    ModelLoadFailure { slot: usize, reason: String },

    #[error("upload of {size} bytes exceeds the {max} byte limit")]
    ArtifactTooLarge { size: u64, max: u64 },

    #[error("artifact {0} not found")]
    ArtifactNotFound(String),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    /// A state change the job lifecycle does not allow, e.g. cancelling a finished job.
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("invalid transcription options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InferenceTimeout,
    InferenceError,
    /// The job sat in `Running` past the stale threshold without its worker reporting back.
    WorkerLost,
    CheckoutTimeout,
    ModelLoadFailure,
    ArtifactNotFound,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InferenceTimeout => "inference_timeout",
            FailureKind::InferenceError => "inference_error",
            FailureKind::WorkerLost => "worker_lost",
            FailureKind::CheckoutTimeout => "checkout_timeout",
            FailureKind::ModelLoadFailure => "model_load_failure",
            FailureKind::ArtifactNotFound => "artifact_not_found",
        }
    }

    /// The same upload may well succeed if the client submits it again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::CheckoutTimeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure cause attached to a `Failed` job: a machine-readable kind plus a human message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error that happened after the job was dequeued.
    pub fn from_pipeline_error(err: &PipelineError) -> Self {
        let kind = match err {
            PipelineError::CheckoutTimeout => FailureKind::CheckoutTimeout,
            PipelineError::NoCapacity | PipelineError::ModelLoadFailure { .. } => {
                FailureKind::ModelLoadFailure
            }
            PipelineError::ArtifactNotFound(_) => FailureKind::ArtifactNotFound,
            _ => FailureKind::InferenceError,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_cause_classification() {
        let cause = FailureCause::from_pipeline_error(&PipelineError::CheckoutTimeout);
        assert_eq!(cause.kind, FailureKind::CheckoutTimeout);

        let cause = FailureCause::from_pipeline_error(&PipelineError::NoCapacity);
        assert_eq!(cause.kind, FailureKind::ModelLoadFailure);

        let cause =
            FailureCause::from_pipeline_error(&PipelineError::ArtifactNotFound("a.wav".into()));
        assert_eq!(cause.kind, FailureKind::ArtifactNotFound);
        assert!(cause.message.contains("a.wav"));
    }

    #[test]
    fn test_only_checkout_timeout_is_transient() {
        assert!(FailureKind::CheckoutTimeout.is_transient());
        assert!(!FailureKind::InferenceTimeout.is_transient());
        assert!(!FailureKind::WorkerLost.is_transient());
    }

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::WorkerLost).unwrap();
        assert_eq!(json, "\"worker_lost\"");
    }
}
