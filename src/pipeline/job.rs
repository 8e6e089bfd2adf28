//! # Jobs
//!
//! Job identity, the lifecycle state machine and the table that records every job
//! the service has accepted.
//!
//! ## Lifecycle:
//! ```text
//! Queued ──► Running ──► Succeeded | Failed | Cancelled
//!    └─────► Cancelled
//! ```
//! Terminal states never change again. Every transition goes through
//! `JobState::can_transition_to`, checked under the table lock, so a worker
//! finishing a job and a client cancelling it cannot both win.
//!
//! ## Key Types:
//! - **Job**: the unit handed through the queue (id, artifact, options, cancel flag)
//! - **JobRecord**: the externally visible status snapshot
//! - **JobTable**: shared map of records plus completion counters

use crate::pipeline::artifacts::ArtifactRef;
use crate::pipeline::error::{FailureCause, PipelineError};
use crate::pipeline::lock;
use crate::transcription::engine::TranscriptionOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How many recent speed samples feed the `average_speed` figure.
const SPEED_WINDOW: usize = 100;

/// Opaque, never-reused job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// The legal edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" | "pending" => Ok(JobState::Queued),
            "running" | "processing" => Ok(JobState::Running),
            "succeeded" | "completed" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Shared cancellation request flag.
///
/// The table, the queued `Job` and the worker all hold a clone. Setting it never
/// interrupts a running inference; workers poll it at their checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One unit of transcription work as it travels through the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub artifact: ArtifactRef,
    pub options: TranscriptionOptions,
    pub submitted_at: DateTime<Utc>,
    pub cancel: CancelFlag,
}

impl Job {
    pub fn new(artifact: ArtifactRef, options: TranscriptionOptions) -> Self {
        Self {
            id: JobId::new(),
            artifact,
            options,
            submitted_at: Utc::now(),
            cancel: CancelFlag::default(),
        }
    }
}

/// Status snapshot returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub filename: String,
    pub size_bytes: u64,
    pub options: TranscriptionOptions,
    pub status: JobState,
    /// Index of the worker that picked the job up, once it has been dequeued.
    pub worker: Option<usize>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureCause>,
    pub cancel_requested: bool,
    /// 1-based position among queued jobs; only set while `Queued`.
    pub queue_position: Option<usize>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now `Cancelled`.
    Cancelled,
    /// The job is running; it will be recorded `Cancelled` when the worker returns.
    Requested,
}

/// Aggregate counters exposed through the queue stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completions since startup, including records already evicted.
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Mean audio-seconds per processing-second over recent successful jobs.
    pub average_speed: Option<f64>,
}

struct Entry {
    record: JobRecord,
    cancel: CancelFlag,
    artifact: ArtifactRef,
    seq: u64,
    running_since: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
    total_succeeded: u64,
    total_failed: u64,
    total_cancelled: u64,
    speeds: VecDeque<f64>,
}

/// Every job the service knows about, keyed by id.
#[derive(Default)]
pub struct JobTable {
    inner: Mutex<Inner>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created job in `Queued`.
    pub fn insert(&self, job: &Job, filename: &str, size_bytes: u64) -> Result<(), PipelineError> {
        let mut inner = lock(&self.inner);
        if inner.entries.contains_key(&job.id) {
            return Err(PipelineError::DuplicateJob(job.id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            job.id,
            Entry {
                record: JobRecord {
                    job_id: job.id,
                    filename: filename.to_string(),
                    size_bytes,
                    options: job.options.clone(),
                    status: JobState::Queued,
                    worker: None,
                    submitted_at: job.submitted_at,
                    started_at: None,
                    finished_at: None,
                    failure: None,
                    cancel_requested: false,
                    queue_position: None,
                },
                cancel: job.cancel.clone(),
                artifact: job.artifact.clone(),
                seq,
                running_since: None,
            },
        );
        Ok(())
    }

    /// Drop a job that never made it into the queue.
    pub fn remove(&self, id: JobId) -> bool {
        lock(&self.inner).entries.remove(&id).is_some()
    }

    /// Drop records whose results have been evicted.
    pub fn remove_many(&self, ids: &[JobId]) -> usize {
        let mut inner = lock(&self.inner);
        let mut removed = 0;
        for id in ids {
            let terminal = inner
                .entries
                .get(id)
                .map(|e| e.record.status.is_terminal())
                .unwrap_or(false);
            if terminal && inner.entries.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        let inner = lock(&self.inner);
        let entry = inner.entries.get(&id)?;
        let mut record = entry.record.clone();
        if record.status == JobState::Queued {
            record.queue_position = Some(Self::position_of(&inner, entry.seq));
        }
        Some(record)
    }

    fn position_of(inner: &Inner, seq: u64) -> usize {
        inner
            .entries
            .values()
            .filter(|e| e.record.status == JobState::Queued && e.seq < seq)
            .count()
            + 1
    }

    /// Queued → Running, recording which worker owns the job.
    pub fn mark_running(&self, id: JobId, worker: usize) -> Result<(), PipelineError> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(PipelineError::UnknownJob(id))?;
        Self::check(&entry.record, JobState::Running)?;
        entry.record.status = JobState::Running;
        entry.record.worker = Some(worker);
        entry.record.started_at = Some(Utc::now());
        entry.running_since = Some(Instant::now());
        Ok(())
    }

    /// Move a job into a terminal state.
    pub fn finish(
        &self,
        id: JobId,
        state: JobState,
        failure: Option<FailureCause>,
    ) -> Result<JobRecord, PipelineError> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(PipelineError::UnknownJob(id))?;
        Self::check(&entry.record, state)?;
        if !state.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                from: entry.record.status,
                to: state,
            });
        }
        entry.record.status = state;
        entry.record.failure = failure;
        entry.record.finished_at = Some(Utc::now());
        entry.running_since = None;
        let record = entry.record.clone();
        match state {
            JobState::Succeeded => inner.total_succeeded += 1,
            JobState::Failed => inner.total_failed += 1,
            JobState::Cancelled => inner.total_cancelled += 1,
            _ => {}
        }
        Ok(record)
    }

    fn check(record: &JobRecord, next: JobState) -> Result<(), PipelineError> {
        if record.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                from: record.status,
                to: next,
            })
        }
    }

    /// Flag a job for cancellation.
    ///
    /// Queued jobs move to `Cancelled` immediately; running jobs only get their flag set.
    pub fn request_cancel(&self, id: JobId) -> Result<CancelOutcome, PipelineError> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(PipelineError::UnknownJob(id))?;
        match entry.record.status {
            JobState::Queued => {
                entry.cancel.request();
                entry.record.cancel_requested = true;
                entry.record.status = JobState::Cancelled;
                entry.record.finished_at = Some(Utc::now());
                inner.total_cancelled += 1;
                Ok(CancelOutcome::Cancelled)
            }
            JobState::Running => {
                entry.cancel.request();
                entry.record.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            terminal => Err(PipelineError::InvalidTransition {
                from: terminal,
                to: JobState::Cancelled,
            }),
        }
    }

    /// Every job currently `Running`.
    pub fn running(&self) -> Vec<(JobId, ArtifactRef)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, e)| e.record.status == JobState::Running)
            .map(|(id, e)| (*id, e.artifact.clone()))
            .collect()
    }

    /// Running jobs whose worker has not reported back within `threshold`.
    pub fn stale_running(&self, threshold: Duration, now: Instant) -> Vec<(JobId, ArtifactRef)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, e)| {
                e.record.status == JobState::Running
                    && e.running_since
                        .map(|since| now.saturating_duration_since(since) > threshold)
                        .unwrap_or(false)
            })
            .map(|(id, e)| (*id, e.artifact.clone()))
            .collect()
    }

    /// Newest first, optionally filtered by state.
    pub fn list(&self, status: Option<JobState>, limit: usize) -> Vec<JobRecord> {
        let inner = lock(&self.inner);
        let mut entries: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|e| status.map(|s| e.record.status == s).unwrap_or(true))
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
            .into_iter()
            .take(limit)
            .map(|e| {
                let mut record = e.record.clone();
                if record.status == JobState::Queued {
                    record.queue_position = Some(Self::position_of(&inner, e.seq));
                }
                record
            })
            .collect()
    }

    pub fn record_speed(&self, audio_secs: f64, processing: Duration) {
        let secs = processing.as_secs_f64();
        if secs <= 0.0 || audio_secs <= 0.0 {
            return;
        }
        let mut inner = lock(&self.inner);
        if inner.speeds.len() == SPEED_WINDOW {
            inner.speeds.pop_front();
        }
        inner.speeds.push_back(audio_secs / secs);
    }

    pub fn counts(&self) -> JobCounts {
        let inner = lock(&self.inner);
        let mut counts = JobCounts {
            total_succeeded: inner.total_succeeded,
            total_failed: inner.total_failed,
            total_cancelled: inner.total_cancelled,
            average_speed: if inner.speeds.is_empty() {
                None
            } else {
                Some(inner.speeds.iter().sum::<f64>() / inner.speeds.len() as f64)
            },
            ..Default::default()
        };
        for entry in inner.entries.values() {
            match entry.record.status {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}
