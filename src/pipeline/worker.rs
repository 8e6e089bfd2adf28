//! # Worker Pool
//!
//! A fixed number of supervised tokio tasks that pull jobs off the queue and run
//! them against a checked-out model instance.
//!
//! ## One job, step by step:
//! 1. Dequeue (wakes periodically to notice shutdown)
//! 2. Skip if cancelled while queued; otherwise mark `Running`
//! 3. Check out a model instance (bounded by the checkout timeout)
//! 4. Decode + transcribe on a blocking thread under the inference timeout
//! 5. On timeout raise the abort flag; the instance comes back when the model
//!    returns, or later through a reaper task
//! 6. Record the terminal state, then publish the outcome, then delete the artifact
//!
//! ## Supervision:
//! Each worker index runs inside a supervisor loop. If the worker task panics the
//! supervisor logs it and starts a fresh task on the same index. Whatever job the
//! dead worker held stays `Running` until the sweeper declares it lost.

use crate::audio;
use crate::pipeline::artifacts::ArtifactStore;
use crate::pipeline::error::{FailureCause, FailureKind};
use crate::pipeline::job::{Job, JobId, JobTable};
use crate::pipeline::lock;
use crate::pipeline::queue::JobQueue;
use crate::pipeline::results::{JobOutcome, ResultStore};
use crate::transcription::engine::{AbortSignal, RawTranscript, TranscriptResult};
use crate::transcription::registry::{ModelInstance, ModelRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a worker is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy { job_id: JobId, since: DateTime<Utc> },
    Restarting { restarts: u32 },
    Stopped,
}

/// Status slot per worker index.
pub struct WorkerTable {
    slots: Vec<Mutex<WorkerStatus>>,
}

impl WorkerTable {
    fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| Mutex::new(WorkerStatus::Starting)).collect(),
        }
    }

    fn set(&self, idx: usize, status: WorkerStatus) {
        if let Some(slot) = self.slots.get(idx) {
            *lock(slot) = status;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots.iter().map(|s| lock(s).clone()).collect()
    }

    /// Workers that are alive: starting, idle or busy.
    pub fn active(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy { .. }
                )
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Timeouts a worker applies to each job.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub checkout_timeout: Duration,
    pub inference_timeout: Duration,
    pub abort_grace: Duration,
    pub dequeue_poll: Duration,
}

/// Everything a worker needs, shared by all workers.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub registry: ModelRegistry,
    pub jobs: Arc<JobTable>,
    pub results: Arc<ResultStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub settings: WorkerSettings,
    pub shutdown: CancellationToken,
}

pub struct WorkerPool {
    table: Arc<WorkerTable>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `count` supervised workers.
    pub fn spawn(count: usize, ctx: Arc<WorkerContext>) -> Self {
        let table = Arc::new(WorkerTable::new(count));
        let supervisors = (0..count)
            .map(|idx| tokio::spawn(supervise(idx, ctx.clone(), table.clone())))
            .collect();
        info!(workers = count, "Worker pool started");
        Self {
            table,
            supervisors: Mutex::new(supervisors),
        }
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    /// Wait for every worker to exit, up to `grace`. Stragglers are aborted and
    /// counted in the return value.
    pub async fn join(&self, grace: Duration) -> usize {
        let handles: Vec<JoinHandle<()>> = lock(&self.supervisors).drain(..).collect();
        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker did not stop within the shutdown grace period, aborting it");
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

async fn supervise(idx: usize, ctx: Arc<WorkerContext>, table: Arc<WorkerTable>) {
    let mut restarts = 0u32;
    loop {
        let handle = tokio::spawn(run_worker(idx, ctx.clone(), table.clone()));
        match handle.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                restarts += 1;
                error!(worker = idx, restarts, "Worker panicked, restarting");
                table.set(idx, WorkerStatus::Restarting { restarts });
                if ctx.shutdown.is_cancelled() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    table.set(idx, WorkerStatus::Stopped);
    debug!(worker = idx, "Worker stopped");
}

async fn run_worker(idx: usize, ctx: Arc<WorkerContext>, table: Arc<WorkerTable>) {
    debug!(worker = idx, "Worker started");
    loop {
        table.set(idx, WorkerStatus::Idle);
        let deadline = Instant::now() + ctx.settings.dequeue_poll;
        let job = match ctx.queue.dequeue(deadline).await {
            Ok(Some(job)) => job,
            Ok(None) if ctx.shutdown.is_cancelled() => break,
            Ok(None) => continue,
            Err(_) => break,
        };

        table.set(
            idx,
            WorkerStatus::Busy {
                job_id: job.id,
                since: Utc::now(),
            },
        );
        process(idx, &ctx, job).await;
    }
}

async fn process(idx: usize, ctx: &WorkerContext, job: Job) {
    let job_id = job.id;

    if job.cancel.is_requested() {
        debug!(worker = idx, job_id = %job_id, "Skipping job cancelled while queued");
        discard_artifact(ctx, &job).await;
        return;
    }
    if let Err(err) = ctx.jobs.mark_running(job_id, idx) {
        debug!(worker = idx, job_id = %job_id, error = %err, "Job no longer runnable");
        discard_artifact(ctx, &job).await;
        return;
    }
    ctx.artifacts.touch(&job.artifact);
    info!(worker = idx, job_id = %job_id, "Processing job");

    let mut outcome = execute(idx, ctx, &job).await;
    if job.cancel.is_requested() && !matches!(outcome, JobOutcome::Cancelled) {
        debug!(job_id = %job_id, "Discarding outcome of job cancelled while running");
        outcome = JobOutcome::Cancelled;
    }

    match ctx.jobs.finish(job_id, outcome.state(), outcome.failure()) {
        Ok(record) => {
            match &outcome {
                JobOutcome::Succeeded(result) => info!(
                    worker = idx,
                    job_id = %job_id,
                    audio_secs = result.audio_duration,
                    processing_ms = result.processing_time_ms,
                    "Job succeeded"
                ),
                JobOutcome::Failed(cause) => {
                    warn!(worker = idx, job_id = %job_id, cause = %cause, "Job failed")
                }
                JobOutcome::Cancelled => info!(worker = idx, job_id = %job_id, "Job cancelled"),
            }
            debug!(job_id = %job_id, status = %record.status, "Recorded job outcome");
            if !ctx.results.put(job_id, outcome) {
                debug!(job_id = %job_id, "Outcome already recorded");
            }
        }
        // The sweeper may already have declared this job lost.
        Err(err) => warn!(job_id = %job_id, error = %err, "Could not record job outcome"),
    }
    discard_artifact(ctx, &job).await;
}

async fn discard_artifact(ctx: &WorkerContext, job: &Job) {
    if let Err(err) = ctx.artifacts.delete(&job.artifact).await {
        warn!(job_id = %job.id, artifact = %job.artifact, error = %err, "Failed to delete artifact");
    }
}

struct Inference {
    instance: ModelInstance,
    result: anyhow::Result<(RawTranscript, f64)>,
}

async fn execute(idx: usize, ctx: &WorkerContext, job: &Job) -> JobOutcome {
    if job.cancel.is_requested() {
        return JobOutcome::Cancelled;
    }

    let checkout_deadline = Instant::now() + ctx.settings.checkout_timeout;
    let instance = match ctx.registry.checkout(idx, job.id, checkout_deadline).await {
        Ok(instance) => instance,
        Err(err) => return JobOutcome::Failed(FailureCause::from_pipeline_error(&err)),
    };

    if job.cancel.is_requested() {
        ctx.registry.release(instance);
        return JobOutcome::Cancelled;
    }

    let file = match ctx.artifacts.open(&job.artifact) {
        Ok(file) => file,
        Err(err) => {
            ctx.registry.release(instance);
            return JobOutcome::Failed(FailureCause::from_pipeline_error(&err));
        }
    };

    let slot = instance.slot();
    let device = instance.device();
    let model_id = instance.model_id().to_string();
    let options = job.options.clone();
    let extension = Path::new(job.artifact.as_str())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string);
    let abort = AbortSignal::new();
    let started = Instant::now();

    let mut task = {
        let abort = abort.clone();
        tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            let result = audio::decode_audio(Box::new(file), extension.as_deref()).and_then(|decoded| {
                let duration = decoded.duration_secs();
                instance
                    .transcribe(&decoded.samples, &options, &abort)
                    .map(|raw| (raw, duration))
            });
            Inference { instance, result }
        })
    };

    let joined = match tokio::time::timeout(ctx.settings.inference_timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            abort.raise();
            warn!(
                worker = idx,
                job_id = %job.id,
                timeout_ms = ctx.settings.inference_timeout.as_millis() as u64,
                "Inference timed out, aborting"
            );
            match tokio::time::timeout(ctx.settings.abort_grace, &mut task).await {
                Ok(Ok(inference)) => ctx.registry.release(inference.instance),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(job_id = %job.id, slot, "Model ignored abort, releasing it when it returns");
                    let registry = ctx.registry.clone();
                    tokio::spawn(async move {
                        if let Ok(inference) = task.await {
                            registry.release(inference.instance);
                        }
                    });
                }
            }
            ctx.registry
                .record_usage(slot, 0.0, started.elapsed().as_millis() as u64, None, false);
            return JobOutcome::Failed(FailureCause::new(
                FailureKind::InferenceTimeout,
                format!(
                    "inference exceeded {}ms",
                    ctx.settings.inference_timeout.as_millis()
                ),
            ));
        }
    };

    let processing = started.elapsed();
    match joined {
        Ok(Inference {
            instance,
            result: Ok((raw, audio_secs)),
        }) => {
            ctx.registry.release(instance);
            let result = TranscriptResult::assemble(
                job.id,
                raw,
                job.options.task,
                audio_secs,
                processing,
                &model_id,
                &device,
            );
            ctx.registry.record_usage(
                slot,
                audio_secs,
                result.processing_time_ms,
                result.confidence,
                true,
            );
            ctx.jobs.record_speed(audio_secs, processing);
            JobOutcome::Succeeded(result)
        }
        Ok(Inference {
            instance,
            result: Err(err),
        }) => {
            ctx.registry.release(instance);
            ctx.registry
                .record_usage(slot, 0.0, processing.as_millis() as u64, None, false);
            JobOutcome::Failed(FailureCause::new(
                FailureKind::InferenceError,
                format!("{:#}", err),
            ))
        }
        // The instance was dropped while unwinding, which already discarded the model.
        Err(err) => {
            error!(worker = idx, job_id = %job.id, "Inference task panicked: {}", err);
            JobOutcome::Failed(FailureCause::new(
                FailureKind::InferenceError,
                "inference task panicked",
            ))
        }
    }
}
