//! # Transcription Pipeline
//!
//! Everything between "audio bytes arrived" and "transcript is available".
//!
//! ## Key Components:
//! - **Artifact Store**: uploaded audio on local disk, with expiry
//! - **Job Queue**: bounded FIFO with enqueue backpressure
//! - **Worker Pool**: supervised workers running inference off the queue
//! - **Result Store**: terminal outcomes, kept for a retention window
//! - **Sweeper**: periodic cleanup of expired artifacts, results and lost jobs
//!
//! ## Flow:
//! ```text
//! submit ──► ArtifactStore.save ──► JobQueue.enqueue ──► worker
//!                                                          │ checkout (ModelRegistry)
//!                                                          │ inference
//!                                                          ▼
//!                         client ◄── ResultStore.get/wait ◄── put
//! ```
//!
//! `Pipeline` is constructed once at startup and shared through `AppState`.
//! Nothing in here is a global.

pub mod artifacts;
pub mod error;
pub mod job;
pub mod queue;
pub mod results;
pub mod sweeper;
pub mod worker;

use crate::config::AppConfig;
use crate::device::DeviceSpec;
use crate::transcription::engine::{SpeechEngine, TranscriptionOptions};
use crate::transcription::registry::{ModelRegistry, RegistrySummary};
use artifacts::ArtifactStore;
use error::PipelineError;
use job::{CancelOutcome, Job, JobCounts, JobId, JobRecord, JobState, JobTable};
use queue::JobQueue;
use results::{JobOutcome, ResultStatus, ResultStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sweeper::{SweepReport, Sweeper};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker::{WorkerContext, WorkerPool, WorkerSettings, WorkerStatus};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// None of the pipeline's critical sections leave shared state half-updated,
/// so a poisoned lock carries nothing worse than a stale value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pipeline tuning, resolved from `AppConfig` into concrete durations.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub checkout_timeout: Duration,
    pub inference_timeout: Duration,
    pub abort_grace: Duration,
    pub dequeue_poll: Duration,
    pub upload_dir: PathBuf,
    pub max_artifact_bytes: u64,
    pub artifact_ttl: Duration,
    pub result_ttl: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub preload: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.pipeline.workers,
            queue_capacity: config.pipeline.queue_capacity,
            checkout_timeout: Duration::from_millis(config.pipeline.checkout_timeout_ms),
            inference_timeout: Duration::from_millis(config.pipeline.inference_timeout_ms),
            abort_grace: Duration::from_millis(config.pipeline.abort_grace_ms),
            dequeue_poll: Duration::from_millis(config.pipeline.dequeue_poll_ms),
            upload_dir: PathBuf::from(&config.storage.upload_dir),
            max_artifact_bytes: config.storage.max_artifact_bytes,
            artifact_ttl: config.artifact_ttl(),
            result_ttl: Duration::from_secs(config.results.ttl_secs),
            sweep_interval: Duration::from_secs(config.cleanup.interval_secs),
            stale_after: config.stale_after(),
            preload: config.models.preload,
        }
    }
}

/// An accepted upload, ready to be turned into a job.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    /// Extension including the dot, already checked against the allowed list.
    pub extension: String,
    pub bytes: Vec<u8>,
    pub options: TranscriptionOptions,
}

/// Returned by a successful submit.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub queue_position: Option<usize>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Inputs to `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub accepting: bool,
    pub workers_active: usize,
    pub workers_total: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub registry: RegistrySummary,
}

/// Inputs to `/api/v1/queue` and `/api/v1/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub jobs: JobCounts,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub results_pending: usize,
    pub results_stored: usize,
    pub artifacts_stored: usize,
    pub artifact_bytes: u64,
    pub workers: Vec<WorkerStatus>,
}

pub struct Pipeline {
    queue: Arc<JobQueue>,
    registry: ModelRegistry,
    jobs: Arc<JobTable>,
    results: Arc<ResultStore>,
    artifacts: Arc<ArtifactStore>,
    workers: WorkerPool,
    sweeper: Arc<Sweeper>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Build every component, clean up after a previous process and start the
    /// workers and the sweeper.
    pub async fn start(
        settings: PipelineSettings,
        engine: Arc<dyn SpeechEngine>,
        devices: &[DeviceSpec],
    ) -> Result<Self, PipelineError> {
        let artifacts = Arc::new(
            ArtifactStore::open_dir(
                &settings.upload_dir,
                settings.max_artifact_bytes,
                settings.artifact_ttl,
            )
            .await?,
        );
        if let Err(err) = artifacts.purge_orphans().await {
            warn!(error = %err, "Could not scan the upload directory for leftovers");
        }

        let registry = ModelRegistry::new(engine, devices);
        if settings.preload {
            let loaded = registry.preload().await;
            info!(loaded, total = registry.size(), "Preloaded model instances");
        }

        let queue = Arc::new(JobQueue::new(settings.queue_capacity));
        let jobs = Arc::new(JobTable::new());
        let results = Arc::new(ResultStore::new(settings.result_ttl));
        let shutdown = CancellationToken::new();

        let workers = WorkerPool::spawn(
            settings.workers,
            Arc::new(WorkerContext {
                queue: queue.clone(),
                registry: registry.clone(),
                jobs: jobs.clone(),
                results: results.clone(),
                artifacts: artifacts.clone(),
                settings: WorkerSettings {
                    checkout_timeout: settings.checkout_timeout,
                    inference_timeout: settings.inference_timeout,
                    abort_grace: settings.abort_grace,
                    dequeue_poll: settings.dequeue_poll,
                },
                shutdown: shutdown.clone(),
            }),
        );

        let sweeper = Arc::new(Sweeper {
            artifacts: artifacts.clone(),
            results: results.clone(),
            jobs: jobs.clone(),
            registry: registry.clone(),
            stale_after: settings.stale_after,
        });
        let sweeper_task = sweeper
            .clone()
            .spawn(settings.sweep_interval, shutdown.clone());

        info!(
            workers = settings.workers,
            slots = registry.size(),
            queue_capacity = settings.queue_capacity,
            upload_dir = %settings.upload_dir.display(),
            "Transcription pipeline started"
        );

        Ok(Self {
            queue,
            registry,
            jobs,
            results,
            artifacts,
            workers,
            sweeper,
            sweeper_task: Mutex::new(Some(sweeper_task)),
            shutdown,
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn max_artifact_bytes(&self) -> u64 {
        self.artifacts.max_bytes()
    }

    /// Store the upload and queue a job for it.
    ///
    /// Waits at most `timeout` for queue space; a zero timeout fails fast with
    /// `QueueFull`. On any failure nothing is left behind.
    pub async fn submit(
        &self,
        upload: Upload,
        timeout: Duration,
    ) -> Result<Submission, PipelineError> {
        if self.queue.is_closed() {
            return Err(PipelineError::QueueClosed);
        }

        let artifact = self.artifacts.save(&upload.bytes, &upload.extension).await?;
        let job = Job::new(artifact.reference.clone(), upload.options);
        let job_id = job.id;

        if let Err(err) = self.jobs.insert(&job, &upload.filename, artifact.size_bytes) {
            self.discard(&artifact.reference).await;
            return Err(err);
        }
        self.results.track(job_id);

        if let Err(err) = self.queue.enqueue(job, timeout).await {
            self.jobs.remove(job_id);
            self.results.forget(job_id);
            self.discard(&artifact.reference).await;
            debug!(job_id = %job_id, error = %err, "Submission rejected");
            return Err(err);
        }

        let queue_position = self.jobs.get(job_id).and_then(|r| r.queue_position);
        info!(
            job_id = %job_id,
            filename = %upload.filename,
            size_bytes = artifact.size_bytes,
            queue_position = ?queue_position,
            "Job queued"
        );
        Ok(Submission {
            job_id,
            queue_position,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256,
        })
    }

    async fn discard(&self, reference: &artifacts::ArtifactRef) {
        if let Err(err) = self.artifacts.delete(reference).await {
            warn!(artifact = %reference, error = %err, "Failed to delete artifact");
        }
    }

    pub fn status(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.get(id)
    }

    pub fn result(&self, id: JobId) -> ResultStatus {
        self.results.get(id)
    }

    /// Block until the job has an outcome or `timeout` passes.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> ResultStatus {
        self.results.wait(id, Instant::now() + timeout).await
    }

    /// Cooperative cancellation.
    ///
    /// A queued job is `Cancelled` right away: it leaves the queue, freeing its
    /// place, and its artifact is deleted. If a worker has already claimed it the
    /// worker skips it instead. A running job keeps running; its outcome is
    /// replaced by `Cancelled`.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, PipelineError> {
        let outcome = self.jobs.request_cancel(id)?;
        if outcome == CancelOutcome::Cancelled {
            if !self.results.put(id, JobOutcome::Cancelled) {
                debug!(job_id = %id, "Cancelled job already had an outcome");
            }
            match self.queue.remove(id) {
                Some(job) => self.discard(&job.artifact).await,
                None => debug!(job_id = %id, "Cancelled job already claimed by a worker"),
            }
        }
        info!(job_id = %id, outcome = ?outcome, "Cancellation requested");
        Ok(outcome)
    }

    pub fn list(&self, status: Option<JobState>, limit: usize) -> Vec<JobRecord> {
        self.jobs.list(status, limit)
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            accepting: !self.queue.is_closed(),
            workers_active: self.workers.table().active(),
            workers_total: self.workers.table().len(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            registry: self.registry.summary(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let (results_pending, results_stored) = self.results.counts();
        PipelineStats {
            jobs: self.jobs.counts(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            results_pending,
            results_stored,
            artifacts_stored: self.artifacts.len(),
            artifact_bytes: self.artifacts.total_bytes(),
            workers: self.workers.table().snapshot(),
        }
    }

    /// Run one cleanup pass now instead of waiting for the next tick.
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep_once(Instant::now()).await
    }

    /// Stop accepting work, cancel everything still queued, give running jobs
    /// up to `grace` to finish, then unload the models.
    ///
    /// Jobs still running when the grace period ends are failed with `WorkerLost`.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down transcription pipeline");
        self.shutdown.cancel();

        let drained = self.queue.close();
        let mut cancelled = 0;
        for job in drained {
            if self.jobs.finish(job.id, JobState::Cancelled, None).is_ok() {
                cancelled += 1;
            }
            let _ = self.results.put(job.id, JobOutcome::Cancelled);
            self.discard(&job.artifact).await;
        }
        if cancelled > 0 {
            info!(cancelled, "Cancelled queued jobs");
        }

        let aborted = self.workers.join(grace).await;
        if aborted > 0 {
            let lost = self
                .sweeper
                .fail_lost(self.jobs.running(), "worker stopped during shutdown")
                .await;
            warn!(aborted, lost, "Failed jobs held by aborted workers");
        }

        let sweeper_task = lock(&self.sweeper_task).take();
        if let Some(task) = sweeper_task {
            let _ = task.await;
        }

        let unloaded = self.registry.unload_idle();
        info!(unloaded, "Transcription pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::FailureKind;
    use crate::transcription::testing::{wav_bytes, ScriptedEngine};

    fn settings(dir: &std::path::Path, workers: usize) -> PipelineSettings {
        PipelineSettings {
            workers,
            queue_capacity: 16,
            checkout_timeout: Duration::from_secs(5),
            inference_timeout: Duration::from_secs(5),
            abort_grace: Duration::from_millis(200),
            dequeue_poll: Duration::from_millis(50),
            upload_dir: dir.to_path_buf(),
            max_artifact_bytes: 1024 * 1024,
            artifact_ttl: Duration::from_secs(60),
            result_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60),
            preload: false,
        }
    }

    fn upload() -> Upload {
        Upload {
            filename: "clip.wav".to_string(),
            extension: ".wav".to_string(),
            bytes: wav_bytes(0.5, 16_000),
            options: TranscriptionOptions::default(),
        }
    }

    async fn submit(pipeline: &Pipeline) -> JobId {
        pipeline
            .submit(upload(), Duration::from_secs(1))
            .await
            .unwrap()
            .job_id
    }

    async fn wait(pipeline: &Pipeline, id: JobId) -> ResultStatus {
        pipeline.wait(id, Duration::from_secs(10)).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_instance_serializes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().with_latency(Duration::from_millis(50));
        let recorder = engine.recorder();
        // Two workers contend for one model instance.
        let pipeline = Pipeline::start(settings(dir.path(), 2), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let first = submit(&pipeline).await;
        let second = submit(&pipeline).await;
        assert!(matches!(wait(&pipeline, first).await, ResultStatus::Succeeded(_)));
        assert!(matches!(wait(&pipeline, second).await, ResultStatus::Succeeded(_)));

        let runs = recorder.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].started >= runs[0].finished);
        assert_eq!(recorder.loads(), 1);

        // Artifacts are removed once their job is done.
        let deadline = Instant::now() + Duration::from_secs(1);
        while pipeline.stats().artifacts_stored > 0 {
            assert!(Instant::now() < deadline, "artifacts were not deleted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instances_are_never_shared() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().with_latency(Duration::from_millis(10));
        let recorder = engine.recorder();
        let pipeline = Pipeline::start(
            settings(dir.path(), 2),
            Arc::new(engine),
            &[DeviceSpec::Cpu, DeviceSpec::Cpu],
        )
        .await
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(submit(&pipeline).await);
        }
        for id in ids {
            assert!(matches!(wait(&pipeline, id).await, ResultStatus::Succeeded(_)));
        }
        assert_eq!(recorder.calls(), 10);
        assert_eq!(recorder.overlaps(), 0);
        assert!(recorder.max_parallel() <= 2);

        let stats = pipeline.stats();
        assert_eq!(stats.jobs.succeeded, 10);
        assert!(stats.jobs.average_speed.is_some());
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn inference_timeout_fails_job_and_frees_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 1);
        settings.inference_timeout = Duration::from_millis(50);
        let engine = ScriptedEngine::new().with_latency(Duration::from_secs(2));
        let pipeline = Pipeline::start(settings, Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        match wait(&pipeline, id).await {
            ResultStatus::Failed(cause) => assert_eq!(cause.kind, FailureKind::InferenceTimeout),
            other => panic!("expected failure, got {:?}", other),
        }
        let registry = pipeline.health().registry;
        assert_eq!(registry.busy, 0);
        assert_eq!(registry.loaded, 1);
        assert_eq!(pipeline.status(id).unwrap().status, JobState::Failed);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instance_ignoring_abort_is_released_when_it_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 1);
        settings.inference_timeout = Duration::from_millis(50);
        settings.abort_grace = Duration::from_millis(20);
        let engine = ScriptedEngine::new()
            .with_latency(Duration::from_millis(300))
            .ignoring_abort();
        let pipeline = Pipeline::start(settings, Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        assert!(matches!(wait(&pipeline, id).await, ResultStatus::Failed(_)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.health().registry.busy > 0 {
            assert!(Instant::now() < deadline, "instance was never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The slot is usable again.
        let next = submit(&pipeline).await;
        assert!(matches!(wait(&pipeline, next).await, ResultStatus::Failed(_)));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_queued_job_is_never_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().with_latency(Duration::from_millis(200));
        let recorder = engine.recorder();
        let pipeline = Pipeline::start(settings(dir.path(), 1), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let first = submit(&pipeline).await;
        let second = submit(&pipeline).await;
        assert_eq!(pipeline.cancel(second).await.unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(pipeline.result(second), ResultStatus::Cancelled));

        assert!(matches!(wait(&pipeline, first).await, ResultStatus::Succeeded(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.calls(), 1);
        assert_eq!(pipeline.status(second).unwrap().status, JobState::Cancelled);

        // Terminal jobs cannot be cancelled again.
        assert!(matches!(
            pipeline.cancel(first).await,
            Err(PipelineError::InvalidTransition { .. })
        ));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_running_job_discards_its_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().with_latency(Duration::from_millis(200));
        let pipeline = Pipeline::start(settings(dir.path(), 1), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.status(id).unwrap().status != JobState::Running {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pipeline.cancel(id).await.unwrap(), CancelOutcome::Requested);
        assert!(matches!(wait(&pipeline, id).await, ResultStatus::Cancelled));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_fails_jobs_of_aborted_workers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().with_latency(Duration::from_secs(2));
        let pipeline = Pipeline::start(settings(dir.path(), 1), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.status(id).unwrap().status != JobState::Running {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pipeline.shutdown(Duration::from_millis(50)).await;

        let record = pipeline.status(id).unwrap();
        assert_eq!(record.status, JobState::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::WorkerLost);
        match pipeline.result(id) {
            ResultStatus::Failed(cause) => assert_eq!(cause.kind, FailureKind::WorkerLost),
            other => panic!("expected failure, got {:?}", other),
        }
        let stats = pipeline.stats();
        assert_eq!(stats.jobs.running, 0);
        assert_eq!(stats.artifacts_stored, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_pending() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(
            settings(dir.path(), 1),
            Arc::new(ScriptedEngine::new()),
            &[DeviceSpec::Cpu],
        )
        .await
        .unwrap();

        let id = JobId::new();
        assert!(matches!(pipeline.result(id), ResultStatus::Unknown));
        assert!(pipeline.status(id).is_none());
        assert!(matches!(pipeline.cancel(id).await, Err(PipelineError::UnknownJob(_))));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancelled_queued_job_frees_its_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 0);
        settings.queue_capacity = 1;
        let pipeline = Pipeline::start(settings, Arc::new(ScriptedEngine::new()), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let first = pipeline.submit(upload(), Duration::ZERO).await.unwrap().job_id;
        assert!(matches!(
            pipeline.submit(upload(), Duration::ZERO).await,
            Err(PipelineError::QueueFull)
        ));
        assert_eq!(pipeline.cancel(first).await.unwrap(), CancelOutcome::Cancelled);

        let stats = pipeline.stats();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.artifacts_stored, 0);
        assert_eq!(stats.jobs.cancelled, 1);

        let next = pipeline.submit(upload(), Duration::ZERO).await.unwrap();
        assert_eq!(next.queue_position, Some(1));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn zero_timeout_submit_rejects_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 0);
        settings.queue_capacity = 2;
        let pipeline = Pipeline::start(settings, Arc::new(ScriptedEngine::new()), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let first = pipeline.submit(upload(), Duration::ZERO).await.unwrap();
        let second = pipeline.submit(upload(), Duration::ZERO).await.unwrap();
        assert_eq!(first.queue_position, Some(1));
        assert_eq!(second.queue_position, Some(2));
        assert!(matches!(
            pipeline.submit(upload(), Duration::ZERO).await,
            Err(PipelineError::QueueFull)
        ));

        // The rejected upload left nothing behind.
        let stats = pipeline.stats();
        assert_eq!(stats.artifacts_stored, 2);
        assert_eq!(stats.jobs.queued, 2);
        assert_eq!(stats.results_pending, 2);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn oversized_upload_never_reaches_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 0);
        settings.max_artifact_bytes = 16;
        let pipeline = Pipeline::start(settings, Arc::new(ScriptedEngine::new()), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        assert!(matches!(
            pipeline.submit(upload(), Duration::ZERO).await,
            Err(PipelineError::ArtifactTooLarge { .. })
        ));
        assert_eq!(pipeline.health().queue_depth, 0);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_slot_degrades_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().failing_slot(0);
        let pipeline = Pipeline::start(
            settings(dir.path(), 2),
            Arc::new(engine),
            &[DeviceSpec::Cpu, DeviceSpec::Cpu],
        )
        .await
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(submit(&pipeline).await);
        }
        for id in ids {
            assert!(matches!(wait(&pipeline, id).await, ResultStatus::Succeeded(_)));
        }
        let registry = pipeline.health().registry;
        assert_eq!(registry.failed, 1);
        assert_eq!(registry.total, 2);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_capacity_fails_jobs_instead_of_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().failing_slot(0);
        let pipeline = Pipeline::start(settings(dir.path(), 1), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        match wait(&pipeline, id).await {
            ResultStatus::Failed(cause) => assert_eq!(cause.kind, FailureKind::ModelLoadFailure),
            other => panic!("expected failure, got {:?}", other),
        }
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn inference_error_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new().failing_inference();
        let pipeline = Pipeline::start(settings(dir.path(), 1), Arc::new(engine), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        let id = submit(&pipeline).await;
        match wait(&pipeline, id).await {
            ResultStatus::Failed(cause) => assert_eq!(cause.kind, FailureKind::InferenceError),
            other => panic!("expected failure, got {:?}", other),
        }
        // The worker survives and takes the next job.
        let next = submit(&pipeline).await;
        assert!(matches!(wait(&pipeline, next).await, ResultStatus::Failed(_)));
        assert_eq!(pipeline.health().workers_active, 1);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn sweeper_removes_abandoned_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), 0);
        settings.artifact_ttl = Duration::from_millis(100);
        settings.sweep_interval = Duration::from_millis(100);
        let pipeline = Pipeline::start(settings, Arc::new(ScriptedEngine::new()), &[DeviceSpec::Cpu])
            .await
            .unwrap();

        pipeline.submit(upload(), Duration::ZERO).await.unwrap();
        assert_eq!(pipeline.stats().artifacts_stored, 1);

        tokio::time::sleep(Duration::from_millis(280)).await;
        assert_eq!(pipeline.stats().artifacts_stored, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::start(
            settings(dir.path(), 0),
            Arc::new(ScriptedEngine::new()),
            &[DeviceSpec::Cpu],
        )
        .await
        .unwrap();

        let id = submit(&pipeline).await;
        pipeline.shutdown(Duration::from_secs(1)).await;

        assert!(matches!(pipeline.result(id), ResultStatus::Cancelled));
        assert_eq!(pipeline.status(id).unwrap().status, JobState::Cancelled);
        assert_eq!(pipeline.stats().artifacts_stored, 0);
        assert!(!pipeline.health().accepting);
        assert!(matches!(
            pipeline.submit(upload(), Duration::ZERO).await,
            Err(PipelineError::QueueClosed)
        ));
    }
}
