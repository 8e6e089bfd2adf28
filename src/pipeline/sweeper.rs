//! # Sweeper
//!
//! Periodic background cleanup. Each pass runs three independent steps; a failure
//! in one is logged and does not stop the others.
//!
//! ## Steps:
//! 1. **Artifacts**: delete uploads whose lease has expired
//! 2. **Results**: evict outcomes past their retention window, along with their job records
//! 3. **Lost jobs**: jobs stuck in `Running` past the stale threshold are failed with
//!    `WorkerLost`, their model slot is reclaimed and their artifact removed
//!
//! Shutdown reuses the lost-job step for workers it had to abort.

use crate::pipeline::artifacts::{ArtifactRef, ArtifactStore};
use crate::pipeline::error::{FailureCause, FailureKind};
use crate::pipeline::job::{JobId, JobState, JobTable};
use crate::pipeline::results::{JobOutcome, ResultStore};
use crate::transcription::registry::ModelRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub artifacts_deleted: usize,
    pub results_evicted: usize,
    pub jobs_evicted: usize,
    pub jobs_lost: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Sweeper {
    pub artifacts: Arc<ArtifactStore>,
    pub results: Arc<ResultStore>,
    pub jobs: Arc<JobTable>,
    pub registry: ModelRegistry,
    pub stale_after: Duration,
}

impl Sweeper {
    pub async fn sweep_once(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport {
            artifacts_deleted: self.artifacts.expire(now).await,
            ..Default::default()
        };

        let evicted = self.results.evict_expired(now);
        report.results_evicted = evicted.len();
        report.jobs_evicted = self.jobs.remove_many(&evicted);

        let stale = self.jobs.stale_running(self.stale_after, now);
        let reason = format!("no progress reported for {}s", self.stale_after.as_secs());
        report.jobs_lost = self.fail_lost(stale, &reason).await;

        if !report.is_empty() {
            info!(
                artifacts = report.artifacts_deleted,
                results = report.results_evicted,
                jobs = report.jobs_evicted,
                lost = report.jobs_lost,
                "Cleanup pass finished"
            );
        }
        report
    }

    /// Fail jobs whose worker is gone with `WorkerLost`, reclaim their model slot
    /// and delete their artifact. Jobs that finished in the meantime are left alone.
    pub async fn fail_lost(&self, lost: Vec<(JobId, ArtifactRef)>, reason: &str) -> usize {
        let mut failed = 0;
        for (job_id, artifact) in lost {
            let cause = FailureCause::new(FailureKind::WorkerLost, reason);
            match self.jobs.finish(job_id, JobState::Failed, Some(cause.clone())) {
                Ok(_) => {
                    warn!(job_id = %job_id, reason, "Declaring job lost");
                    let _ = self.results.put(job_id, JobOutcome::Failed(cause));
                    if self.registry.reclaim(job_id) {
                        debug!(job_id = %job_id, "Reclaimed model slot from lost job");
                    }
                    if let Err(err) = self.artifacts.delete(&artifact).await {
                        warn!(job_id = %job_id, error = %err, "Failed to delete artifact of lost job");
                    }
                    failed += 1;
                }
                // The worker reported back between the scan and the transition.
                Err(err) => debug!(job_id = %job_id, error = %err, "Lost job already finished"),
            }
        }
        failed
    }

    /// Run `sweep_once` every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once(Instant::now()).await;
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use crate::pipeline::job::Job;
    use crate::transcription::engine::TranscriptionOptions;
    use crate::transcription::testing::ScriptedEngine;

    async fn sweeper(dir: &std::path::Path, ttl: Duration, stale: Duration) -> Sweeper {
        Sweeper {
            artifacts: Arc::new(ArtifactStore::open_dir(dir, 1024, ttl).await.unwrap()),
            results: Arc::new(ResultStore::new(ttl)),
            jobs: Arc::new(JobTable::new()),
            registry: ModelRegistry::new(Arc::new(ScriptedEngine::new()), &[DeviceSpec::Cpu]),
            stale_after: stale,
        }
    }

    #[tokio::test]
    async fn expired_artifacts_and_results_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = sweeper(dir.path(), Duration::from_secs(10), Duration::from_secs(60)).await;

        let artifact = sweeper.artifacts.save(b"RIFF", ".wav").await.unwrap();
        let job = Job::new(artifact.reference.clone(), TranscriptionOptions::default());
        sweeper.jobs.insert(&job, "a.wav", 4).unwrap();
        sweeper.results.track(job.id);
        sweeper.jobs.finish(job.id, JobState::Cancelled, None).unwrap();
        assert!(sweeper.results.put(job.id, JobOutcome::Cancelled));

        let early = sweeper.sweep_once(Instant::now()).await;
        assert!(early.is_empty());

        let late = sweeper
            .sweep_once(Instant::now() + Duration::from_secs(11))
            .await;
        assert_eq!(late.artifacts_deleted, 1);
        assert_eq!(late.results_evicted, 1);
        assert_eq!(late.jobs_evicted, 1);
        assert!(sweeper.jobs.get(job.id).is_none());
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn stale_running_job_is_failed_as_lost() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = sweeper(dir.path(), Duration::from_secs(600), Duration::from_secs(5)).await;

        let artifact = sweeper.artifacts.save(b"RIFF", ".wav").await.unwrap();
        let job = Job::new(artifact.reference.clone(), TranscriptionOptions::default());
        sweeper.jobs.insert(&job, "a.wav", 4).unwrap();
        sweeper.results.track(job.id);
        sweeper.jobs.mark_running(job.id, 0).unwrap();

        let report = sweeper
            .sweep_once(Instant::now() + Duration::from_secs(6))
            .await;
        assert_eq!(report.jobs_lost, 1);

        let record = sweeper.jobs.get(job.id).unwrap();
        assert_eq!(record.status, JobState::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::WorkerLost);
        assert!(matches!(
            sweeper.results.get(job.id),
            crate::pipeline::results::ResultStatus::Failed(_)
        ));
        assert!(sweeper.artifacts.get(&artifact.reference).is_none());

        // A late report from the original worker loses.
        assert!(sweeper.jobs.finish(job.id, JobState::Succeeded, None).is_err());
    }
}
