//! # Result Store
//!
//! Holds the terminal outcome of each job until a client collects it or the
//! retention window runs out.
//!
//! ## Key Properties:
//! - **Append-once**: the first outcome written for a job wins; later writes are ignored
//! - **Pending vs Unknown**: a tracked job without an outcome is `Pending`, an id
//!   that was never tracked (or has been evicted) is `Unknown`
//! - **TTL from write time**: retention starts when the outcome is written, not
//!   when the job was submitted
//! - **Waiters**: `wait` parks on a `Notify` that every `put` pulses

use crate::pipeline::error::FailureCause;
use crate::pipeline::job::{JobId, JobState};
use crate::pipeline::lock;
use crate::transcription::engine::TranscriptResult;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Terminal outcome of a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(TranscriptResult),
    Failed(FailureCause),
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }

    pub fn failure(&self) -> Option<FailureCause> {
        match self {
            JobOutcome::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }
}

/// Answer to "what happened to this job?".
#[derive(Debug, Clone)]
pub enum ResultStatus {
    Pending,
    Succeeded(TranscriptResult),
    Failed(FailureCause),
    Cancelled,
    Unknown,
}

impl From<JobOutcome> for ResultStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded(result) => ResultStatus::Succeeded(result),
            JobOutcome::Failed(cause) => ResultStatus::Failed(cause),
            JobOutcome::Cancelled => ResultStatus::Cancelled,
        }
    }
}

enum Entry {
    Pending,
    Done {
        outcome: JobOutcome,
        written_at: Instant,
    },
}

pub struct ResultStore {
    entries: Mutex<HashMap<JobId, Entry>>,
    ttl: Duration,
    written: Notify,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            written: Notify::new(),
        }
    }

    /// Start tracking a job so lookups report `Pending` instead of `Unknown`.
    pub fn track(&self, id: JobId) {
        lock(&self.entries).entry(id).or_insert(Entry::Pending);
    }

    /// Stop tracking a job that was never accepted.
    pub fn forget(&self, id: JobId) {
        let mut entries = lock(&self.entries);
        if matches!(entries.get(&id), Some(Entry::Pending)) {
            entries.remove(&id);
        }
    }

    /// Record a terminal outcome. Returns `false` if one was already recorded.
    #[must_use]
    pub fn put(&self, id: JobId, outcome: JobOutcome) -> bool {
        let written = {
            let mut entries = lock(&self.entries);
            match entries.get(&id) {
                Some(Entry::Done { .. }) => false,
                _ => {
                    entries.insert(
                        id,
                        Entry::Done {
                            outcome,
                            written_at: Instant::now(),
                        },
                    );
                    true
                }
            }
        };
        if written {
            self.written.notify_waiters();
        }
        written
    }

    pub fn get(&self, id: JobId) -> ResultStatus {
        match lock(&self.entries).get(&id) {
            None => ResultStatus::Unknown,
            Some(Entry::Pending) => ResultStatus::Pending,
            Some(Entry::Done { outcome, .. }) => outcome.clone().into(),
        }
    }

    /// Block until the job has an outcome or `deadline` passes.
    pub async fn wait(&self, id: JobId, deadline: Instant) -> ResultStatus {
        loop {
            let notified = self.written.notified();
            tokio::pin!(notified);
            // Register before checking so a put between the check and the await is not missed.
            notified.as_mut().enable();

            let status = self.get(id);
            if !matches!(status, ResultStatus::Pending) {
                return status;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(id);
            }
        }
    }

    /// Drop outcomes older than the TTL. Returns the evicted job ids.
    pub fn evict_expired(&self, now: Instant) -> Vec<JobId> {
        let mut entries = lock(&self.entries);
        let expired: Vec<JobId> = entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Done { written_at, .. }
                    if now.saturating_duration_since(*written_at) >= self.ttl =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    /// (pending, completed) entry counts.
    pub fn counts(&self) -> (usize, usize) {
        let entries = lock(&self.entries);
        let pending = entries
            .values()
            .filter(|e| matches!(e, Entry::Pending))
            .count();
        (pending, entries.len() - pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::FailureKind;
    use std::sync::Arc;

    #[test]
    fn test_unknown_vs_pending() {
        let store = ResultStore::new(Duration::from_secs(60));
        let id = JobId::new();
        assert!(matches!(store.get(id), ResultStatus::Unknown));
        store.track(id);
        assert!(matches!(store.get(id), ResultStatus::Pending));
    }

    #[test]
    fn test_put_is_append_once() {
        let store = ResultStore::new(Duration::from_secs(60));
        let id = JobId::new();
        store.track(id);
        assert!(store.put(id, JobOutcome::Cancelled));
        assert!(!store.put(
            id,
            JobOutcome::Failed(FailureCause::new(FailureKind::WorkerLost, "late"))
        ));
        assert!(matches!(store.get(id), ResultStatus::Cancelled));
    }

    #[test]
    fn test_ttl_counts_from_write_time() {
        let store = ResultStore::new(Duration::from_secs(10));
        let id = JobId::new();
        store.track(id);
        assert!(store.evict_expired(Instant::now() + Duration::from_secs(60)).is_empty());

        assert!(store.put(id, JobOutcome::Cancelled));
        let written = Instant::now();
        assert!(store.evict_expired(written + Duration::from_secs(5)).is_empty());
        assert_eq!(store.evict_expired(written + Duration::from_secs(11)), vec![id]);
        assert!(matches!(store.get(id), ResultStatus::Unknown));
    }

    #[test]
    fn test_forget_only_removes_pending() {
        let store = ResultStore::new(Duration::from_secs(60));
        let id = JobId::new();
        store.track(id);
        store.forget(id);
        assert!(matches!(store.get(id), ResultStatus::Unknown));

        store.track(id);
        assert!(store.put(id, JobOutcome::Cancelled));
        store.forget(id);
        assert!(matches!(store.get(id), ResultStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_put() {
        let store = Arc::new(ResultStore::new(Duration::from_secs(60)));
        let id = JobId::new();
        store.track(id);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait(id, Instant::now() + Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.put(id, JobOutcome::Cancelled));

        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(status, ResultStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_times_out_as_pending() {
        let store = ResultStore::new(Duration::from_secs(60));
        let id = JobId::new();
        store.track(id);
        let status = store
            .wait(id, Instant::now() + Duration::from_millis(20))
            .await;
        assert!(matches!(status, ResultStatus::Pending));
    }
}
