//! # Job Queue
//!
//! Bounded FIFO between the HTTP layer and the worker pool.
//!
//! ## How it works:
//! - A `VecDeque` holds the jobs behind a short-lived mutex
//! - `slots` counts free capacity; producers acquire one permit per job
//! - `ready` counts queued jobs; workers acquire one permit per dequeue
//! - Permits are `forget()`-ed on acquire and handed to the other semaphore
//!   with `add_permits`, so the two counts always sum to the capacity
//!
//! `remove` takes a cancelled job out of the middle of the buffer. It needs a
//! `ready` permit to do so; when every queued job is already promised to a
//! waking worker it leaves the job in place for that worker to skip.
//!
//! Tokio semaphores wake waiters in FIFO order, so both blocked producers and
//! idle workers are served in arrival order. Closing the queue closes both
//! semaphores, which is the shutdown signal every waiter observes.

use crate::pipeline::error::PipelineError;
use crate::pipeline::job::{Job, JobId};
use crate::pipeline::lock;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;

pub struct JobQueue {
    buffer: Mutex<VecDeque<Job>>,
    capacity: usize,
    slots: Semaphore,
    ready: Semaphore,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Append a job, waiting up to `timeout` for space.
    ///
    /// A zero timeout never waits: a full queue fails immediately with `QueueFull`.
    pub async fn enqueue(&self, job: Job, timeout: Duration) -> Result<(), PipelineError> {
        let permit = if timeout.is_zero() {
            match self.slots.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(PipelineError::QueueFull),
                Err(TryAcquireError::Closed) => return Err(PipelineError::QueueClosed),
            }
        } else {
            match tokio::time::timeout(timeout, self.slots.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PipelineError::QueueClosed),
                Err(_) => return Err(PipelineError::QueueFull),
            }
        };
        permit.forget();

        {
            let mut buffer = lock(&self.buffer);
            // close() drains under the same lock, so nothing can slip in behind it
            if self.ready.is_closed() {
                return Err(PipelineError::QueueClosed);
            }
            buffer.push_back(job);
        }
        self.ready.add_permits(1);
        Ok(())
    }

    /// Take the oldest job, waiting until `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes with nothing to do and
    /// `Err(QueueClosed)` once the queue has been shut down.
    pub async fn dequeue(&self, deadline: Instant) -> Result<Option<Job>, PipelineError> {
        let permit = match tokio::time::timeout_at(deadline, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PipelineError::QueueClosed),
            Err(_) => return Ok(None),
        };
        permit.forget();

        let job = lock(&self.buffer).pop_front();
        if job.is_some() {
            self.slots.add_permits(1);
        }
        Ok(job)
    }

    /// Take a still-queued job out of the buffer and free its capacity.
    ///
    /// Returns `None` if the job is not queued, or if every queued job is already
    /// claimed by a dequeue in progress.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let job = {
            let mut buffer = lock(&self.buffer);
            let position = buffer.iter().position(|job| job.id == id)?;
            self.ready.try_acquire().ok()?.forget();
            buffer.remove(position)
        };
        if job.is_some() {
            self.slots.add_permits(1);
        }
        job
    }

    /// Stop accepting and handing out work. Returns the jobs that were still waiting.
    pub fn close(&self) -> Vec<Job> {
        let mut buffer = lock(&self.buffer);
        self.ready.close();
        self.slots.close();
        buffer.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.ready.is_closed()
    }

    pub fn depth(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifacts::ArtifactRef;
    use crate::transcription::engine::TranscriptionOptions;
    use std::sync::Arc;

    fn job(name: &str) -> Job {
        Job::new(ArtifactRef::new(name), TranscriptionOptions::default())
    }

    #[tokio::test]
    async fn test_zero_timeout_enqueue_rejects_when_full() {
        let queue = JobQueue::new(2);
        queue.enqueue(job("a.wav"), Duration::ZERO).await.unwrap();
        queue.enqueue(job("b.wav"), Duration::ZERO).await.unwrap();

        let err = queue.enqueue(job("c.wav"), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull));
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(4);
        let first = job("1.wav");
        let second = job("2.wav");
        let (first_id, second_id) = (first.id, second.id);
        queue.enqueue(first, Duration::ZERO).await.unwrap();
        queue.enqueue(second, Duration::ZERO).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(queue.dequeue(deadline).await.unwrap().unwrap().id, first_id);
        assert_eq!(queue.dequeue(deadline).await.unwrap().unwrap().id, second_id);
    }

    #[tokio::test]
    async fn test_remove_frees_capacity() {
        let queue = JobQueue::new(2);
        let first = job("1.wav");
        let second = job("2.wav");
        let (first_id, second_id) = (first.id, second.id);
        queue.enqueue(first, Duration::ZERO).await.unwrap();
        queue.enqueue(second, Duration::ZERO).await.unwrap();

        assert_eq!(queue.remove(first_id).unwrap().id, first_id);
        assert!(queue.remove(first_id).is_none());
        assert_eq!(queue.depth(), 1);

        queue.enqueue(job("3.wav"), Duration::ZERO).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(queue.dequeue(deadline).await.unwrap().unwrap().id, second_id);
        assert!(queue.dequeue(deadline).await.unwrap().is_some());
        assert!(queue.dequeue(deadline).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_deadline_returns_none() {
        let queue = JobQueue::new(1);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(queue.dequeue(deadline).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocked_enqueue_proceeds_after_dequeue() {
        let queue = Arc::new(JobQueue::new(1));
        queue.enqueue(job("a.wav"), Duration::ZERO).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(job("b.wav"), Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let deadline = Instant::now() + Duration::from_millis(50);
        queue.dequeue(deadline).await.unwrap().unwrap();
        producer.await.unwrap().unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_times_out_when_full() {
        let queue = JobQueue::new(1);
        queue.enqueue(job("a.wav"), Duration::ZERO).await.unwrap();
        let err = queue
            .enqueue(job("b.wav"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull));
    }

    #[tokio::test]
    async fn test_close_drains_and_wakes_waiters() {
        let queue = Arc::new(JobQueue::new(2));
        queue.enqueue(job("a.wav"), Duration::ZERO).await.unwrap();

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_closed());

        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(matches!(
            queue.dequeue(deadline).await,
            Err(PipelineError::QueueClosed)
        ));
        assert!(matches!(
            queue.enqueue(job("b.wav"), Duration::ZERO).await,
            Err(PipelineError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_idle_worker() {
        let queue = Arc::new(JobQueue::new(1));
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .dequeue(Instant::now() + Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::QueueClosed)));
    }
}
