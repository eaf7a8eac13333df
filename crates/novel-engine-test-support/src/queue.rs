//! Test queues: in-memory `TaskQueue` / `JobSource` implementations.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use novel_engine_core::error::DomainError;
use novel_engine_core::queue::{Job, JobDisposition, JobHandle, JobSource, TaskQueue};
use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Job>,
    active: Vec<Job>,
    expired: Vec<Job>,
    enqueued: Vec<JobHandle>,
    completed: Vec<JobHandle>,
    dead: Vec<(JobHandle, String)>,
}

/// A FIFO queue held in memory. Failed jobs go to the back of the queue
/// until they have been delivered `max_deliveries` times.
///
/// Reservations never time out on their own; [`Self::expire_active`] plays
/// the part of the reservation deadline passing.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    max_deliveries: u32,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskQueue {
    /// Creates a queue that never redelivers a failed job.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_deliveries(1)
    }

    /// Creates a queue that delivers each job up to `max_deliveries` times.
    #[must_use]
    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_deliveries,
        }
    }

    /// Every handle ever returned by `enqueue`, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn enqueued(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().enqueued.clone()
    }

    /// Number of jobs waiting to be reserved.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// Jobs acknowledged as dispatched.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn completed(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().completed.clone()
    }

    /// Jobs that ran out of deliveries or were buried, with the last error.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn dead(&self) -> Vec<(JobHandle, String)> {
        self.state.lock().unwrap().dead.clone()
    }

    /// Expires every reservation nobody reported back on, as if its worker
    /// died. Jobs with deliveries left become reservable again; the rest
    /// wait for `reap_expired`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn expire_active(&self) {
        let mut state = self.state.lock().unwrap();
        let active = std::mem::take(&mut state.active);
        for job in active {
            if job.delivery < self.max_deliveries {
                state.ready.push_back(job);
            } else {
                state.expired.push(job);
            }
        }
    }
}

impl QueueState {
    fn settle(&mut self, job: &Job) {
        self.active.retain(|active| active.handle.job_id != job.handle.job_id);
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task_id: Uuid, timeout: Duration) -> Result<JobHandle, DomainError> {
        let handle = JobHandle {
            job_id: Uuid::new_v4(),
            task_id,
        };
        let mut state = self.state.lock().unwrap();
        state.enqueued.push(handle);
        state.ready.push_back(Job {
            handle,
            delivery: 0,
            timeout,
        });
        Ok(handle)
    }
}

#[async_trait]
impl JobSource for InMemoryTaskQueue {
    async fn reserve(&self) -> Result<Option<Job>, DomainError> {
        let mut state = self.state.lock().unwrap();
        let Some(mut job) = state.ready.pop_front() else {
            return Ok(None);
        };
        job.delivery += 1;
        state.active.push(job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        state.settle(job);
        state.completed.push(job.handle);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, DomainError> {
        let mut state = self.state.lock().unwrap();
        state.settle(job);
        if job.delivery < self.max_deliveries {
            state.ready.push_back(job.clone());
            Ok(JobDisposition::Retrying {
                retry_at: Utc::now(),
            })
        } else {
            state.dead.push((job.handle, error.to_owned()));
            Ok(JobDisposition::Dead)
        }
    }

    async fn bury(&self, job: &Job, error: &str) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        state.settle(job);
        state.dead.push((job.handle, error.to_owned()));
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<JobHandle>, DomainError> {
        let mut state = self.state.lock().unwrap();
        let expired = std::mem::take(&mut state.expired);
        let handles: Vec<JobHandle> = expired.iter().map(|job| job.handle).collect();
        state.dead.extend(
            handles
                .iter()
                .map(|handle| (*handle, "reservation expired on the last delivery".to_owned())),
        );
        Ok(handles)
    }
}

/// A task queue whose `enqueue` always fails. Useful for testing the
/// compensation paths around enqueueing.
#[derive(Debug)]
pub struct FailingTaskQueue;

#[async_trait]
impl TaskQueue for FailingTaskQueue {
    async fn enqueue(&self, _task_id: Uuid, _timeout: Duration) -> Result<JobHandle, DomainError> {
        Err(DomainError::Infrastructure("queue unavailable".into()))
    }
}
