//! Task queue abstractions.
//!
//! The queue is the only place the pipeline suspends: producers enqueue task
//! ids, workers reserve jobs and report back how dispatch went. Delivery is
//! at-least-once, so consumers must tolerate duplicates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;

/// Reference to an enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    /// Queue-assigned job identifier.
    pub job_id: Uuid,
    /// The task the job will dispatch.
    pub task_id: Uuid,
}

/// A job reserved by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub handle: JobHandle,
    /// 1 on first delivery.
    pub delivery: u32,
    /// How long the worker may spend dispatching this job.
    pub timeout: Duration,
}

/// What the queue does with a job whose dispatch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// The job will be delivered again at `retry_at`.
    Retrying {
        /// Earliest time of the next delivery.
        retry_at: DateTime<Utc>,
    },
    /// No deliveries left.
    Dead,
}

/// Producer side of the queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a dispatch of `task_id` that may run for at most `timeout`.
    async fn enqueue(&self, task_id: Uuid, timeout: Duration) -> Result<JobHandle, DomainError>;
}

/// Consumer side of the queue.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Reserves the next due job, if any.
    async fn reserve(&self) -> Result<Option<Job>, DomainError>;

    /// Acknowledges a successfully dispatched job.
    async fn complete(&self, job: &Job) -> Result<(), DomainError>;

    /// Reports a failed dispatch and applies the queue's retry policy.
    async fn fail(&self, job: &Job, error: &str) -> Result<JobDisposition, DomainError>;

    /// Marks a job dead without retrying, for failures a redelivery cannot
    /// fix (missing task, unknown step kind).
    async fn bury(&self, job: &Job, error: &str) -> Result<(), DomainError>;

    /// Marks dead every job whose reservation expired on its last allowed
    /// delivery (its worker died without reporting back) and returns them.
    /// Such jobs are never reserved again.
    async fn reap_expired(&self) -> Result<Vec<JobHandle>, DomainError>;
}
