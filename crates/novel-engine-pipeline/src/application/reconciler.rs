//! Recovery sweep for tasks nobody is going to deliver.
//!
//! Two kinds of work get lost. The store commit and the enqueue that follows
//! it are separate steps, so a crash or queue outage between them leaves a
//! pending task with no job. And a worker that dies mid-dispatch leaves its
//! task running under a lock that only goes stale later; any redelivery that
//! arrives before then is skipped as in flight and acknowledged. The
//! reconciler enqueues both kinds again, and fails the iteration of an
//! orphaned task that has used up its claims. Staleness is judged with the
//! same clock and timeout the dispatcher claims with, so a re-enqueued
//! orphan is always claimable. Duplicate jobs are harmless because claims
//! are idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use novel_engine_core::clock::Clock;
use novel_engine_core::error::DomainError;
use novel_engine_core::queue::TaskQueue;
use novel_engine_core::records::Task;
use novel_engine_core::repository::WorkStore;
use tracing::{error, info, warn};

/// Claims an orphaned task may use before its iteration is failed.
pub const DEFAULT_CLAIM_LIMIT: u32 = 3;

pub struct Reconciler {
    store: Arc<dyn WorkStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    /// How long a task may sit pending and unclaimed before it is presumed
    /// lost.
    stall_after: Duration,
    /// Age of a lock after which its worker is presumed dead.
    job_timeout: Duration,
    claim_limit: u32,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("stall_after", &self.stall_after)
            .field("job_timeout", &self.job_timeout)
            .field("claim_limit", &self.claim_limit)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        stall_after: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            stall_after,
            job_timeout,
            claim_limit: DEFAULT_CLAIM_LIMIT,
        }
    }

    /// Sets how many claims an orphaned task may use before its iteration
    /// is failed instead of re-enqueued.
    #[must_use]
    pub fn with_claim_limit(mut self, claim_limit: u32) -> Self {
        self.claim_limit = claim_limit.max(1);
        self
    }

    /// Re-enqueues every stalled or orphaned task and returns how many were
    /// enqueued.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if listing tasks fails. Individual enqueue and
    /// retirement failures are logged and left for the next sweep.
    pub async fn sweep(&self) -> Result<usize, DomainError> {
        let now = self.clock.now();
        let stalled = self
            .store
            .stalled_tasks(before(now, self.stall_after))
            .await?;
        let orphaned = self
            .store
            .orphaned_tasks(before(now, self.job_timeout))
            .await?;

        let mut enqueued = 0;
        for task in &stalled {
            if self.requeue(task).await {
                enqueued += 1;
            }
        }
        let claim_limit = i32::try_from(self.claim_limit).unwrap_or(i32::MAX);
        for task in &orphaned {
            if task.attempts >= claim_limit {
                self.retire(task, now).await;
            } else if self.requeue(task).await {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(
                enqueued,
                stalled = stalled.len(),
                orphaned = orphaned.len(),
                "re-enqueued lost tasks"
            );
        }
        Ok(enqueued)
    }

    async fn requeue(&self, task: &Task) -> bool {
        match self.queue.enqueue(task.id, self.job_timeout).await {
            Ok(_) => true,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "lost task not re-enqueued");
                false
            }
        }
    }

    async fn retire(&self, task: &Task, now: DateTime<Utc>) {
        let reason = format!(
            "{} task orphaned after {} claims",
            task.step, task.attempts
        );
        warn!(task_id = %task.id, iteration_id = %task.iteration_id, %reason, "retiring iteration");
        if let Err(err) = self
            .store
            .abandon_iteration(task.iteration_id, &reason, now)
            .await
        {
            warn!(task_id = %task.id, error = %err, "orphaned iteration not retired");
        }
    }

    /// Sweeps every `interval` until `shutdown` resolves.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "reconcile sweep failed");
                    }
                }
            }
        }
        info!("reconciler stopped");
    }
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
