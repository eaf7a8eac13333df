//! Queue consumer that drives dispatches.
//!
//! A worker reserves jobs from a [`JobSource`], runs each dispatch under the
//! job's timeout and reports the result back to the queue. Jobs the queue
//! gives up on take their iteration down with them, so every iteration
//! eventually reaches a terminal status. That includes jobs whose worker died
//! on their last delivery, which the queue only reports through
//! [`JobSource::reap_expired`].
//!
//! A job whose task is in flight elsewhere is acknowledged: the holder
//! settles it, or, if the holder died, the reconciler re-enqueues the task
//! once its lock is stale.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use novel_engine_core::error::DomainError;
use novel_engine_core::queue::{Job, JobDisposition, JobSource};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::dispatcher::{DispatchOutcome, Dispatcher};

/// Worker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Maximum dispatches running at once.
    pub concurrency: usize,
    /// How long to wait before polling an empty queue again.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// What became of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    /// The dispatch ran (or was skipped) and the job was acknowledged.
    Dispatched(DispatchOutcome),
    /// The dispatch failed and the queue will deliver the job again.
    WillRetry {
        task_id: Uuid,
        retry_at: DateTime<Utc>,
    },
    /// The job will not be delivered again; its iteration was failed.
    Dead { task_id: Uuid, error: String },
}

#[derive(Clone)]
pub struct Worker {
    source: Arc<dyn JobSource>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub fn new(source: Arc<dyn JobSource>, dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Self {
        Self {
            source,
            dispatcher,
            config,
        }
    }

    /// Reserves and processes a single job, if one is due.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the queue or the store fails while the job
    /// is being reserved or settled.
    pub async fn run_once(&self) -> Result<Option<JobReport>, DomainError> {
        match self.source.reserve().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Fails the iterations of jobs that expired on their last delivery and
    /// returns how many jobs were reaped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the queue or the store fails.
    pub async fn reap(&self) -> Result<usize, DomainError> {
        let expired = self.source.reap_expired().await?;
        for handle in &expired {
            error!(task_id = %handle.task_id, job_id = %handle.job_id, "job expired with no deliveries left");
            self.dispatcher
                .retire(handle.task_id, "dispatch never reported back on its last delivery")
                .await?;
        }
        Ok(expired.len())
    }

    /// Processes jobs until `shutdown` resolves, then waits for in-flight
    /// dispatches to settle.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let concurrency = self.config.concurrency.max(1);
        let mut in_flight = JoinSet::new();
        let mut last_reap: Option<Instant> = None;
        info!(concurrency, "worker started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_joined(joined);
            }

            if last_reap.is_none_or(|at| at.elapsed() >= self.config.poll_interval) {
                last_reap = Some(Instant::now());
                if let Err(err) = self.reap().await {
                    error!(error = %err, "failed to reap expired jobs");
                }
            }

            if in_flight.len() >= concurrency {
                tokio::select! {
                    () = &mut shutdown => break,
                    Some(joined) = in_flight.join_next() => log_joined(joined),
                }
                continue;
            }

            let reserved = tokio::select! {
                biased;
                () = &mut shutdown => break,
                reserved = self.source.reserve() => reserved,
            };
            match reserved {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move { worker.process(job).await });
                }
                Ok(None) => {
                    tokio::select! {
                        () = &mut shutdown => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to reserve job");
                    tokio::select! {
                        () = &mut shutdown => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "worker draining");
        while let Some(joined) = in_flight.join_next().await {
            log_joined(joined);
        }
        info!("worker stopped");
    }

    /// Dispatches the task behind `job` and settles the job with the queue.
    ///
    /// Missing tasks and contract violations are buried at once; other
    /// failures follow the queue's retry policy.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if settling the job or failing the iteration
    /// fails.
    pub async fn process(&self, job: Job) -> Result<JobReport, DomainError> {
        let task_id = job.handle.task_id;
        debug!(%task_id, delivery = job.delivery, "processing job");

        let result = match tokio::time::timeout(job.timeout, self.dispatcher.dispatch(task_id)).await
        {
            Ok(result) => result,
            Err(_) => {
                let message = format!("dispatch exceeded {}s", job.timeout.as_secs_f64());
                self.dispatcher.abandon(task_id, &message).await?;
                Err(DomainError::Infrastructure(message))
            }
        };

        match result {
            Ok(outcome) => {
                self.source.complete(&job).await?;
                Ok(JobReport::Dispatched(outcome))
            }
            Err(err @ (DomainError::NotFound { .. } | DomainError::InvalidArgument(_))) => {
                let error = err.to_string();
                warn!(%task_id, %error, "burying job");
                self.source.bury(&job, &error).await?;
                self.dispatcher.retire(task_id, &error).await?;
                Ok(JobReport::Dead { task_id, error })
            }
            Err(err) => {
                let error = err.to_string();
                match self.source.fail(&job, &error).await? {
                    JobDisposition::Retrying { retry_at } => {
                        warn!(%task_id, %error, %retry_at, "dispatch failed, will retry");
                        Ok(JobReport::WillRetry { task_id, retry_at })
                    }
                    JobDisposition::Dead => {
                        error!(%task_id, %error, "dispatch failed, no deliveries left");
                        self.dispatcher.retire(task_id, &error).await?;
                        Ok(JobReport::Dead { task_id, error })
                    }
                }
            }
        }
    }
}

fn log_joined(joined: Result<Result<JobReport, DomainError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(report)) => debug!(?report, "job settled"),
        Ok(Err(err)) => error!(error = %err, "job could not be settled"),
        Err(err) => error!(error = %err, "dispatch task panicked or was cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use novel_engine_core::clock::Clock;
    use novel_engine_core::handler::{StepContext, StepHandler};
    use novel_engine_core::payload::{TaskInput, TaskOutput};
    use novel_engine_core::queue::TaskQueue;
    use novel_engine_core::records::{IterationStatus, TaskStatus};
    use novel_engine_core::repository::WorkStore;
    use novel_engine_core::step::StepKind;
    use novel_engine_test_support::{
        InMemoryTaskQueue, InMemoryWorkStore, ScriptedHandler, SteppingClock,
    };

    use super::*;
    use crate::application::dispatcher::SkipReason;
    use crate::application::reconciler::Reconciler;
    use crate::application::registry::HandlerRegistry;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        store: Arc<InMemoryWorkStore>,
        queue: Arc<InMemoryTaskQueue>,
        clock: Arc<SteppingClock>,
        worker: Worker,
    }

    fn harness(
        registry: impl FnOnce(Arc<dyn WorkStore>) -> HandlerRegistry,
        max_deliveries: u32,
        timeout: Duration,
    ) -> Harness {
        let store = Arc::new(InMemoryWorkStore::new());
        let queue = Arc::new(InMemoryTaskQueue::with_max_deliveries(max_deliveries));
        let work: Arc<dyn WorkStore> = store.clone();
        let clock = Arc::new(SteppingClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry(work),
            clock.clone(),
            timeout,
        );
        let worker = Worker::new(queue.clone(), Arc::new(dispatcher), WorkerConfig::default());
        Harness {
            store,
            queue,
            clock,
            worker,
        }
    }

    fn no_handlers(_store: Arc<dyn WorkStore>) -> HandlerRegistry {
        HandlerRegistry::new()
    }

    async fn start(h: &Harness, timeout: Duration) -> Uuid {
        let scene = h.store.seed_scene();
        let (iteration, task) = h
            .store
            .begin_iteration(scene.id, &TaskInput::initial(scene.id, 3, None), h.clock.now())
            .await
            .unwrap();
        h.queue.enqueue(task.id, timeout).await.unwrap();
        iteration.id
    }

    struct Sleepy;

    #[async_trait]
    impl StepHandler for Sleepy {
        fn step(&self) -> StepKind {
            StepKind::Plan
        }

        async fn handle(&self, _ctx: &StepContext) -> Result<TaskOutput, DomainError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TaskOutput::failure("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue_returns_none() {
        let h = harness(no_handlers, 1, MINUTE);

        assert_eq!(h.worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_successful_dispatch_acknowledges_job() {
        // Arrange
        let h = harness(
            |store| {
                HandlerRegistry::new().with(Arc::new(ScriptedHandler::new(StepKind::Plan, store)))
            },
            1,
            MINUTE,
        );
        start(&h, MINUTE).await;

        // Act
        let report = h.worker.run_once().await.unwrap().unwrap();

        // Assert
        assert!(matches!(
            report,
            JobReport::Dispatched(DispatchOutcome::Advanced { .. })
        ));
        assert_eq!(h.queue.completed().len(), 1);
        assert_eq!(h.queue.ready_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_retried_while_deliveries_remain() {
        // Arrange
        let h = harness(
            |store| {
                HandlerRegistry::new().with(Arc::new(
                    ScriptedHandler::new(StepKind::Plan, store).failing_first(1),
                ))
            },
            2,
            MINUTE,
        );
        let iteration_id = start(&h, MINUTE).await;

        // Act
        let first = h.worker.run_once().await.unwrap().unwrap();
        let second = h.worker.run_once().await.unwrap().unwrap();

        // Assert
        assert!(matches!(first, JobReport::WillRetry { .. }));
        assert!(matches!(
            second,
            JobReport::Dispatched(DispatchOutcome::Advanced { .. })
        ));
        let tasks = h.store.tasks_for_iteration(iteration_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_handler_buries_job_and_fails_iteration() {
        // Arrange
        let h = harness(no_handlers, 3, MINUTE);
        let iteration_id = start(&h, MINUTE).await;

        // Act
        let report = h.worker.run_once().await.unwrap().unwrap();

        // Assert
        assert!(matches!(report, JobReport::Dead { .. }));
        assert_eq!(h.queue.dead().len(), 1);
        assert_eq!(h.queue.ready_len(), 0);
        let iteration = h.store.get_iteration(iteration_id).await.unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_task_is_buried() {
        let h = harness(no_handlers, 3, MINUTE);
        h.queue.enqueue(Uuid::new_v4(), MINUTE).await.unwrap();

        let report = h.worker.run_once().await.unwrap().unwrap();

        assert!(matches!(report, JobReport::Dead { .. }));
        assert_eq!(h.queue.dead().len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_dispatch_fails_task_and_exhausts_deliveries() {
        // Arrange
        let timeout = Duration::from_millis(50);
        let h = harness(|_| HandlerRegistry::new().with(Arc::new(Sleepy)), 1, timeout);
        let iteration_id = start(&h, timeout).await;

        // Act
        let report = h.worker.run_once().await.unwrap().unwrap();

        // Assert
        let JobReport::Dead { error, .. } = report else {
            panic!("expected Dead, got {report:?}");
        };
        assert!(error.contains("dispatch exceeded"));
        let tasks = h.store.tasks_for_iteration(iteration_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        let iteration = h.store.get_iteration(iteration_id).await.unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Failed);
    }

    fn plan_only(store: Arc<dyn WorkStore>) -> HandlerRegistry {
        HandlerRegistry::new().with(Arc::new(ScriptedHandler::new(StepKind::Plan, store)))
    }

    #[tokio::test]
    async fn test_task_left_running_by_crashed_worker_is_recovered() {
        // Arrange
        let h = harness(plan_only, 3, MINUTE);
        let iteration_id = start(&h, MINUTE).await;
        let crashed = h.queue.reserve().await.unwrap().unwrap();
        let task_id = crashed.handle.task_id;
        h.store
            .claim_task(task_id, h.clock.now(), h.clock.now())
            .await
            .unwrap();
        h.queue.expire_active();
        let reconciler =
            Reconciler::new(h.store.clone(), h.queue.clone(), h.clock.clone(), MINUTE, MINUTE);

        // Act
        let redelivered = h.worker.run_once().await.unwrap().unwrap();
        let while_locked = reconciler.sweep().await.unwrap();
        h.clock.advance(chrono::Duration::seconds(61));
        let once_stale = reconciler.sweep().await.unwrap();
        let resumed = h.worker.run_once().await.unwrap().unwrap();

        // Assert
        assert_eq!(
            redelivered,
            JobReport::Dispatched(DispatchOutcome::Skipped {
                task_id,
                reason: SkipReason::InFlight
            })
        );
        assert_eq!(while_locked, 0);
        assert_eq!(once_stale, 1);
        assert!(matches!(
            resumed,
            JobReport::Dispatched(DispatchOutcome::Advanced { .. })
        ));
        let tasks = h.store.tasks_for_iteration(iteration_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].attempts, 2);
        assert_eq!(tasks[1].step, StepKind::Draft);
        assert_eq!(h.queue.ready_len(), 1);
        let iteration = h.store.get_iteration(iteration_id).await.unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Running);
    }

    #[tokio::test]
    async fn test_job_expired_on_last_delivery_fails_iteration() {
        // Arrange
        let h = harness(plan_only, 1, MINUTE);
        let iteration_id = start(&h, MINUTE).await;
        let crashed = h.queue.reserve().await.unwrap().unwrap();
        h.store
            .claim_task(crashed.handle.task_id, h.clock.now(), h.clock.now())
            .await
            .unwrap();
        h.queue.expire_active();

        // Act
        let nothing_to_reserve = h.worker.run_once().await.unwrap();
        let reaped = h.worker.reap().await.unwrap();

        // Assert
        assert_eq!(nothing_to_reserve, None);
        assert_eq!(reaped, 1);
        assert_eq!(h.queue.dead().len(), 1);
        let iteration = h.store.get_iteration(iteration_id).await.unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_acknowledges_skipped_jobs_and_stops_on_shutdown() {
        // Arrange
        let h = harness(no_handlers, 1, MINUTE);
        let iteration_id = start(&h, MINUTE).await;
        h.store
            .abandon_iteration(iteration_id, "cancelled", h.clock.now())
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let worker = h.worker.clone();
        let handle = tokio::spawn(async move {
            worker
                .run(async {
                    let _ = rx.await;
                })
                .await;
        });

        // Act
        for _ in 0..200 {
            if !h.queue.completed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        handle.await.unwrap();

        // Assert
        assert_eq!(h.queue.completed().len(), 1);
        assert!(h.queue.dead().is_empty());
    }
}
