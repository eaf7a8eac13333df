//! Task dispatch: claim, run the step handler, record and advance.
//!
//! A dispatch is idempotent per task. Redelivering a completed task is a
//! no-op, and a task whose lock is still fresh belongs to someone else.
//! Completion is fenced by the claim's lock stamp, so a worker whose lock
//! went stale and was reclaimed cannot complete the task a second time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use novel_engine_core::clock::Clock;
use novel_engine_core::error::DomainError;
use novel_engine_core::handler::StepContext;
use novel_engine_core::payload::TaskOutput;
use novel_engine_core::queue::TaskQueue;
use novel_engine_core::records::{IterationStatus, Task, TaskStatus};
use novel_engine_core::repository::{Advance, ClaimOutcome, WorkStore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::registry::HandlerRegistry;
use crate::domain::state_machine::next_advance;

/// Why a dispatch did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyCompleted,
    InFlight,
    IterationClosed,
    /// The handler ran, but by then the task had been reclaimed, completed
    /// or failed by someone else; its output was discarded.
    Superseded,
}

/// Result of dispatching one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The task completed and its successor was created and enqueued.
    Advanced { task_id: Uuid, next_task_id: Uuid },
    /// The task completed and ended its iteration.
    Finished {
        task_id: Uuid,
        status: IterationStatus,
    },
    /// The task was not executed.
    Skipped { task_id: Uuid, reason: SkipReason },
}

/// Executes queued tasks.
pub struct Dispatcher {
    store: Arc<dyn WorkStore>,
    queue: Arc<dyn TaskQueue>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    job_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher. `job_timeout` bounds one dispatch and is also
    /// the age after which another worker's lock counts as stale.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkStore>,
        queue: Arc<dyn TaskQueue>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            clock,
            job_timeout,
        }
    }

    /// Per-dispatch time limit.
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.job_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Dispatches one task.
    ///
    /// Claims the task, runs the handler registered for its step kind,
    /// validates the output and then, in one store transaction, records the
    /// output, marks the task completed and creates the successor (or closes
    /// the iteration). The successor is enqueued only after that commit.
    ///
    /// # Errors
    ///
    /// - `DomainError::NotFound` if the task does not exist.
    /// - `DomainError::InvalidArgument` if no handler is registered for the
    ///   task's step kind; the task is marked failed.
    /// - `DomainError::HandlerFailure` if the handler errors or returns an
    ///   output for the wrong step; the task is marked failed with the error.
    /// - `DomainError::Infrastructure` on store or queue failures.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn dispatch(&self, task_id: Uuid) -> Result<DispatchOutcome, DomainError> {
        let now = self.clock.now();
        let task = match self
            .store
            .claim_task(task_id, now, self.stale_before(now))
            .await?
        {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::AlreadyCompleted(_) => {
                return Ok(skipped(task_id, SkipReason::AlreadyCompleted));
            }
            ClaimOutcome::InFlight(_) => return Ok(skipped(task_id, SkipReason::InFlight)),
            ClaimOutcome::IterationClosed(_) => {
                return Ok(skipped(task_id, SkipReason::IterationClosed));
            }
        };
        info!(step = %task.step, attempt = task.attempts, "claimed task");

        let Some(handler) = self.registry.get(task.step) else {
            let message = format!("no handler registered for step {}", task.step);
            self.fail(&task, &message).await?;
            return Err(DomainError::InvalidArgument(message));
        };

        let ctx = StepContext {
            task_id: task.id,
            iteration_id: task.iteration_id,
            step: task.step,
            input: task.input.clone(),
        };
        let output = match handler.handle(&ctx).await {
            Ok(output) => output,
            Err(err) => return Err(self.handler_failed(&task, err.to_string()).await),
        };
        let advance = match next_advance(task.step, &task.input, &output) {
            Ok(advance) => advance,
            Err(err) => return Err(self.handler_failed(&task, err.to_string()).await),
        };

        let Some(locked_at) = task.locked_at else {
            return Err(DomainError::Infrastructure(format!(
                "claimed task {task_id} carries no lock"
            )));
        };
        let next = match self
            .store
            .complete_task(task.id, locked_at, &output, &advance, self.clock.now())
            .await
        {
            Ok(next) => next,
            Err(DomainError::Conflict(message)) => {
                warn!(%message, "task changed hands before completion");
                return Ok(skipped(task_id, SkipReason::Superseded));
            }
            Err(err) => return Err(err),
        };

        match (next, advance) {
            (Some(next), _) => {
                if let Err(err) = self.queue.enqueue(next.id, self.job_timeout).await {
                    warn!(next_task_id = %next.id, error = %err, "successor not enqueued");
                    return Err(err);
                }
                info!(next_task_id = %next.id, next_step = %next.step, "task advanced");
                Ok(DispatchOutcome::Advanced {
                    task_id,
                    next_task_id: next.id,
                })
            }
            (None, Advance::Finish(status)) => {
                info!(%status, "iteration finished");
                Ok(DispatchOutcome::Finished { task_id, status })
            }
            (None, Advance::Next { step, .. }) => Err(DomainError::Infrastructure(format!(
                "store did not return the {step} successor of task {task_id}"
            ))),
        }
    }

    /// Marks a task failed if it is still running, e.g. after its dispatch
    /// exceeded the job timeout.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store write fails.
    pub async fn abandon(&self, task_id: Uuid, reason: &str) -> Result<(), DomainError> {
        self.store
            .fail_task(task_id, &TaskOutput::failure(reason), self.clock.now())
            .await
    }

    /// Fails the iteration owning `task_id` once the task can no longer be
    /// retried. Missing and completed tasks are ignored.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if a store operation fails.
    #[instrument(skip(self, reason), fields(task_id = %task_id))]
    pub async fn retire(&self, task_id: Uuid, reason: &str) -> Result<(), DomainError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status == TaskStatus::Completed {
            return Ok(());
        }
        warn!(iteration_id = %task.iteration_id, reason, "retiring iteration");
        self.store
            .abandon_iteration(task.iteration_id, reason, self.clock.now())
            .await
    }

    async fn fail(&self, task: &Task, message: &str) -> Result<(), DomainError> {
        self.store
            .fail_task(task.id, &TaskOutput::failure(message), self.clock.now())
            .await
    }

    async fn handler_failed(&self, task: &Task, message: String) -> DomainError {
        warn!(step = %task.step, error = %message, "step handler failed");
        if let Err(err) = self.fail(task, &message).await {
            return err;
        }
        DomainError::HandlerFailure {
            step: task.step,
            message,
        }
    }
}

fn skipped(task_id: Uuid, reason: SkipReason) -> DispatchOutcome {
    info!(?reason, "task skipped");
    DispatchOutcome::Skipped { task_id, reason }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use novel_engine_core::handler::StepHandler;
    use novel_engine_core::payload::{CommitOutput, TaskInput};
    use novel_engine_core::step::StepKind;
    use novel_engine_test_support::{
        FixedClock, InMemoryTaskQueue, InMemoryWorkStore, ScriptedHandler, SteppingClock,
    };

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn full_registry(store: &Arc<InMemoryWorkStore>, check_verdict: bool) -> HandlerRegistry {
        let work: Arc<dyn WorkStore> = store.clone();
        ScriptedHandler::full_set(&work, check_verdict)
            .into_iter()
            .fold(HandlerRegistry::new(), |registry, handler| {
                registry.with(handler)
            })
    }

    struct Fixture {
        store: Arc<InMemoryWorkStore>,
        queue: Arc<InMemoryTaskQueue>,
        first_task: Task,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryWorkStore::new());
        let scene = store.seed_scene();
        let (_, first_task) = store
            .begin_iteration(scene.id, &TaskInput::initial(scene.id, 3, None), fixed_now())
            .await
            .unwrap();
        Fixture {
            store,
            queue: Arc::new(InMemoryTaskQueue::new()),
            first_task,
        }
    }

    fn dispatcher(fx: &Fixture, registry: HandlerRegistry) -> Dispatcher {
        Dispatcher::new(
            fx.store.clone(),
            fx.queue.clone(),
            registry,
            Arc::new(FixedClock(fixed_now())),
            TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_dispatch_completes_task_and_enqueues_successor() {
        // Arrange
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));

        // Act
        let outcome = dispatcher.dispatch(fx.first_task.id).await.unwrap();

        // Assert
        let DispatchOutcome::Advanced { next_task_id, .. } = outcome else {
            panic!("expected Advanced, got {outcome:?}");
        };
        let tasks = fx.store.all_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].attempts, 1);
        assert!(matches!(tasks[0].output, Some(TaskOutput::Plan(_))));
        assert_eq!(tasks[1].id, next_task_id);
        assert_eq!(tasks[1].step, StepKind::Draft);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
        assert!(tasks[1].input.plan.is_some());
        assert_eq!(fx.queue.enqueued().len(), 1);
        assert_eq!(fx.queue.enqueued()[0].task_id, next_task_id);
    }

    #[tokio::test]
    async fn test_redelivered_completed_task_is_skipped_without_side_effects() {
        // Arrange
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));
        let DispatchOutcome::Advanced { next_task_id, .. } =
            dispatcher.dispatch(fx.first_task.id).await.unwrap()
        else {
            panic!("expected PLAN to advance");
        };
        dispatcher.dispatch(next_task_id).await.unwrap();
        let drafts_before = fx.store.all_drafts().len();
        let tasks_before = fx.store.all_tasks().len();

        // Act
        let outcome = dispatcher.dispatch(next_task_id).await.unwrap();

        // Assert
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped {
                task_id: next_task_id,
                reason: SkipReason::AlreadyCompleted
            }
        );
        assert_eq!(fx.store.all_drafts().len(), drafts_before);
        assert_eq!(fx.store.all_tasks().len(), tasks_before);
    }

    #[tokio::test]
    async fn test_fresh_lock_is_in_flight_and_stale_lock_is_reclaimed() {
        // Arrange
        let fx = fixture().await;
        let clock = Arc::new(SteppingClock::new(fixed_now()));
        let dispatcher = Dispatcher::new(
            fx.store.clone(),
            fx.queue.clone(),
            full_registry(&fx.store, true),
            clock.clone(),
            TIMEOUT,
        );
        fx.store
            .claim_task(fx.first_task.id, fixed_now(), fixed_now())
            .await
            .unwrap();

        // Act
        let in_flight = dispatcher.dispatch(fx.first_task.id).await.unwrap();
        clock.advance(chrono::Duration::seconds(601));
        let reclaimed = dispatcher.dispatch(fx.first_task.id).await.unwrap();

        // Assert
        assert_eq!(
            in_flight,
            DispatchOutcome::Skipped {
                task_id: fx.first_task.id,
                reason: SkipReason::InFlight
            }
        );
        assert!(matches!(reclaimed, DispatchOutcome::Advanced { .. }));
        assert_eq!(fx.store.all_tasks()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task_with_invalid_argument() {
        // Arrange
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, HandlerRegistry::new());

        // Act
        let result = dispatcher.dispatch(fx.first_task.id).await;

        // Assert
        assert!(matches!(result, Err(DomainError::InvalidArgument(_))));
        let task = &fx.store.all_tasks()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(matches!(task.output, Some(TaskOutput::Failure(_))));
        assert!(fx.queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_fails_task_and_creates_no_successor() {
        // Arrange
        let fx = fixture().await;
        let work: Arc<dyn WorkStore> = fx.store.clone();
        let registry = HandlerRegistry::new()
            .with(Arc::new(ScriptedHandler::new(StepKind::Plan, work).failing_first(1)));
        let dispatcher = dispatcher(&fx, registry);

        // Act
        let result = dispatcher.dispatch(fx.first_task.id).await;

        // Assert
        match result {
            Err(DomainError::HandlerFailure { step, message }) => {
                assert_eq!(step, StepKind::Plan);
                assert!(message.contains("scripted failure"));
            }
            other => panic!("expected HandlerFailure, got {other:?}"),
        }
        let tasks = fx.store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        let Some(TaskOutput::Failure(failure)) = &tasks[0].output else {
            panic!("expected a failure output");
        };
        assert!(failure.error.contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_failed_task_can_be_retried() {
        // Arrange
        let fx = fixture().await;
        let work: Arc<dyn WorkStore> = fx.store.clone();
        let registry = HandlerRegistry::new()
            .with(Arc::new(ScriptedHandler::new(StepKind::Plan, work).failing_first(1)));
        let dispatcher = dispatcher(&fx, registry);
        let _ = dispatcher.dispatch(fx.first_task.id).await;

        // Act
        let outcome = dispatcher.dispatch(fx.first_task.id).await.unwrap();

        // Assert
        assert!(matches!(outcome, DispatchOutcome::Advanced { .. }));
        assert_eq!(fx.store.all_tasks()[0].attempts, 2);
    }

    struct WrongOutput;

    #[async_trait]
    impl StepHandler for WrongOutput {
        fn step(&self) -> StepKind {
            StepKind::Plan
        }

        async fn handle(&self, _ctx: &StepContext) -> Result<TaskOutput, DomainError> {
            Ok(TaskOutput::Commit(CommitOutput {
                draft_id: Uuid::new_v4(),
                committed: true,
            }))
        }
    }

    #[tokio::test]
    async fn test_output_for_wrong_step_is_a_handler_failure() {
        // Arrange
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, HandlerRegistry::new().with(Arc::new(WrongOutput)));

        // Act
        let result = dispatcher.dispatch(fx.first_task.id).await;

        // Assert
        assert!(matches!(
            result,
            Err(DomainError::HandlerFailure {
                step: StepKind::Plan,
                ..
            })
        ));
        assert_eq!(fx.store.all_tasks()[0].status, TaskStatus::Failed);
        assert_eq!(fx.store.all_iterations()[0].status, IterationStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));

        let result = dispatcher.dispatch(Uuid::new_v4()).await;

        assert!(matches!(
            result,
            Err(DomainError::NotFound { entity: "task", .. })
        ));
    }

    #[tokio::test]
    async fn test_retire_fails_iteration_and_closes_remaining_tasks() {
        // Arrange
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));

        // Act
        dispatcher
            .retire(fx.first_task.id, "out of deliveries")
            .await
            .unwrap();
        let outcome = dispatcher.dispatch(fx.first_task.id).await.unwrap();

        // Assert
        assert_eq!(fx.store.all_iterations()[0].status, IterationStatus::Failed);
        assert_eq!(fx.store.all_tasks()[0].status, TaskStatus::Failed);
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped {
                task_id: fx.first_task.id,
                reason: SkipReason::IterationClosed
            }
        );
    }

    /// Runs the PLAN step slowly enough that another worker reclaims the task
    /// before the output comes back.
    struct Overtaken {
        store: Arc<dyn WorkStore>,
        inner: ScriptedHandler,
    }

    #[async_trait]
    impl StepHandler for Overtaken {
        fn step(&self) -> StepKind {
            StepKind::Plan
        }

        async fn handle(&self, ctx: &StepContext) -> Result<TaskOutput, DomainError> {
            let later = fixed_now() + chrono::Duration::seconds(601);
            self.store
                .claim_task(ctx.task_id, later, later - chrono::Duration::seconds(600))
                .await?;
            self.inner.handle(ctx).await
        }
    }

    #[tokio::test]
    async fn test_completion_after_lock_was_reclaimed_is_superseded() {
        // Arrange
        let fx = fixture().await;
        let work: Arc<dyn WorkStore> = fx.store.clone();
        let registry = HandlerRegistry::new().with(Arc::new(Overtaken {
            store: Arc::clone(&work),
            inner: ScriptedHandler::new(StepKind::Plan, work),
        }));
        let dispatcher = dispatcher(&fx, registry);

        // Act
        let outcome = dispatcher.dispatch(fx.first_task.id).await.unwrap();

        // Assert
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped {
                task_id: fx.first_task.id,
                reason: SkipReason::Superseded
            }
        );
        let tasks = fx.store.all_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Running);
        assert_eq!(tasks[0].attempts, 2);
        assert!(fx.queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_retire_leaves_completed_tasks_alone() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));
        dispatcher.dispatch(fx.first_task.id).await.unwrap();

        dispatcher
            .retire(fx.first_task.id, "late expiry")
            .await
            .unwrap();

        assert_eq!(fx.store.all_iterations()[0].status, IterationStatus::Running);
    }

    #[tokio::test]
    async fn test_abandon_only_touches_running_tasks() {
        let fx = fixture().await;
        let dispatcher = dispatcher(&fx, full_registry(&fx.store, true));

        dispatcher.abandon(fx.first_task.id, "timed out").await.unwrap();

        assert_eq!(fx.store.all_tasks()[0].status, TaskStatus::Pending);
    }
}
