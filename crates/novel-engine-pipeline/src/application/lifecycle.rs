//! Iteration lifecycle: starting an iteration over a scene.

use std::sync::Arc;
use std::time::Duration;

use novel_engine_core::clock::Clock;
use novel_engine_core::error::DomainError;
use novel_engine_core::payload::TaskInput;
use novel_engine_core::queue::TaskQueue;
use novel_engine_core::records::{Iteration, Task};
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use tracing::{error, info, instrument};

use crate::domain::commands::StartIteration;

/// A freshly started iteration and its first task.
#[derive(Debug, Clone)]
pub struct StartedIteration {
    pub iteration: Iteration,
    pub first_task: Task,
}

/// Creates iterations and hands their first task to the queue.
pub struct IterationLifecycle {
    catalog: Arc<dyn SceneCatalog>,
    store: Arc<dyn WorkStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    job_timeout: Duration,
}

impl std::fmt::Debug for IterationLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationLifecycle")
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}

impl IterationLifecycle {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn SceneCatalog>,
        store: Arc<dyn WorkStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            store,
            queue,
            clock,
            job_timeout,
        }
    }

    /// Starts an iteration: validates the scene and optional starting draft,
    /// creates the running iteration with its PLAN task in one transaction,
    /// then enqueues that task.
    ///
    /// If the enqueue fails the iteration is abandoned so that it does not
    /// sit in `running` with nothing to drive it.
    ///
    /// # Errors
    ///
    /// - `DomainError::NotFound` if the scene or starting draft is missing.
    /// - `DomainError::InvalidArgument` if the starting draft belongs to a
    ///   different scene. Nothing is created in that case.
    /// - `DomainError::Infrastructure` if the store or queue fails.
    #[instrument(skip(self, command), fields(scene_id = %command.scene_id))]
    pub async fn start(&self, command: &StartIteration) -> Result<StartedIteration, DomainError> {
        if self.catalog.get_scene(command.scene_id).await?.is_none() {
            return Err(DomainError::not_found("scene", command.scene_id));
        }
        if let Some(draft_id) = command.starting_draft_id {
            let draft = self
                .store
                .get_draft(draft_id)
                .await?
                .ok_or_else(|| DomainError::not_found("draft", draft_id))?;
            if draft.scene_id != command.scene_id {
                return Err(DomainError::InvalidArgument(format!(
                    "draft {draft_id} belongs to scene {}, not {}",
                    draft.scene_id, command.scene_id
                )));
            }
        }

        let input = TaskInput::initial(
            command.scene_id,
            command.max_attempts,
            command.starting_draft_id,
        );
        let (iteration, first_task) = self
            .store
            .begin_iteration(command.scene_id, &input, self.clock.now())
            .await?;

        if let Err(err) = self.queue.enqueue(first_task.id, self.job_timeout).await {
            error!(iteration_id = %iteration.id, error = %err, "first task not enqueued");
            self.store
                .abandon_iteration(
                    iteration.id,
                    &format!("enqueue failed: {err}"),
                    self.clock.now(),
                )
                .await?;
            return Err(err);
        }

        info!(
            iteration_id = %iteration.id,
            iteration_no = iteration.iteration_no,
            max_attempts = command.max_attempts,
            "iteration started"
        );
        Ok(StartedIteration {
            iteration,
            first_task,
        })
    }
}
