//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use novel_engine_core::clock::{Clock, SystemClock};
use novel_engine_core::queue::TaskQueue;
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use novel_engine_pipeline::application::lifecycle::IterationLifecycle;
use novel_engine_store::pg_task_queue::PgTaskQueue;
use novel_engine_store::pg_work_store::PgWorkStore;
use sqlx::PgPool;

use crate::config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn SceneCatalog>,
    pub store: Arc<dyn WorkStore>,
    pub lifecycle: Arc<IterationLifecycle>,
    /// Revision budget for run requests that do not name one.
    pub default_max_attempts: u32,
}

impl AppState {
    /// Create new application state over the given collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn SceneCatalog>,
        store: Arc<dyn WorkStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        job_timeout: Duration,
        default_max_attempts: u32,
    ) -> Self {
        let lifecycle = IterationLifecycle::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            queue,
            clock,
            job_timeout,
        );
        Self {
            catalog,
            store,
            lifecycle: Arc::new(lifecycle),
            default_max_attempts,
        }
    }

    /// State backed by `PostgreSQL` for both records and the job queue.
    #[must_use]
    pub fn postgres(pool: PgPool, config: &Config) -> Self {
        let records = Arc::new(PgWorkStore::new(pool.clone()));
        Self::new(
            records.clone(),
            records,
            Arc::new(PgTaskQueue::new(pool, config.retry_policy())),
            Arc::new(SystemClock),
            config.job_timeout,
            config.default_max_attempts,
        )
    }
}
