//! Query handlers for iterations and drafts.
//!
//! These return read-only views assembled from the record stores.

use chrono::{DateTime, Utc};
use novel_engine_core::error::DomainError;
use novel_engine_core::records::{CheckRun, Draft, IterationStatus, Task};
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use serde::Serialize;
use uuid::Uuid;

/// Read-only view of an iteration and its task chain.
#[derive(Debug, Serialize)]
pub struct IterationStatusView {
    pub iteration_id: Uuid,
    pub scene_id: Uuid,
    pub iteration_no: i32,
    pub status: IterationStatus,
    /// REVISE transitions taken so far.
    pub current_attempt: u32,
    pub max_attempts: u32,
    /// The most recent draft any task of the iteration worked on.
    pub latest_draft_id: Option<Uuid>,
    pub tasks: Vec<Task>,
    pub check_runs: Vec<CheckRun>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retrieves an iteration with its tasks (in creation order) and check runs.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the iteration does not exist.
pub async fn get_iteration_status(
    iteration_id: Uuid,
    store: &dyn WorkStore,
) -> Result<IterationStatusView, DomainError> {
    let iteration = store
        .get_iteration(iteration_id)
        .await?
        .ok_or_else(|| DomainError::not_found("iteration", iteration_id))?;
    let tasks = store.tasks_for_iteration(iteration_id).await?;
    let check_runs = store.check_runs_for_iteration(iteration_id).await?;

    let latest_input = tasks.last().map(|task| &task.input);
    let latest_draft_id = tasks.iter().rev().find_map(|task| {
        task.output
            .as_ref()
            .and_then(|output| output.carry_over().draft_id)
            .or(task.input.draft_id)
    });

    Ok(IterationStatusView {
        iteration_id: iteration.id,
        scene_id: iteration.scene_id,
        iteration_no: iteration.iteration_no,
        status: iteration.status,
        current_attempt: latest_input.map_or(0, |input| input.current_attempt),
        max_attempts: latest_input.map_or(0, |input| input.max_attempts),
        latest_draft_id,
        tasks,
        check_runs,
        created_at: iteration.created_at,
        updated_at: iteration.updated_at,
    })
}

/// Retrieves a draft by id.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the draft does not exist.
pub async fn get_draft_by_id(draft_id: Uuid, store: &dyn WorkStore) -> Result<Draft, DomainError> {
    store
        .get_draft(draft_id)
        .await?
        .ok_or_else(|| DomainError::not_found("draft", draft_id))
}

/// Lists a scene's drafts, newest version first.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the scene does not exist.
pub async fn list_scene_drafts(
    scene_id: Uuid,
    catalog: &dyn SceneCatalog,
    store: &dyn WorkStore,
) -> Result<Vec<Draft>, DomainError> {
    if catalog.get_scene(scene_id).await?.is_none() {
        return Err(DomainError::not_found("scene", scene_id));
    }
    store.list_drafts(scene_id).await
}
