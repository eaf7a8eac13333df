//! Routes for starting and inspecting pipeline iterations.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use novel_engine_core::records::IterationStatus;
use novel_engine_pipeline::application::query_handlers::{self, IterationStatusView};
use novel_engine_pipeline::domain::commands::StartIteration;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /pipeline/scenes/{id}/run. Every field is optional,
/// so `{}` starts a run with the configured revision budget.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunPipelineRequest {
    pub max_attempts: Option<u32>,
    pub starting_draft_id: Option<Uuid>,
}

/// Response body for an accepted run.
#[derive(Debug, Serialize)]
pub struct RunPipelineResponse {
    pub iteration_id: Uuid,
    pub iteration_no: i32,
    pub status: IterationStatus,
    pub first_task_id: Uuid,
}

/// POST /pipeline/scenes/{id}/run
#[instrument(skip(state, request))]
async fn run_scene(
    State(state): State<AppState>,
    Path(scene_id): Path<Uuid>,
    Json(request): Json<RunPipelineRequest>,
) -> Result<(StatusCode, Json<RunPipelineResponse>), ApiError> {
    let command = StartIteration {
        scene_id,
        max_attempts: request.max_attempts.unwrap_or(state.default_max_attempts),
        starting_draft_id: request.starting_draft_id,
    };
    let started = state.lifecycle.start(&command).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunPipelineResponse {
            iteration_id: started.iteration.id,
            iteration_no: started.iteration.iteration_no,
            status: started.iteration.status,
            first_task_id: started.first_task.id,
        }),
    ))
}

/// GET /pipeline/iterations/{id}
#[instrument(skip(state))]
async fn get_iteration(
    State(state): State<AppState>,
    Path(iteration_id): Path<Uuid>,
) -> Result<Json<IterationStatusView>, ApiError> {
    let view = query_handlers::get_iteration_status(iteration_id, state.store.as_ref()).await?;
    Ok(Json(view))
}

/// Returns the router for the pipeline.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pipeline/scenes/{scene_id}/run", post(run_scene))
        .route("/pipeline/iterations/{iteration_id}", get(get_iteration))
}
