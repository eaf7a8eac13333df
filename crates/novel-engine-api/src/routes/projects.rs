//! Routes for the scene catalog: projects, scenes, style bibles and
//! constraints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use novel_engine_core::error::DomainError;
use novel_engine_core::records::{Project, Scene, Severity, StoryConstraint, StyleBible};
use novel_engine_core::repository::{NewConstraint, NewProject, NewScene};
use novel_engine_steps::domain::checks::StyleGuide;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /projects.
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for POST /projects/{id}/scenes.
#[derive(Debug, Deserialize)]
pub struct CreateSceneRequest {
    pub chapter_no: i32,
    pub scene_no: i32,
    /// Free-form scene card (title, tone, pacing, ...).
    #[serde(default = "empty_object")]
    pub card: serde_json::Value,
}

/// Request body for POST /projects/{id}/style-bibles.
#[derive(Debug, Deserialize)]
pub struct CreateStyleBibleRequest {
    pub content: serde_json::Value,
}

/// Request body for POST /projects/{id}/constraints.
#[derive(Debug, Deserialize)]
pub struct CreateConstraintRequest {
    pub constraint_type: String,
    pub rule: serde_json::Value,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_severity() -> Severity {
    Severity::Error
}

/// POST /projects
#[instrument(skip(state, request))]
async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(DomainError::InvalidArgument("project name must not be empty".into()).into());
    }
    let project = state
        .catalog
        .create_project(NewProject {
            name: name.to_owned(),
            description: request.description,
        })
        .await?;
    info!(project_id = %project.id, "project created");
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /projects
#[instrument(skip(state))]
async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.catalog.list_projects().await?))
}

/// GET /projects/{id}
#[instrument(skip(state))]
async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .catalog
        .get_project(project_id)
        .await?
        .ok_or_else(|| DomainError::not_found("project", project_id))?;
    Ok(Json(project))
}

/// GET /projects/{id}/scenes
#[instrument(skip(state))]
async fn list_scenes(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<Scene>>, ApiError> {
    if state.catalog.get_project(project_id).await?.is_none() {
        return Err(DomainError::not_found("project", project_id).into());
    }
    Ok(Json(state.catalog.list_scenes(project_id).await?))
}

/// GET /scenes/{id}
#[instrument(skip(state))]
async fn get_scene(
    State(state): State<AppState>,
    Path(scene_id): Path<Uuid>,
) -> Result<Json<Scene>, ApiError> {
    let scene = state
        .catalog
        .get_scene(scene_id)
        .await?
        .ok_or_else(|| DomainError::not_found("scene", scene_id))?;
    Ok(Json(scene))
}

/// POST /projects/{id}/scenes
#[instrument(skip(state, request))]
async fn create_scene(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateSceneRequest>,
) -> Result<(StatusCode, Json<Scene>), ApiError> {
    if request.chapter_no < 1 || request.scene_no < 1 {
        return Err(DomainError::InvalidArgument(
            "chapter_no and scene_no must be positive".into(),
        )
        .into());
    }
    if !request.card.is_object() {
        return Err(DomainError::InvalidArgument("scene card must be a JSON object".into()).into());
    }
    let scene = state
        .catalog
        .create_scene(NewScene {
            project_id,
            chapter_no: request.chapter_no,
            scene_no: request.scene_no,
            card: request.card,
        })
        .await?;
    info!(scene_id = %scene.id, "scene created");
    Ok((StatusCode::CREATED, Json(scene)))
}

/// POST /projects/{id}/style-bibles
#[instrument(skip(state, request))]
async fn create_style_bible(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateStyleBibleRequest>,
) -> Result<(StatusCode, Json<StyleBible>), ApiError> {
    StyleGuide::from_bible(&request.content)?;
    let bible = state
        .catalog
        .add_style_bible(project_id, request.content)
        .await?;
    info!(version = bible.version, "style bible added");
    Ok((StatusCode::CREATED, Json(bible)))
}

/// POST /projects/{id}/constraints
#[instrument(skip(state, request))]
async fn create_constraint(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateConstraintRequest>,
) -> Result<(StatusCode, Json<StoryConstraint>), ApiError> {
    if request.constraint_type.trim().is_empty() {
        return Err(DomainError::InvalidArgument("constraint_type must not be empty".into()).into());
    }
    let constraint = state
        .catalog
        .add_constraint(NewConstraint {
            project_id,
            constraint_type: request.constraint_type,
            rule: request.rule,
            severity: request.severity,
        })
        .await?;
    info!(constraint_id = %constraint.id, "constraint added");
    Ok((StatusCode::CREATED, Json(constraint)))
}

/// Returns the router for the scene catalog.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{project_id}", get(get_project))
        .route("/projects/{project_id}/scenes", get(list_scenes).post(create_scene))
        .route("/scenes/{scene_id}", get(get_scene))
        .route("/projects/{project_id}/style-bibles", post(create_style_bible))
        .route("/projects/{project_id}/constraints", post(create_constraint))
}
