//! Routes for a project's characters and locations.
//!
//! Both kinds share one set of handlers; the router binds each handler to a
//! kind, so `/characters/{id}` never answers for a location.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use novel_engine_core::error::DomainError;
use novel_engine_core::records::{ElementKind, StoryElement};
use novel_engine_core::repository::{ElementPatch, NewElement};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /projects/{id}/characters and /locations.
#[derive(Debug, Deserialize)]
pub struct CreateElementRequest {
    pub name: String,
    /// Free-form profile.
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

/// Request body for PATCH /characters/{id} and /locations/{id}.
#[derive(Debug, Deserialize)]
pub struct UpdateElementRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn valid_name(name: &str) -> Result<String, DomainError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::InvalidArgument("name must not be empty".into()));
    }
    Ok(name.to_owned())
}

fn valid_data(data: &serde_json::Value) -> Result<(), DomainError> {
    if data.is_object() {
        Ok(())
    } else {
        Err(DomainError::InvalidArgument("data must be a JSON object".into()))
    }
}

/// Loads an element, treating one of another kind as missing.
async fn load(state: &AppState, kind: ElementKind, id: Uuid) -> Result<StoryElement, DomainError> {
    state
        .catalog
        .get_element(id)
        .await?
        .filter(|element| element.kind == kind)
        .ok_or_else(|| DomainError::not_found(kind.as_str(), id))
}

#[instrument(skip(state, request))]
async fn create_element(
    kind: ElementKind,
    state: AppState,
    project_id: Uuid,
    request: CreateElementRequest,
) -> Result<(StatusCode, Json<StoryElement>), ApiError> {
    let name = valid_name(&request.name)?;
    valid_data(&request.data)?;
    let element = state
        .catalog
        .create_element(NewElement {
            project_id,
            kind,
            name,
            data: request.data,
        })
        .await?;
    info!(element_id = %element.id, %kind, "story element created");
    Ok((StatusCode::CREATED, Json(element)))
}

#[instrument(skip(state))]
async fn list_elements(
    kind: ElementKind,
    state: AppState,
    project_id: Uuid,
) -> Result<Json<Vec<StoryElement>>, ApiError> {
    if state.catalog.get_project(project_id).await?.is_none() {
        return Err(DomainError::not_found("project", project_id).into());
    }
    Ok(Json(state.catalog.list_elements(project_id, kind).await?))
}

#[instrument(skip(state))]
async fn get_element(
    kind: ElementKind,
    state: AppState,
    id: Uuid,
) -> Result<Json<StoryElement>, ApiError> {
    Ok(Json(load(&state, kind, id).await?))
}

#[instrument(skip(state, request))]
async fn update_element(
    kind: ElementKind,
    state: AppState,
    id: Uuid,
    request: UpdateElementRequest,
) -> Result<Json<StoryElement>, ApiError> {
    let name = request.name.as_deref().map(valid_name).transpose()?;
    if let Some(data) = &request.data {
        valid_data(data)?;
    }
    load(&state, kind, id).await?;
    let element = state
        .catalog
        .update_element(
            id,
            ElementPatch {
                name,
                data: request.data,
            },
        )
        .await?
        .ok_or_else(|| DomainError::not_found(kind.as_str(), id))?;
    info!(element_id = %element.id, "story element updated");
    Ok(Json(element))
}

#[instrument(skip(state))]
async fn delete_element(kind: ElementKind, state: AppState, id: Uuid) -> Result<StatusCode, ApiError> {
    load(&state, kind, id).await?;
    if !state.catalog.delete_element(id).await? {
        return Err(DomainError::not_found(kind.as_str(), id).into());
    }
    info!(element_id = %id, "story element deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Collection and item routes for one kind, e.g. `/projects/{id}/characters`
/// and `/characters/{id}`.
fn kind_router(kind: ElementKind, plural: &str) -> Router<AppState> {
    Router::new()
        .route(
            &format!("/projects/{{project_id}}/{plural}"),
            get(move |State(state): State<AppState>, Path(project_id): Path<Uuid>| {
                list_elements(kind, state, project_id)
            })
            .post(
                move |State(state): State<AppState>,
                      Path(project_id): Path<Uuid>,
                      Json(request): Json<CreateElementRequest>| {
                    create_element(kind, state, project_id, request)
                },
            ),
        )
        .route(
            &format!("/{plural}/{{id}}"),
            get(move |State(state): State<AppState>, Path(id): Path<Uuid>| {
                get_element(kind, state, id)
            })
            .patch(
                move |State(state): State<AppState>,
                      Path(id): Path<Uuid>,
                      Json(request): Json<UpdateElementRequest>| {
                    update_element(kind, state, id, request)
                },
            )
            .delete(move |State(state): State<AppState>, Path(id): Path<Uuid>| {
                delete_element(kind, state, id)
            }),
        )
}

/// Returns the router for characters and locations.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(kind_router(ElementKind::Character, "characters"))
        .merge(kind_router(ElementKind::Location, "locations"))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::testing::{delete, get, memory_state, patch, post};

    #[tokio::test]
    async fn test_characters_are_created_and_listed_per_project() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let uri = format!("/projects/{}/characters", scene.project_id);

        // Act
        let (status, created) = post(
            router().with_state(state.clone()),
            &uri,
            &json!({ "name": " Mara ", "data": { "role": "keeper" } }),
        )
        .await;
        let (_, listed) = get(router().with_state(state.clone()), &uri).await;
        let (_, locations) = get(
            router().with_state(state),
            &format!("/projects/{}/locations", scene.project_id),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], "Mara");
        assert_eq!(created["kind"], "character");
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(locations, json!([]));
    }

    #[tokio::test]
    async fn test_element_for_unknown_project_returns_404() {
        let (state, _) = memory_state();

        let (created, _) = post(
            router().with_state(state.clone()),
            &format!("/projects/{}/locations", Uuid::new_v4()),
            &json!({ "name": "Harbor" }),
        )
        .await;
        let (listed, json) = get(
            router().with_state(state),
            &format!("/projects/{}/locations", Uuid::new_v4()),
        )
        .await;

        assert_eq!(created, StatusCode::NOT_FOUND);
        assert_eq!(listed, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_blank_name_or_non_object_data_returns_400() {
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let uri = format!("/projects/{}/characters", scene.project_id);

        let (blank, _) = post(router().with_state(state.clone()), &uri, &json!({ "name": "  " })).await;
        let (scalar, _) = post(
            router().with_state(state),
            &uri,
            &json!({ "name": "Mara", "data": 7 }),
        )
        .await;

        assert_eq!(blank, StatusCode::BAD_REQUEST);
        assert_eq!(scalar, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_renames_and_keeps_data() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let (_, created) = post(
            router().with_state(state.clone()),
            &format!("/projects/{}/locations", scene.project_id),
            &json!({ "name": "Harbor", "data": { "climate": "damp" } }),
        )
        .await;
        let uri = format!("/locations/{}", created["id"].as_str().unwrap());

        // Act
        let (status, updated) = patch(
            router().with_state(state.clone()),
            &uri,
            &json!({ "name": "Old Harbor" }),
        )
        .await;
        let (_, fetched) = get(router().with_state(state), &uri).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Old Harbor");
        assert_eq!(fetched["data"], json!({ "climate": "damp" }));
    }

    #[tokio::test]
    async fn test_element_is_not_reachable_under_the_other_kind() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let (_, created) = post(
            router().with_state(state.clone()),
            &format!("/projects/{}/characters", scene.project_id),
            &json!({ "name": "Mara" }),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        // Act
        let (fetched, _) = get(router().with_state(state.clone()), &format!("/locations/{id}")).await;
        let (deleted, _) = delete(router().with_state(state.clone()), &format!("/locations/{id}")).await;
        let (still_there, _) = get(router().with_state(state), &format!("/characters/{id}")).await;

        // Assert
        assert_eq!(fetched, StatusCode::NOT_FOUND);
        assert_eq!(deleted, StatusCode::NOT_FOUND);
        assert_eq!(still_there, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_delete_returns_204_then_404() {
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let (_, created) = post(
            router().with_state(state.clone()),
            &format!("/projects/{}/characters", scene.project_id),
            &json!({ "name": "Mara" }),
        )
        .await;
        let uri = format!("/characters/{}", created["id"].as_str().unwrap());

        let (first, body) = delete(router().with_state(state.clone()), &uri).await;
        let (second, _) = delete(router().with_state(state), &uri).await;

        assert_eq!(first, StatusCode::NO_CONTENT);
        assert_eq!(body, serde_json::Value::Null);
        assert_eq!(second, StatusCode::NOT_FOUND);
    }
}
