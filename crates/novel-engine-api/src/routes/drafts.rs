//! Routes for manual draft submission and draft retrieval.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use novel_engine_core::error::DomainError;
use novel_engine_core::records::Draft;
use novel_engine_pipeline::application::query_handlers;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /scenes/{id}/drafts.
#[derive(Debug, Deserialize)]
pub struct SubmitDraftRequest {
    pub text: String,
}

/// POST /scenes/{id}/drafts
#[instrument(skip(state, request))]
async fn submit_draft(
    State(state): State<AppState>,
    Path(scene_id): Path<Uuid>,
    Json(request): Json<SubmitDraftRequest>,
) -> Result<(StatusCode, Json<Draft>), ApiError> {
    if request.text.trim().is_empty() {
        return Err(DomainError::InvalidArgument("draft text must not be empty".into()).into());
    }
    let draft = state.store.create_draft(scene_id, &request.text).await?;
    info!(draft_id = %draft.id, version = draft.version, "draft submitted");
    Ok((StatusCode::CREATED, Json(draft)))
}

/// GET /scenes/{id}/drafts
#[instrument(skip(state))]
async fn list_drafts(
    State(state): State<AppState>,
    Path(scene_id): Path<Uuid>,
) -> Result<Json<Vec<Draft>>, ApiError> {
    let drafts =
        query_handlers::list_scene_drafts(scene_id, state.catalog.as_ref(), state.store.as_ref())
            .await?;
    Ok(Json(drafts))
}

/// GET /drafts/{id}
#[instrument(skip(state))]
async fn get_draft(
    State(state): State<AppState>,
    Path(draft_id): Path<Uuid>,
) -> Result<Json<Draft>, ApiError> {
    let draft = query_handlers::get_draft_by_id(draft_id, state.store.as_ref()).await?;
    Ok(Json(draft))
}

/// Returns the router for drafts.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scenes/{scene_id}/drafts", get(list_drafts).post(submit_draft))
        .route("/drafts/{draft_id}", get(get_draft))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::testing::{get, memory_state, post};

    #[tokio::test]
    async fn test_submitted_drafts_are_listed_newest_first() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let uri = format!("/scenes/{}/drafts", scene.id);

        // Act
        let (first_status, first) =
            post(router().with_state(state.clone()), &uri, &json!({ "text": "One." })).await;
        let (_, second) =
            post(router().with_state(state.clone()), &uri, &json!({ "text": "Two." })).await;
        let (status, listed) = get(router().with_state(state), &uri).await;

        // Assert
        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(first["version"], 1);
        assert_eq!(second["version"], 2);
        assert_eq!(status, StatusCode::OK);
        let versions: Vec<i64> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["version"].as_i64().unwrap())
            .collect();
        assert_eq!(versions, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_empty_draft_text_returns_400() {
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();

        let (status, json) = post(
            router().with_state(state),
            &format!("/scenes/{}/drafts", scene.id),
            &json!({ "text": "  \n " }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_draft_for_unknown_scene_returns_404() {
        let (state, _) = memory_state();

        let (status, _) = post(
            router().with_state(state),
            &format!("/scenes/{}/drafts", Uuid::new_v4()),
            &json!({ "text": "Orphan." }),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_listing_unknown_scene_returns_404() {
        let (state, _) = memory_state();

        let (status, json) = get(
            router().with_state(state),
            &format!("/scenes/{}/drafts", Uuid::new_v4()),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_get_draft_by_id() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();
        let (_, created) = post(
            router().with_state(state.clone()),
            &format!("/scenes/{}/drafts", scene.id),
            &json!({ "text": "The lamp guttered." }),
        )
        .await;

        // Act
        let (status, json) = get(
            router().with_state(state),
            &format!("/drafts/{}", created["id"].as_str().unwrap()),
        )
        .await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "The lamp guttered.");
        assert_eq!(json["scene_id"], scene.id.to_string());
    }
}
