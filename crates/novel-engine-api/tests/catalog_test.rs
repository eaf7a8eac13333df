//! Integration tests for projects, scenes, characters, locations and drafts.

mod common;

use axum::http::StatusCode;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

#[sqlx::test(migrations = "../../migrations")]
async fn test_project_scene_and_draft_round_trip(pool: PgPool) {
    // Arrange
    let (_, scene_id) = common::seed_scene(&pool, json!({ "title": "Arrival" })).await;

    // Act
    let (status, draft) = common::post_json(
        common::build_test_app(pool.clone()),
        &format!("/api/v1/scenes/{scene_id}/drafts"),
        &json!({ "text": "The ferry came in under fog." }),
    )
    .await;

    // Assert
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(draft["version"], 1);

    let draft_id = draft["id"].as_str().unwrap();
    let (status, fetched) = common::get_json(
        common::build_test_app(pool.clone()),
        &format!("/api/v1/drafts/{draft_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["text"], "The ferry came in under fog.");

    let (status, listed) = common::get_json(
        common::build_test_app(pool),
        &format!("/api/v1/scenes/{scene_id}/drafts"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_duplicate_scene_returns_409(pool: PgPool) {
    let (project_id, _) = common::seed_scene(&pool, json!({})).await;

    let (status, json) = common::post_json(
        common::build_test_app(pool),
        &format!("/api/v1/projects/{project_id}/scenes"),
        &json!({ "chapter_no": 1, "scene_no": 1 }),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "conflict");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_style_bible_and_constraint_are_versioned_per_project(pool: PgPool) {
    let (project_id, _) = common::seed_scene(&pool, json!({})).await;

    let (status, bible) = common::post_json(
        common::build_test_app(pool.clone()),
        &format!("/api/v1/projects/{project_id}/style-bibles"),
        &json!({ "content": { "pov": "first", "forbidden_words": ["very"] } }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(bible["version"], 1);

    let (status, constraint) = common::post_json(
        common::build_test_app(pool),
        &format!("/api/v1/projects/{project_id}/constraints"),
        &json!({
            "constraint_type": "continuity",
            "rule": { "type": "character_must_appear", "character_id": Uuid::new_v4() },
            "severity": "warning"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(constraint["severity"], "warning");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_unknown_draft_returns_404_json_error(pool: PgPool) {
    let app = common::build_test_app(pool);

    let (status, json) =
        common::get_json(app, &format!("/api/v1/drafts/{}", Uuid::new_v4())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
    assert!(json["message"].as_str().unwrap().contains("draft"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_project_and_its_scenes_are_readable(pool: PgPool) {
    let (project_id, scene_id) = common::seed_scene(&pool, json!({ "title": "Arrival" })).await;

    let (status, projects) =
        common::get_json(common::build_test_app(pool.clone()), "/api/v1/projects").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(projects[0]["id"], project_id.as_str());

    let (status, scenes) = common::get_json(
        common::build_test_app(pool.clone()),
        &format!("/api/v1/projects/{project_id}/scenes"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scenes[0]["id"], scene_id.as_str());

    let (status, scene) = common::get_json(
        common::build_test_app(pool),
        &format!("/api/v1/scenes/{scene_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scene["card"]["title"], "Arrival");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_character_lifecycle(pool: PgPool) {
    // Arrange
    let (project_id, _) = common::seed_scene(&pool, json!({})).await;
    let (status, created) = common::post_json(
        common::build_test_app(pool.clone()),
        &format!("/api/v1/projects/{project_id}/characters"),
        &json!({ "name": "Mara", "data": { "role": "keeper" } }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/api/v1/characters/{}", created["id"].as_str().unwrap());

    // Act
    let (status, updated) = common::patch_json(
        common::build_test_app(pool.clone()),
        &uri,
        &json!({ "data": { "role": "lighthouse keeper" } }),
    )
    .await;
    let (deleted, _) = common::delete(common::build_test_app(pool.clone()), &uri).await;
    let (gone, _) = common::get_json(common::build_test_app(pool), &uri).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Mara");
    assert_eq!(updated["data"]["role"], "lighthouse keeper");
    assert_eq!(deleted, StatusCode::NO_CONTENT);
    assert_eq!(gone, StatusCode::NOT_FOUND);
}
