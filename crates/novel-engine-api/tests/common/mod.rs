//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use novel_engine_core::clock::{Clock, SystemClock};
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use novel_engine_pipeline::application::dispatcher::Dispatcher;
use novel_engine_pipeline::application::worker::{Worker, WorkerConfig};
use novel_engine_store::pg_task_queue::{PgTaskQueue, RetryPolicy};
use novel_engine_store::pg_work_store::PgWorkStore;
use sqlx::PgPool;
use tower::ServiceExt;

use novel_engine_api::state::AppState;

pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_deliveries: 3,
        backoff: Duration::ZERO,
    }
}

/// Build the full app over PostgreSQL, with the same routes as `main.rs`.
pub fn build_test_app(pool: PgPool) -> Router {
    let records = Arc::new(PgWorkStore::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(
        records.clone(),
        records,
        Arc::new(PgTaskQueue::new(pool, retry_policy())),
        clock,
        JOB_TIMEOUT,
        3,
    );
    novel_engine_api::app(state)
}

/// A worker over the same database, wired like the worker binary.
pub fn build_test_worker(pool: PgPool) -> Worker {
    let records = Arc::new(PgWorkStore::new(pool.clone()));
    let catalog: Arc<dyn SceneCatalog> = records.clone();
    let store: Arc<dyn WorkStore> = records;
    let queue = Arc::new(PgTaskQueue::new(pool, retry_policy()));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        queue.clone(),
        novel_engine_api::step_registry(&catalog, &store),
        Arc::new(SystemClock),
        JOB_TIMEOUT,
    );
    Worker::new(queue, Arc::new(dispatcher), WorkerConfig::default())
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    send(app, request).await
}

/// Send a PATCH request with a JSON body and return the response.
pub async fn patch_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    send(app, request).await
}

/// Send a DELETE request and return the response.
pub async fn delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    send(app, request).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    send(app, request).await
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, json)
}

/// Create a project with one scene and return `(project_id, scene_id)`.
pub async fn seed_scene(pool: &PgPool, card: serde_json::Value) -> (String, String) {
    let (status, project) = post_json(
        build_test_app(pool.clone()),
        "/api/v1/projects",
        &serde_json::json!({ "name": "Harbor Lights" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_str().unwrap().to_owned();

    let (status, scene) = post_json(
        build_test_app(pool.clone()),
        &format!("/api/v1/projects/{project_id}/scenes"),
        &serde_json::json!({ "chapter_no": 1, "scene_no": 1, "card": card }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (project_id, scene["id"].as_str().unwrap().to_owned())
}
