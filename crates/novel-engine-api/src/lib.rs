//! Novel Engine: HTTP API and worker wiring.
//!
//! The server binary exposes the scene catalog, drafts and pipeline runs over
//! HTTP; the worker binary consumes the task queue and runs the reconciler.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use novel_engine_pipeline::application::registry::HandlerRegistry;
use novel_engine_steps::application::handlers::all_handlers;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full router: `/health` at the root, everything else under
/// `/api/v1`.
#[must_use]
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .merge(routes::projects::router())
        .merge(routes::elements::router())
        .merge(routes::drafts::router())
        .merge(routes::pipeline::router());

    // TODO: Replace CorsLayer::permissive() with restricted origins for production.
    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A registry holding the built-in handler for every step.
#[must_use]
pub fn step_registry(
    catalog: &Arc<dyn SceneCatalog>,
    store: &Arc<dyn WorkStore>,
) -> HandlerRegistry {
    all_handlers(catalog, store)
        .into_iter()
        .fold(HandlerRegistry::new(), HandlerRegistry::with)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use novel_engine_test_support::{FixedClock, InMemoryTaskQueue, InMemoryWorkStore};
    use tower::ServiceExt;

    use crate::state::AppState;

    /// State over an in-memory store and queue, with the store handed back
    /// for seeding and inspection.
    pub fn memory_state() -> (AppState, Arc<InMemoryWorkStore>) {
        let store = Arc::new(InMemoryWorkStore::new());
        let clock = FixedClock(chrono::Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        let state = AppState::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryTaskQueue::new()),
            Arc::new(clock),
            Duration::from_secs(60),
            3,
        );
        (state, store)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        send(app, request).await
    }

    fn with_json(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    pub async fn post(
        app: Router,
        uri: &str,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        send(app, with_json("POST", uri, body)).await
    }

    pub async fn patch(
        app: Router,
        uri: &str,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        send(app, with_json("PATCH", uri, body)).await
    }

    pub async fn delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_app_nests_resources_under_api_v1() {
        // Arrange
        let (state, memory) = memory_state();
        let scene = memory.seed_scene();

        // Act
        let (nested, _) = get(
            crate::app(state.clone()),
            &format!("/api/v1/scenes/{}/drafts", scene.id),
        )
        .await;
        let (bare, _) = get(crate::app(state), &format!("/scenes/{}/drafts", scene.id)).await;

        // Assert
        assert_eq!(nested, StatusCode::OK);
        assert_eq!(bare, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_step_registry_covers_every_step() {
        let (state, _) = memory_state();

        let registry = crate::step_registry(&state.catalog, &state.store);

        assert!(registry.missing().is_empty());
    }
}
