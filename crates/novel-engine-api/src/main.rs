//! Novel Engine API server entry point.

use novel_engine_api::config::Config;
use novel_engine_api::error::AppError;
use novel_engine_api::state::AppState;
use novel_engine_api::{app, telemetry};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let guard = telemetry::init("novel-engine-api")?;
    let result = serve().await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "API server exited with an error");
    }
    guard.shutdown();
    result
}

async fn serve() -> Result<(), AppError> {
    tracing::info!("Starting Novel Engine API server");
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    novel_engine_store::schema::migrate(&pool).await?;

    let router = app(AppState::postgres(pool, &config));

    let addr = config.bind_addr()?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
