use std::sync::Arc;

use scooter_dispatch::api;
use scooter_dispatch::config::Config;
use scooter_dispatch::engine::registry::InMemorySessionRegistry;
use scooter_dispatch::engine::sweeper::run_stale_ride_sweeper;
use scooter_dispatch::error::AppError;
use scooter_dispatch::state::AppState;
use scooter_dispatch::store::Repositories;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let shared_state = Arc::new(AppState::new(
        Repositories::in_memory(),
        Arc::new(InMemorySessionRegistry::new()),
        config.dispatch.clone(),
        &config.jwt_secret,
        config.event_buffer_size,
    ));

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(run_stale_ride_sweeper(
        shared_state.clone(),
        config.sweep_interval,
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        offer_timeout_secs = config.dispatch.offer_timeout.as_secs(),
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
