mod bootstrap;
mod health;
mod routes;

use std::future::IntoFuture;

use anyhow::Result;
use axum::Router;
use colloquy_core::config::{AppConfig, LoadOptions};
use tokio::sync::oneshot;

use crate::bootstrap::Application;
use crate::health::HealthState;
use crate::routes::ApiState;

fn init_logging(config: &AppConfig) {
    use colloquy_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

fn app_router(app: &Application) -> Router {
    routes::router(ApiState { models: app.models.clone(), training: app.training.clone() })
        .merge(health::router(HealthState::new(
            app.store.clone(),
            app.locks.clone(),
            app.training.clone(),
        )))
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging comes up first so bootstrap is observable.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(axum::serve(listener, app_router(&app)).with_graceful_shutdown(
        async move {
            let _ = stopped.await;
        },
    ).into_future());

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        backend = app.store.backend(),
        "colloquy-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "colloquy-server stopping"
    );

    let _ = stop.send(());
    let grace = std::time::Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(served) => served??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "in-flight requests did not finish within the grace period"
        ),
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
