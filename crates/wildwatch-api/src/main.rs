mod auth;
mod config;
mod error;
mod extract;
mod routes;
mod scheduler;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wildwatch_core::kobo::KoboClient;
use wildwatch_core::services::DatabaseService;
use wildwatch_core::sync::{SyncCoordinator, SyncOptions};

use config::AppConfig;
use routes::{app_router, AppState};
use scheduler::SyncScheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wildwatch_api=info".parse()?))
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting wildwatch-api with config: {:?}", config);

    let db = DatabaseService::open(&config.core.database).await?;
    let kobo = Arc::new(KoboClient::new(config.core.kobo.clone())?);
    let coordinator = Arc::new(SyncCoordinator::new(
        kobo,
        Arc::new(db.clone()),
        SyncOptions {
            page_size: config.core.sync.page_size,
            max_push_attempts: config.core.sync.max_push_attempts,
        },
    ));

    let shutdown = CancellationToken::new();
    let scheduler = SyncScheduler::new(
        Arc::clone(&coordinator),
        db.clone(),
        config.core.sync.forms.clone(),
    )
    .spawn(&config.core.sync, shutdown.child_token());

    let state = AppState::new(Arc::clone(&config), db, coordinator, shutdown.clone());
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("wildwatch-api listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(scheduler) = scheduler {
        scheduler.await.ok();
    }
    tracing::info!("wildwatch-api stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
