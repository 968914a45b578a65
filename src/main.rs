use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vote_guard::alerts::AlertRecorder;
use vote_guard::api::{self, AppState};
use vote_guard::config::AppConfig;
use vote_guard::database::Database;
use vote_guard::ledger::Ledger;
use vote_guard::monitor::start_monitors;
use vote_guard::notify::Notifier;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vote_guard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vote-guard");

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;
    database.run_migrations().await.context("Failed to run migrations")?;

    let ledger = Ledger::new(database.clone());
    let notifier = Arc::new(Notifier::from_config(database.clone(), &config.mail));
    let recorder = AlertRecorder::new(
        database.clone(),
        Some(notifier),
        config.monitor.alerts_dir.clone(),
    );

    let monitors = start_monitors(&config, database.clone(), ledger.clone(), recorder);

    let app = api::router(AppState::new(database, ledger));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping detectors");
    if let Err(e) = monitors.stop_all().await {
        error!("Detector shutdown failed: {}", e);
    }

    info!("vote-guard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
