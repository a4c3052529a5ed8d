use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use org_hierarchy::config;
use org_hierarchy::database::{DatabaseManager, PgStore};
use org_hierarchy::is_production;
use org_hierarchy::services::Scheduler;
use org_hierarchy::OrgEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so DATABASE_URL and APP_ENV are picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(!is_production!())
        .init();

    // Initialize configuration (this loads the config singleton)
    let config = config::config();
    info!("Starting hierarchy scheduler in {:?} mode", config.environment);

    let pool = DatabaseManager::pool(&config.database)
        .await
        .context("failed to connect to database")?;
    DatabaseManager::health_check(&config.database)
        .await
        .context("database health check failed")?;
    let store = PgStore::new(pool);
    store.ensure_schema().await.context("failed to prepare hierarchy schema")?;

    let engine = OrgEngine::new(Arc::new(store), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = Scheduler::spawn(
        config,
        Arc::clone(&engine.consistency),
        Arc::clone(&engine.monitor),
        shutdown_rx,
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown requested, stopping scheduled jobs");

    shutdown_tx.send(true).ok();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::warn!("Scheduled job ended abnormally: {}", e);
        }
    }

    // Final summary so the last interval is not lost
    engine.monitor.report();
    DatabaseManager::close().await;
    Ok(())
}
