//! uptrail - endpoint health monitor
//!
//! Probes HTTP and Modbus-TCP endpoints, logs only health transitions, and
//! reconstructs online/offline/timeout durations from that log.

mod clock;
mod config;
mod db;
mod monitor;
mod probe;
mod scheduler;
mod web;

use clock::SystemClock;
use config::ServerConfig;
use db::Store;
use monitor::Monitor;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let monitor = Arc::new(Monitor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(SystemClock),
        cfg.day_offset(),
    ));

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(monitor.clone(), cfg.retention()));
    scheduler.start().await?;

    // Serve the API until interrupted
    let server = Server::new(cfg, store, monitor, scheduler.clone());
    server.start(shutdown_signal()).await?;

    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
