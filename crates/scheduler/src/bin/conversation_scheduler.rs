//! Standalone stale-conversation recovery worker.
//!
//! Runs detection and recovery against the conversation store until Ctrl+C.
//! Processing itself belongs to the application that embeds
//! [`scheduler::LeasedProcessor`] with its own handler.

use std::env;

use database::Database;
use scheduler::{LoggingSink, NoOpProcessor, SchedulerConfig, SchedulerDriver};
use tokio::sync::watch;
use tracing::{info, warn};

const DEFAULT_DATABASE_URL: &str = "sqlite:scheduler.db?mode=rwc";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scheduler=info".parse()?)
                .add_directive("database=info".parse()?),
        )
        .init();

    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let db = Database::connect(&database_url).await?;
    db.migrate().await?;

    let config = SchedulerConfig::from_env();
    info!(
        stale_threshold_ms = config.stale_threshold_ms(),
        max_recovery_attempts = config.max_recovery_attempts,
        dry_run = config.dry_run,
        "Starting stale conversation recovery"
    );

    let driver = SchedulerDriver::new(db.clone(), NoOpProcessor, LoggingSink, config);

    let (tx, rx) = watch::channel(false);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = tx.send(true);
    };

    tokio::join!(shutdown, driver.run_recovery_loop(rx));

    db.close().await;
    Ok(())
}
