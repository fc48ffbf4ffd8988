//! cartback abandoned-cart recovery service.
//!
//! Main entry point. Initializes all subsystems, resumes any work left
//! over from a previous run and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cartback_api::{AppState, Config};
use cartback_core::{storage::Storage, RealClock};
use cartback_recovery::{
    ActionScheduler, HttpPurchaseVerifier, LifecycleEngine, PostgresLeadStorage, ResendMailer,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting cartback recovery service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        port = config.port,
        verification_delay_seconds = config.verification_delay_seconds,
        reminders = config.reminder_delays_seconds.len(),
        scheduler_workers = config.scheduler_workers,
        "Configuration loaded"
    );
    if config.resend_api_key.is_empty() {
        warn!("RESEND_API_KEY is not set, reminder emails will fail");
    }

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.ensure_schema().await.context("Failed to create database schema")?;
    info!("Database schema ready");

    let storage = Arc::new(PostgresLeadStorage::new(storage));
    let verifier = HttpPurchaseVerifier::new(config.to_verifier_config())
        .context("Failed to build purchase verifier client")?;
    let mailer =
        ResendMailer::new(config.to_mailer_config()).context("Failed to build mailer client")?;

    let engine = Arc::new(LifecycleEngine::new(
        storage,
        Arc::new(verifier),
        Arc::new(mailer),
        Arc::new(RealClock::new()),
        config.to_lifecycle_config(),
    ));

    let mut scheduler = ActionScheduler::new(engine.clone(), config.to_scheduler_config());
    let recovered = scheduler.recover_stalled().await.context("Failed to recover stalled actions")?;
    if recovered > 0 {
        info!(recovered, "Requeued actions left running by a previous process");
    }
    scheduler.start().await;

    let addr = config.parse_server_addr()?;
    info!(%addr, "cartback is ready to capture leads");

    // Returns once a shutdown signal arrives and in-flight requests finish.
    cartback_api::start_server(AppState::new(engine), addr, config.request_timeout())
        .await
        .context("HTTP server failed")?;

    scheduler.shutdown().await.context("Scheduler did not stop cleanly")?;
    info!("Scheduler stopped");

    db_pool.close().await;
    info!("Database connections closed");

    info!("cartback shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cartback=debug,tower_http=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
