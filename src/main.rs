//! Mervo webhook delivery service.
//!
//! Main entry point. Loads configuration, selects the queue backend, runs
//! the delivery engine alongside the HTTP API, and coordinates graceful
//! shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mervo_api::{AppState, Config};
use mervo_core::{Clock, RealClock};
use mervo_delivery::{DeliveryEngine, DeliveryQueue, InMemoryDeliveryQueue, PostgresDeliveryQueue};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

const DEFAULT_FILTER: &str = "info,mervo=debug,tower_http=debug";

#[derive(Debug, Parser)]
#[command(name = "mervo", version, about = "Signed outbound webhook delivery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the delivery workers (default).
    Serve,
    /// Dispatch at most one due delivery, print the outcome and exit.
    RunOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    init_tracing(&config.rust_log);
    info!(?config, "configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let queue = create_queue(&config, clock.clone()).await?;
    let engine = DeliveryEngine::new(queue, config.to_delivery_config()?, clock.clone())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, engine, clock).await,
        Command::RunOnce => run_once(&engine).await,
    }
}

async fn serve(config: Config, mut engine: DeliveryEngine, clock: Arc<dyn Clock>) -> Result<()> {
    info!("starting mervo webhook delivery service");

    let state = AppState::new(engine.dispatcher(), clock).configured(&config).await?;

    engine.start().await?;

    let addr = config.parse_server_addr()?;
    let request_timeout = Duration::from_secs(config.request_timeout);
    let served = mervo_api::start_server(state, addr, request_timeout).await;

    // workers finish their current attempt even if the server failed
    let stopped = engine.shutdown().await;
    served.context("HTTP server failed")?;
    stopped.context("delivery engine did not shut down cleanly")?;

    info!("mervo shutdown complete");
    Ok(())
}

async fn run_once(engine: &DeliveryEngine) -> Result<()> {
    let outcome = engine.process_one().await?;
    let output = match outcome {
        Some(outcome) => serde_json::to_string_pretty(&outcome)?,
        None => serde_json::json!({ "processed": false }).to_string(),
    };
    println!("{output}");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured level.
fn init_tracing(configured: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Picks the PostgreSQL queue when a database is configured, otherwise the
/// in-memory queue.
async fn create_queue(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn DeliveryQueue>> {
    let Some(database_url) = config.database_url.as_deref() else {
        info!("no DATABASE_URL configured, using in-memory delivery queue");
        return Ok(Arc::new(InMemoryDeliveryQueue::new(clock)));
    };

    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or_default(),
        max_connections = config.database_max_connections,
        "connecting to PostgreSQL delivery queue"
    );
    let pool = create_database_pool(database_url, config.database_max_connections).await?;
    let queue = PostgresDeliveryQueue::new(pool, clock);
    queue.migrate().await.context("failed to migrate delivery queue schema")?;
    info!("PostgreSQL delivery queue ready");

    Ok(Arc::new(queue))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(database_url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}
