//! pgpool-lease - Main entry point.
//!
//! Runs one-off queries, cursor streams and LISTEN subscriptions against a
//! PostgreSQL database through the pooled query layer.

use clap::Parser;
use futures_util::StreamExt;
use pgpool_lease::config::{Command, Config, PoolConfig, parse_param};
use pgpool_lease::listen::{Listener, Notification, PgListenConnector};
use pgpool_lease::{DbClient, DbError, PoolRegistry, SqlTemplate};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout stays machine-readable JSON.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn template(sql: &str, params: &[String]) -> SqlTemplate {
    SqlTemplate::with_values(sql, params.iter().map(|p| parse_param(p)).collect())
}

async fn run_query(
    registry: &PoolRegistry,
    pool: &PoolConfig,
    sql: &str,
    params: &[String],
) -> CliResult {
    let client = DbClient::connect(registry, pool).await?;
    let output = client.query(&template(sql, params), None).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_stream(
    registry: &PoolRegistry,
    pool: &PoolConfig,
    sql: &str,
    params: &[String],
    batch: u32,
) -> CliResult {
    let client = DbClient::connect(registry, pool).await?;
    let cursor = client.cursor_open(&template(sql, params), None).await?;
    info!(cursor = %cursor.name(), batch, "Streaming rows");

    let mut batches = std::pin::pin!(cursor.into_stream(batch));
    let mut total = 0usize;
    while let Some(rows) = batches.next().await {
        for row in rows? {
            println!("{}", serde_json::to_string(&row)?);
            total += 1;
        }
    }
    info!(rows = total, "Stream complete");
    Ok(())
}

async fn run_listen(pool: &PoolConfig, channel: &str) -> CliResult {
    let listener = Listener::new(Arc::new(PgListenConnector::from_config(pool)?));
    listener
        .subscribe(channel, |notification: Notification| async move {
            let line = serde_json::to_string(&notification)
                .map_err(|e| DbError::internal(format!("Failed to encode notification: {e}")))?;
            println!("{line}");
            Ok::<_, DbError>(())
        })
        .await?;

    info!(channel, "Waiting for notifications (Ctrl-C to stop)");
    tokio::signal::ctrl_c().await?;

    listener.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let pool = config.pool_config()?;
    info!(
        pool = %pool.identity,
        max_connections = pool.options.max_connections_or_default(),
        "Starting pgpool-lease v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = PoolRegistry::postgres();
    let result = match &config.command {
        Command::Query { sql, params } => run_query(&registry, &pool, sql, params).await,
        Command::Stream { sql, params, batch } => {
            run_stream(&registry, &pool, sql, params, *batch).await
        }
        Command::Listen { channel } => run_listen(&pool, channel).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}
