mod aggregator;
mod api;
mod config;
mod db;
mod indexer;
mod locator;
#[cfg(test)]
mod mock_gateway;
mod models;
mod notifier;
mod parser;
mod poller;
mod rpc;
mod scanner;

use notifier::{LogNotifier, MessageFormat, Notifier, TelegramNotifier};
use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Transfer watch starting...");

    let cfg = config::load()?;
    info!("Loaded config:");
    info!("  RPC URL: {}", cfg.rpc_http_url);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Port: {}", cfg.port);
    info!("  Token: {} ({})", cfg.token_address, cfg.token_symbol);
    info!("  Recipient: {}", cfg.recipient_address);
    info!(
        "  Target amount: {} {}",
        models::format_units(cfg.target_amount, cfg.token_decimals),
        cfg.token_symbol
    );
    info!("  Confirmations: {}", cfg.confirmations);
    if let Some(since) = cfg.backfill_since {
        info!("  Backfill since: {}", since);
    }

    // Run DB migrations once at startup
    let mut conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&mut conn)?;
    info!("Schema at version {}", db::schema_version(&conn)?);

    // Shared DB connection
    let shared_conn = Arc::new(Mutex::new(conn));

    let gateway = Arc::new(rpc::RpcGateway::new(cfg.rpc_http_url.clone())?);

    let format = MessageFormat::from_config(&cfg);
    let notifier: Arc<dyn Notifier> = match &cfg.telegram {
        Some(telegram) => {
            info!("Notifications: Telegram chat {}", telegram.chat_id);
            Arc::new(TelegramNotifier::new(telegram, format)?)
        }
        None => {
            info!("Notifications: log only");
            Arc::new(LogNotifier::new(format))
        }
    };

    // Spawn API task
    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { api::serve(cfg, conn).await }
    });

    // Spawn Indexer task
    let indexer_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { indexer::run(cfg, conn, gateway, notifier).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = indexer_handle => match res {
            Ok(Ok(_)) => info!("Indexer exited cleanly"),
            Ok(Err(e)) => error!("Indexer error: {:?}", e),
            Err(e) => error!("Indexer task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Transfer watch stopped.");
    Ok(())
}
