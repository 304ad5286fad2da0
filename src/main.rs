//! Simple Bank task worker
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌───────────────┐    ┌──────────┐
//! │  Redis   │───▶│Processor │───▶│ verify-email  │───▶│  Mailer  │
//! │ (queues) │◀───│(N loops) │    │   handler     │    │(relay/log)│
//! └──────────┘    └──────────┘    └───────┬───────┘    └──────────┘
//!                                         ▼
//!                                    PostgreSQL
//! ```
//!
//! Usage: `simple-bank-worker [--env <name>]` loads `config/<name>.yaml`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::mail;
use simple_bank::store::PgStore;
use simple_bank::worker::broker::redis::DEFAULT_KEY_PREFIX;
use simple_bank::worker::{ProcessorConfig, RedisBroker, SendVerifyEmailHandler, TaskProcessor};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!("Starting Simple Bank worker in {} mode", env);

    let db = Database::connect(&app_config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Database ready");

    let broker = RedisBroker::connect(&app_config.redis_url, DEFAULT_KEY_PREFIX)
        .await
        .context("Failed to connect to Redis")?;
    let mailer = mail::build_sender(&app_config.email).context("Failed to build mail sender")?;
    let store = Arc::new(PgStore::new(db));

    let processor_config = ProcessorConfig::from_worker_config(&app_config.worker)
        .context("Invalid worker configuration")?;
    let handler = SendVerifyEmailHandler::new(store, mailer, app_config.verify_email.clone());
    let processor = Arc::new(
        TaskProcessor::new(Arc::new(broker), processor_config).register(Arc::new(handler)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(processor.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, draining in-flight tasks");
    let _ = shutdown_tx.send(true);

    running.await.context("Task processor panicked")?;
    tracing::info!("Simple Bank worker stopped");
    Ok(())
}
