//! # Veil Server
//!
//! Horizontally scalable room chat server. Payloads are end-to-end
//! encrypted by clients; the server only routes them.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! veil
//!
//! # Run with environment variables
//! VEIL_PORT=3001 REDIS_URL=redis://cache:6379 TELEGRAM_BOT_TOKEN=... veil
//! ```

mod config;
mod handlers;
mod metrics;
mod redis_store;
mod telegram;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veil_core::{Hub, SharedStore};

use crate::handlers::AppState;
use crate::metrics::MeteredRelay;
use crate::redis_store::RedisStore;
use crate::telegram::TelegramRelay;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    config.validate()?;

    tracing::info!(
        env = %config.env,
        "Starting Veil server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    // The hub is only built once the shared store answers.
    let store = RedisStore::connect(&config.store.url, config.store.key_prefix.clone())
        .await
        .context("Failed to connect to Redis")?;
    store.ping().await.context("Redis did not answer PING")?;

    let telegram = TelegramRelay::new(&config.relay);
    telegram.init().await;

    let hub = Arc::new(Hub::new(
        Arc::new(store),
        Arc::new(MeteredRelay::new(telegram.clone())),
        config.hub_config(),
    ));
    let monitor = hub.spawn_store_monitor(config.health_check_interval());

    let state = Arc::new(AppState::new(config, Arc::clone(&hub), telegram));
    let result = handlers::run_server(state).await;

    monitor.abort();
    tracing::info!("Veil server stopped");
    result
}
