mod config;
mod detector;
mod engine;
mod error;
mod gate;
mod markers;
mod player;
mod ranker;
mod retry;
mod session;
mod source;
mod streams;
mod web;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::RankingEngine;
use crate::web::server::WebServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crowdwatch=info".into()),
        )
        .init();

    info!("📹 crowdwatch v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "crowdwatch.toml".to_string());

    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);

    let config = Arc::new(config);

    // Initialize ranking engine (layout, ranker, score source, markers, player)
    let engine = Arc::new(RankingEngine::new(config.clone())?);

    // Register streams and mixes; the poll loop retries setup until it works
    if let Err(e) = engine.bootstrap().await {
        warn!("{}; retrying from the poll loop", e);
    }

    // Fall back to the configured media servers if no lookup arrives
    let timeout_engine = engine.clone();
    tokio::spawn(async move {
        timeout_engine.run_server_info_timeout().await;
    });

    // Start Web API
    let web_engine = engine.clone();
    let web_config = config.clone();
    tokio::spawn(async move {
        let web = WebServer::new(web_engine, web_config);
        if let Err(e) = web.run().await {
            error!("Web server error: {}", e);
        }
    });

    // Main poll loop
    let poll_engine = engine.clone();
    tokio::select! {
        _ = poll_engine.run_poll_loop() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down after {} ticks", engine.session_labels().tick);
        }
    }
    Ok(())
}
