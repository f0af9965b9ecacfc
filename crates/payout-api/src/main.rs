use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use payout_api::scheduler::spawn_scheduler;
use payout_api::{AppState, router};
use payout_engine::config::{Config, FileConfig};
use payout_engine::constants;
use payout_engine::explorer::ExplorerClient;
use payout_engine::prices;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")))
        .init();

    let config_path = std::env::var("PAYOUT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(constants::CONFIG_FILENAME));
    let file_config = FileConfig::load(&config_path)?;
    let config = Config::from_file(&file_config, std::env::var("EXPLORER_API_KEY").ok())?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let client = ExplorerClient::new(&config.explorer)?;
    let price = prices::native_usd_price(config.native_usd_price, config.live_native_price).await;
    let state = Arc::new(AppState::new(config, Arc::new(client), price).await?);

    spawn_scheduler(state.clone());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, "Listening");

    axum::serve(listener, router(state)).await.context("Server error")?;
    Ok(())
}
