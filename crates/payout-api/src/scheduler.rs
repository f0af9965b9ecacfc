//! Background scheduler that reconciles the warm cache periodically.
//! Uses a plain tokio::time::interval.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ingestion;
use crate::state::SharedState;

const DEFAULT_INTERVAL_HOURS: u64 = 6;

fn interval_hours() -> u64 {
    std::env::var("SYNC_INTERVAL_HOURS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|h| *h > 0)
        .unwrap_or(DEFAULT_INTERVAL_HOURS)
}

/// Spawn the warm-sync loop.
/// Runs immediately on startup, then every `SYNC_INTERVAL_HOURS` hours.
pub fn spawn_scheduler(state: SharedState) -> JoinHandle<()> {
    let hours = interval_hours();
    info!(interval_hours = hours, "Starting background warm sync");

    tokio::spawn(async move {
        run_once(&state).await;

        let mut interval = tokio::time::interval(Duration::from_secs(hours * 3600));
        interval.tick().await; // first tick is immediate
        loop {
            interval.tick().await;
            run_once(&state).await;
        }
    })
}

/// One sync pass followed by cache invalidation
pub async fn run_once(state: &SharedState) {
    match ingestion::run_sync(state).await {
        Ok(report) if report.failed.is_empty() => info!("Warm sync completed successfully"),
        Ok(report) => error!(failed = report.failed.len(), "Warm sync completed with failures"),
        Err(e) => error!(error = %format!("{:#}", e), "Warm sync failed"),
    }
    state.invalidate_caches();
}
