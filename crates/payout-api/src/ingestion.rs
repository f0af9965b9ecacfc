//! One warm-cache reconciliation pass over every configured entity.
//! Called by the scheduler or on demand.

use anyhow::Result;
use tracing::{info, warn};

use payout_engine::warm::BatchSyncReport;

use crate::state::AppState;

/// Reconcile all entities; per-entity failures are reported, not returned
pub async fn run_sync(state: &AppState) -> Result<BatchSyncReport> {
    let entities = state.config.select_entities(&[])?;
    info!(entities = entities.len(), "Starting warm sync");

    let report = state
        .reconciler()
        .batch_sync(&entities, state.config.entity_delay)
        .await;

    for (entity, error) in &report.failed {
        warn!(entity = %entity, error = %error, "Entity sync failed");
    }
    info!(synced = report.synced(), failed = report.failed.len(), "Warm sync finished");
    Ok(report)
}
