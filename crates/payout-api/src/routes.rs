//! HTTP routes
//!
//! Period queries always answer with a well-formed aggregate; lower-tier
//! failures degrade to zeros instead of surfacing as errors.

use axum::extract::{Path, State};
use http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use payout_engine::config::Entity;
use payout_engine::ephemeral::iso_week_key;
use payout_engine::period::{Period, PeriodAggregate};
use payout_engine::snapshot::Summary;
use payout_engine::sourcing::{EntityTotals, LiveStrategy, SnapshotStrategy, TotalsStrategy, WarmStrategy, resolve_totals};
use payout_engine::warm::WarmCacheRow;

use crate::state::{AppState, SharedState};

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/entities/{id}/period/{period}", get(entity_period))
        .route("/api/entities/{id}/totals", get(entity_totals))
        .route("/api/overview", get(overview))
        .route("/api/cache/invalidate", post(invalidate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    UnknownEntity(String),
    BadPeriod(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownEntity(id) => (StatusCode::NOT_FOUND, format!("unknown entity '{}'", id)),
            ApiError::BadPeriod(p) => (StatusCode::BAD_REQUEST, format!("unknown period '{}', expected 7d, 30d or 12m", p)),
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn find_entity<'a>(state: &'a AppState, id: &str) -> Result<&'a Entity, ApiError> {
    state.config.entity(id).ok_or_else(|| ApiError::UnknownEntity(id.to_string()))
}

/// Warm row, with store failures logged and treated as absent
async fn warm_row(state: &AppState, entity_id: &str) -> Option<WarmCacheRow> {
    match state.warm.get(entity_id).await {
        Ok(row) => row,
        Err(e) => {
            warn!(entity = entity_id, error = %format!("{:#}", e), "Warm cache read failed");
            None
        }
    }
}

/// Snapshot reads are blocking file I/O, so they run on the blocking pool
async fn load_period(
    state: &SharedState,
    entity: &Entity,
    period: Period,
    now: DateTime<Utc>,
) -> Result<PeriodAggregate, ApiError> {
    let state = Arc::clone(state);
    let entity = entity.clone();
    tokio::task::spawn_blocking(move || state.loader.load_period(&entity, period, now))
        .await
        .map_err(|e| ApiError::Internal(format!("period load task failed: {}", e)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn entity_period(
    State(state): State<SharedState>,
    Path((id, period)): Path<(String, String)>,
) -> Result<Json<PeriodAggregate>, ApiError> {
    let entity = find_entity(&state, &id)?;
    let period: Period = period.parse().map_err(|_| ApiError::BadPeriod(period))?;

    let aggregate = load_period(&state, entity, period, state.now()).await?;
    Ok(Json(aggregate.with_warm(warm_row(&state, &entity.id).await)))
}

async fn entity_totals(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<EntityTotals>, ApiError> {
    let entity = find_entity(&state, &id)?;

    let reconciler = state.reconciler();
    let snapshot_tier = SnapshotStrategy { loader: &state.loader };
    let warm_tier = WarmStrategy { warm: &state.warm };
    let live_tier = LiveStrategy { reconciler: &reconciler };
    let tiers: [&dyn TotalsStrategy; 3] = [&snapshot_tier, &warm_tier, &live_tier];

    let totals = resolve_totals(&tiers, entity, state.now(), state.config.max_staleness).await;
    Ok(Json(totals))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityOverview {
    pub entity_id: String,
    pub name: String,
    pub last_30d: Summary,
    pub warm: Option<WarmCacheRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub week: String,
    pub generated_at: DateTime<Utc>,
    pub entities: Vec<EntityOverview>,
}

async fn build_overview(state: &SharedState, week: String, now: DateTime<Utc>) -> Result<Overview, ApiError> {
    let mut entities = Vec::with_capacity(state.config.entities.len());
    for entity in &state.config.entities {
        let last_30d = load_period(state, entity, Period::ThirtyDays, now).await?.summary;
        entities.push(EntityOverview {
            entity_id: entity.id.clone(),
            name: entity.name.clone(),
            last_30d,
            warm: warm_row(state, &entity.id).await,
        });
    }
    Ok(Overview {
        week,
        generated_at: now,
        entities,
    })
}

async fn overview(State(state): State<SharedState>) -> Result<Json<Overview>, ApiError> {
    let now = state.now();
    let week = iso_week_key(now);
    if let Some(cached) = state.overview_cache.get(&week) {
        return Ok(Json(cached));
    }

    let fresh = build_overview(&state, week.clone(), now).await?;
    state.overview_cache.set_default(week, fresh.clone());
    Ok(Json(fresh))
}

async fn invalidate(State(state): State<SharedState>) -> StatusCode {
    state.invalidate_caches();
    StatusCode::NO_CONTENT
}
