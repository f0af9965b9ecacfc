//! Ordered totals sourcing: snapshot → warm → live
//!
//! Each tier is a named strategy answering hit, degraded, miss or error. The
//! coordinator walks them in order and takes the first hit that is fresh
//! enough. A degraded answer (the last good totals of an entity whose sync is
//! failing) ends the walk as is, so a struggling explorer is retried by the
//! scheduler and not by every request. When nothing is fresh the newest stale
//! hit is returned, and failing that a well-formed, all-zero answer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::config::Entity;
use crate::constants::WARM_WINDOW_DAYS;
use crate::explorer::TransferSource;
use crate::period::SnapshotLoader;
use crate::warm::{Reconciler, WarmCache, WarmCacheRow, average, snapshot_history};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalsSource {
    Snapshot,
    Warm,
    Live,
    /// No tier could answer
    None,
}

impl fmt::Display for TotalsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TotalsSource::Snapshot => "snapshot",
            TotalsSource::Warm => "warm",
            TotalsSource::Live => "live",
            TotalsSource::None => "none",
        };
        f.write_str(name)
    }
}

/// Headline totals for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTotals {
    pub entity_id: String,
    pub total_usd: f64,
    pub last_30d_usd: f64,
    pub avg_usd: f64,
    pub payout_count: u64,
    /// Instant the data is complete up to
    pub as_of: DateTime<Utc>,
    pub source: TotalsSource,
}

impl EntityTotals {
    pub fn empty(entity_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            total_usd: 0.0,
            last_30d_usd: 0.0,
            avg_usd: 0.0,
            payout_count: 0,
            as_of: now,
            source: TotalsSource::None,
        }
    }

    fn from_row(row: &WarmCacheRow, source: TotalsSource) -> Self {
        Self {
            entity_id: row.entity_id.clone(),
            total_usd: row.total_usd,
            last_30d_usd: row.last_30d_usd,
            avg_usd: row.avg_usd,
            payout_count: row.payout_count,
            as_of: row.last_synced_at,
            source,
        }
    }
}

/// Tri-state answer of a tier
#[derive(Debug)]
pub enum TierResult {
    Hit(EntityTotals),
    /// Best available while the upstream is failing; accepted regardless of age
    Degraded(EntityTotals),
    Miss,
    Error(anyhow::Error),
}

#[async_trait]
pub trait TotalsStrategy: Send + Sync {
    fn source(&self) -> TotalsSource;

    async fn resolve(&self, entity: &Entity, now: DateTime<Utc>) -> TierResult;
}

/// Walk `strategies` in order and return the first fresh hit
pub async fn resolve_totals(
    strategies: &[&dyn TotalsStrategy],
    entity: &Entity,
    now: DateTime<Utc>,
    max_staleness: chrono::Duration,
) -> EntityTotals {
    let mut newest_stale: Option<EntityTotals> = None;

    for strategy in strategies {
        let tier = strategy.source();
        match strategy.resolve(entity, now).await {
            TierResult::Hit(totals) if now - totals.as_of <= max_staleness => {
                debug!(entity = %entity.id, %tier, "Totals resolved");
                return totals;
            }
            TierResult::Hit(totals) => {
                debug!(entity = %entity.id, %tier, as_of = %totals.as_of, "Tier data too stale");
                if newest_stale.as_ref().is_none_or(|best| totals.as_of > best.as_of) {
                    newest_stale = Some(totals);
                }
            }
            TierResult::Degraded(totals) => {
                debug!(entity = %entity.id, %tier, as_of = %totals.as_of, "Serving last known totals of a degraded sync");
                return totals;
            }
            TierResult::Miss => debug!(entity = %entity.id, %tier, "Tier miss"),
            TierResult::Error(e) => {
                warn!(entity = %entity.id, %tier, error = %format!("{:#}", e), "Tier failed, trying next");
            }
        }
    }

    newest_stale.unwrap_or_else(|| EntityTotals::empty(&entity.id, now))
}

/// Totals frozen in snapshots; complete up to the end of the newest snapshot month
pub struct SnapshotStrategy<'a> {
    pub loader: &'a SnapshotLoader,
}

#[async_trait]
impl TotalsStrategy for SnapshotStrategy<'_> {
    fn source(&self) -> TotalsSource {
        TotalsSource::Snapshot
    }

    async fn resolve(&self, entity: &Entity, now: DateTime<Utc>) -> TierResult {
        let window_start = now - chrono::Duration::days(WARM_WINDOW_DAYS);
        let history = match snapshot_history(self.loader, &entity.id, window_start) {
            Ok(history) => history,
            Err(e) => return TierResult::Error(e),
        };
        let Some(newest) = history.newest_month else {
            return TierResult::Miss;
        };

        TierResult::Hit(EntityTotals {
            entity_id: entity.id.clone(),
            total_usd: history.total_usd,
            last_30d_usd: history.recent_usd,
            avg_usd: average(history.total_usd, history.payout_count),
            payout_count: history.payout_count,
            as_of: newest.next().bounds(entity.timezone).0,
            source: TotalsSource::Snapshot,
        })
    }
}

/// Last reconciled warm-cache row; a row carrying a sync error is degraded
pub struct WarmStrategy<'a> {
    pub warm: &'a WarmCache,
}

#[async_trait]
impl TotalsStrategy for WarmStrategy<'_> {
    fn source(&self) -> TotalsSource {
        TotalsSource::Warm
    }

    async fn resolve(&self, entity: &Entity, _now: DateTime<Utc>) -> TierResult {
        match self.warm.get(&entity.id).await {
            Ok(Some(row)) if row.sync_error.is_some() => TierResult::Degraded(EntityTotals::from_row(&row, TotalsSource::Warm)),
            Ok(Some(row)) => TierResult::Hit(EntityTotals::from_row(&row, TotalsSource::Warm)),
            Ok(None) => TierResult::Miss,
            Err(e) => TierResult::Error(e),
        }
    }
}

/// Reconcile now against the explorer (also refreshes the warm row)
pub struct LiveStrategy<'a, S: TransferSource + ?Sized> {
    pub reconciler: &'a Reconciler<'a, S>,
}

#[async_trait]
impl<S: TransferSource + ?Sized> TotalsStrategy for LiveStrategy<'_, S> {
    fn source(&self) -> TotalsSource {
        TotalsSource::Live
    }

    async fn resolve(&self, entity: &Entity, now: DateTime<Utc>) -> TierResult {
        match self.reconciler.sync(entity, now).await {
            Ok(result) => match result.error {
                None => TierResult::Hit(EntityTotals::from_row(&result.row, TotalsSource::Live)),
                Some(error) => TierResult::Error(anyhow::anyhow!(error)),
            },
            Err(e) => TierResult::Error(e),
        }
    }
}
