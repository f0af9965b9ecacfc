//! Warm cache: one reconciled totals row per entity
//!
//! The reconciler combines snapshot history with a live fetch of the last
//! 30 days, reaching further back when the newest snapshot ends before that
//! window. Hashes already frozen in a snapshot are discarded from the live
//! set, so nothing crosses the snapshot/live boundary twice. The live set is
//! kept as the entity's live window for period queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Entity;
use crate::constants::WARM_WINDOW_DAYS;
use crate::explorer::{Pagination, TransferSource, TransferWindow, fetch_entity};
use crate::month::YearMonth;
use crate::normalize::Normalizer;
use crate::period::SnapshotLoader;
use crate::snapshot::LiveWindow;

/// Best known current totals for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmCacheRow {
    pub entity_id: String,
    pub total_usd: f64,
    pub last_30d_usd: f64,
    pub avg_usd: f64,
    pub payout_count: u64,
    /// Last sync that produced these totals
    pub last_synced_at: DateTime<Utc>,
    pub sync_error: Option<String>,
}

/// Row type for warm_cache queries
#[derive(FromRow)]
struct WarmRow {
    entity_id: String,
    total_usd: f64,
    last_30d_usd: f64,
    avg_usd: f64,
    payout_count: i64,
    last_synced_at: String,
    sync_error: Option<String>,
}

impl TryFrom<WarmRow> for WarmCacheRow {
    type Error = anyhow::Error;

    fn try_from(row: WarmRow) -> Result<Self> {
        let last_synced_at = DateTime::parse_from_rfc3339(&row.last_synced_at)
            .with_context(|| format!("Bad last_synced_at for {}", row.entity_id))?
            .with_timezone(&Utc);
        Ok(Self {
            entity_id: row.entity_id,
            total_usd: row.total_usd,
            last_30d_usd: row.last_30d_usd,
            avg_usd: row.avg_usd,
            payout_count: row.payout_count.max(0) as u64,
            last_synced_at,
            sync_error: row.sync_error,
        })
    }
}

/// SQLite-backed warm-cache store
pub struct WarmCache {
    pool: SqlitePool,
}

impl WarmCache {
    /// Open or create the warm-cache database
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::File::create(path)?;
        }

        let url = format!("sqlite:{}", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .context("Failed to open warm cache database")?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    /// Private in-memory database (tests, dry runs)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory warm cache")?;
        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS warm_cache (
                entity_id TEXT PRIMARY KEY,
                total_usd REAL NOT NULL,
                last_30d_usd REAL NOT NULL,
                avg_usd REAL NOT NULL,
                payout_count INTEGER NOT NULL,
                last_synced_at TEXT NOT NULL,
                sync_error TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or overwrite; concurrent writers are last-write-wins
    pub async fn upsert(&self, row: &WarmCacheRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO warm_cache
             (entity_id, total_usd, last_30d_usd, avg_usd, payout_count, last_synced_at, sync_error)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_id) DO UPDATE SET
                total_usd = excluded.total_usd,
                last_30d_usd = excluded.last_30d_usd,
                avg_usd = excluded.avg_usd,
                payout_count = excluded.payout_count,
                last_synced_at = excluded.last_synced_at,
                sync_error = excluded.sync_error",
        )
        .bind(&row.entity_id)
        .bind(row.total_usd)
        .bind(row.last_30d_usd)
        .bind(row.avg_usd)
        .bind(row.payout_count as i64)
        .bind(row.last_synced_at.to_rfc3339())
        .bind(row.sync_error.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert warm cache row for {}", row.entity_id))?;
        Ok(())
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<WarmCacheRow>> {
        let row: Option<WarmRow> = sqlx::query_as(
            "SELECT entity_id, total_usd, last_30d_usd, avg_usd, payout_count, last_synced_at, sync_error
             FROM warm_cache WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WarmCacheRow::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<WarmCacheRow>> {
        let rows: Vec<WarmRow> = sqlx::query_as(
            "SELECT entity_id, total_usd, last_30d_usd, avg_usd, payout_count, last_synced_at, sync_error
             FROM warm_cache ORDER BY entity_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WarmCacheRow::try_from).collect()
    }

    /// Delete rows that no configured entity owns and that have not synced within `retention`
    pub async fn cleanup(&self, known_entities: &[String], retention: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - retention;
        let known: HashSet<&str> = known_entities.iter().map(String::as_str).collect();
        let doomed: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|row| !known.contains(row.entity_id.as_str()) && row.last_synced_at < cutoff)
            .map(|row| row.entity_id)
            .collect();

        let mut tx = self.pool.begin().await?;
        for entity_id in &doomed {
            sqlx::query("DELETE FROM warm_cache WHERE entity_id = ?")
                .bind(entity_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(doomed.len())
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Totals already frozen in snapshots
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    pub total_usd: f64,
    pub payout_count: u64,
    /// Snapshot payouts at or after the window start
    pub recent_usd: f64,
    pub hashes: HashSet<String>,
    pub newest_month: Option<YearMonth>,
}

/// Sum every snapshot of `entity_id`
pub fn snapshot_history(loader: &SnapshotLoader, entity_id: &str, window_start: DateTime<Utc>) -> Result<SnapshotHistory> {
    let mut history = SnapshotHistory::default();
    for month in loader.store().list_months(entity_id)? {
        let Some(snapshot) = loader.load_month(entity_id, month) else {
            continue;
        };
        history.total_usd += snapshot.summary.total_payouts;
        history.payout_count += snapshot.summary.payout_count as u64;
        history.newest_month = Some(month);
        for payout in &snapshot.transactions {
            history.hashes.insert(payout.tx_hash.clone());
            if payout.timestamp >= window_start {
                history.recent_usd += payout.amount_usd;
            }
        }
    }
    Ok(history)
}

/// Outcome of one entity sync
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub entity_id: String,
    /// Row as stored after this sync
    pub row: WarmCacheRow,
    pub new_payouts: usize,
    /// Live payouts discarded because a snapshot already holds them
    pub already_counted: usize,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct BatchSyncReport {
    pub results: Vec<SyncResult>,
    /// (entity, error) for entities whose sync degraded or could not be stored
    pub failed: Vec<(String, String)>,
}

impl BatchSyncReport {
    pub fn synced(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }
}

pub struct Reconciler<'a, S: TransferSource + ?Sized> {
    pub source: &'a S,
    pub loader: &'a SnapshotLoader,
    pub warm: &'a WarmCache,
    pub normalizer: Normalizer,
    pub pagination: Pagination,
}

impl<S: TransferSource + ?Sized> Reconciler<'_, S> {
    /// Reconcile one entity and store the result
    pub async fn sync(&self, entity: &Entity, now: DateTime<Utc>) -> Result<SyncResult> {
        let window_start = now - chrono::Duration::days(WARM_WINDOW_DAYS);
        let history = snapshot_history(self.loader, &entity.id, window_start)?;
        // Nothing after the newest snapshot is frozen yet
        let fetch_from = match history.newest_month {
            Some(newest) => newest.next().bounds(entity.timezone).0.min(window_start),
            None => window_start,
        };

        let fetch = fetch_entity(
            self.source,
            &entity.addresses,
            &TransferWindow::since(fetch_from),
            &self.pagination,
        )
        .await;

        if let Some(error) = fetch.failure_message() {
            let row = match self.warm.get(&entity.id).await? {
                Some(prior) => WarmCacheRow {
                    sync_error: Some(error.clone()),
                    ..prior
                },
                None => WarmCacheRow {
                    entity_id: entity.id.clone(),
                    total_usd: history.total_usd,
                    last_30d_usd: history.recent_usd,
                    avg_usd: average(history.total_usd, history.payout_count),
                    payout_count: history.payout_count,
                    last_synced_at: now,
                    sync_error: Some(error.clone()),
                },
            };
            self.warm.upsert(&row).await?;
            warn!(entity = %entity.id, error = %error, "Warm sync degraded, kept previous totals");

            return Ok(SyncResult {
                entity_id: entity.id.clone(),
                row,
                new_payouts: 0,
                already_counted: 0,
                error: Some(error),
            });
        }

        let live = self.normalizer.normalize_all(&fetch.transfers, entity);
        let (known, fresh): (Vec<_>, Vec<_>) = live.iter().partition(|p| history.hashes.contains(&p.tx_hash));
        let fresh_usd: f64 = fresh.iter().map(|p| p.amount_usd).sum();
        let fresh_recent_usd: f64 = fresh
            .iter()
            .filter(|p| p.timestamp >= window_start)
            .map(|p| p.amount_usd)
            .sum();

        let total_usd = history.total_usd + fresh_usd;
        let payout_count = history.payout_count + fresh.len() as u64;
        let row = WarmCacheRow {
            entity_id: entity.id.clone(),
            total_usd,
            last_30d_usd: history.recent_usd + fresh_recent_usd,
            avg_usd: average(total_usd, payout_count),
            payout_count,
            last_synced_at: now,
            sync_error: None,
        };
        let (new_payouts, already_counted) = (fresh.len(), known.len());

        self.loader.store().write_live(&LiveWindow {
            entity_id: entity.id.clone(),
            since: fetch_from,
            fetched_at: now,
            payouts: live,
        })?;
        self.warm.upsert(&row).await?;

        info!(
            entity = %entity.id,
            total_usd,
            new_payouts,
            already_counted,
            since = %fetch_from,
            "Warm cache synced"
        );

        Ok(SyncResult {
            entity_id: entity.id.clone(),
            row,
            new_payouts,
            already_counted,
            error: None,
        })
    }

    /// Sync entities one at a time, pausing `entity_delay` between them
    pub async fn batch_sync(&self, entities: &[&Entity], entity_delay: Duration) -> BatchSyncReport {
        let mut report = BatchSyncReport::default();

        for (i, entity) in entities.iter().enumerate() {
            if i > 0 && !entity_delay.is_zero() {
                sleep(entity_delay).await;
            }

            match self.sync(entity, Utc::now()).await {
                Ok(result) => {
                    if let Some(error) = &result.error {
                        report.failed.push((entity.id.clone(), error.clone()));
                    }
                    report.results.push(result);
                }
                Err(e) => {
                    warn!(entity = %entity.id, error = %format!("{:#}", e), "Warm sync failed");
                    report.failed.push((entity.id.clone(), format!("{:#}", e)));
                }
            }
        }

        report
    }
}

pub(crate) fn average(total: f64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { total / count as f64 }
}
