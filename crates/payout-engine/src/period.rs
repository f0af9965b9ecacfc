//! Snapshot loading and period aggregation
//!
//! 7-day and 30-day aggregates are recomputed from the transactions of the
//! months the window touches, plus the live window of the latest warm sync
//! for the month that has no snapshot yet. Snapshot copies win on hash
//! collisions. The 12-month aggregate sums precomputed monthly
//! summaries and always has exactly twelve monthly buckets; months without a
//! snapshot become zero placeholders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Entity;
use crate::constants::YEAR_TRANSACTION_LIMIT;
use crate::month::YearMonth;
use crate::normalize::Payout;
use crate::snapshot::{self, DailyBucket, LiveWindow, MethodBreakdown, MonthlySnapshot, Summary};
use crate::store::SnapshotStore;
use crate::warm::WarmCacheRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "12m")]
    TwelveMonths,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::SevenDays => "7d",
            Period::ThirtyDays => "30d",
            Period::TwelveMonths => "12m",
        }
    }

    /// Rolling window length for the daily periods
    pub fn window(&self) -> Option<chrono::Duration> {
        match self {
            Period::SevenDays => Some(chrono::Duration::days(7)),
            Period::ThirtyDays => Some(chrono::Duration::days(30)),
            Period::TwelveMonths => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "7d" => Ok(Period::SevenDays),
            "30d" => Ok(Period::ThirtyDays),
            "12m" => Ok(Period::TwelveMonths),
            other => anyhow::bail!("Unknown period '{}', expected 7d, 30d or 12m", other),
        }
    }
}

/// One month of a 12-month aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyBucket {
    pub month: YearMonth,
    pub total: f64,
    pub count: usize,
    pub largest: f64,
    pub by_method: MethodBreakdown,
    /// False for zero-filled placeholder months
    pub has_data: bool,
}

impl MonthlyBucket {
    fn placeholder(month: YearMonth) -> Self {
        Self {
            month,
            total: 0.0,
            count: 0,
            largest: 0.0,
            by_method: MethodBreakdown::default(),
            has_data: false,
        }
    }

    fn from_snapshot(snapshot: &MonthlySnapshot) -> Self {
        Self {
            month: snapshot.year_month,
            total: snapshot.summary.total_payouts,
            count: snapshot.summary.payout_count,
            largest: snapshot.summary.largest_payout,
            by_method: snapshot.summary.by_method,
            has_data: true,
        }
    }
}

/// Request-scoped merge of one or more snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodAggregate {
    pub entity_id: String,
    pub period: Period,
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daily_buckets: Vec<DailyBucket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monthly_buckets: Vec<MonthlyBucket>,
    pub transactions: Vec<Payout>,
    /// Current best-known totals, when a warm-cache row exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmCacheRow>,
}

impl PeriodAggregate {
    pub fn with_warm(mut self, row: Option<WarmCacheRow>) -> Self {
        self.warm = row;
        self
    }
}

struct CachedMonth {
    snapshot: Arc<MonthlySnapshot>,
    expires_at: Instant,
}

/// Snapshot reads fronted by a short-TTL cache keyed by (entity, month)
pub struct SnapshotLoader {
    store: SnapshotStore,
    ttl: Duration,
    cache: RwLock<HashMap<(String, YearMonth), CachedMonth>>,
}

impl SnapshotLoader {
    pub fn new(store: SnapshotStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn get_cached(&self, key: &(String, YearMonth)) -> Option<Arc<MonthlySnapshot>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(key)?;
        (entry.expires_at > Instant::now()).then(|| Arc::clone(&entry.snapshot))
    }

    fn set_cached(&self, key: (String, YearMonth), snapshot: Arc<MonthlySnapshot>) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.len() > 256 {
                let now = Instant::now();
                cache.retain(|_, v| v.expires_at > now);
            }
            cache.insert(
                key,
                CachedMonth {
                    snapshot,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    /// A month's snapshot. Missing or unreadable months are `None`, never errors.
    pub fn load_month(&self, entity_id: &str, month: YearMonth) -> Option<Arc<MonthlySnapshot>> {
        let key = (entity_id.to_string(), month);
        if let Some(hit) = self.get_cached(&key) {
            return Some(hit);
        }

        match self.store.load(entity_id, month) {
            Ok(Some(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                self.set_cached(key, Arc::clone(&snapshot));
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(entity = entity_id, %month, error = %format!("{:#}", e), "Unreadable snapshot treated as missing");
                None
            }
        }
    }

    /// The entity's live window; unreadable files are logged and skipped
    pub fn load_live(&self, entity_id: &str) -> Option<LiveWindow> {
        match self.store.load_live(entity_id) {
            Ok(live) => live,
            Err(e) => {
                warn!(entity = entity_id, error = %format!("{:#}", e), "Unreadable live window ignored");
                None
            }
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Aggregate `period` for `entity` as of `now`
    pub fn load_period(&self, entity: &Entity, period: Period, now: DateTime<Utc>) -> PeriodAggregate {
        match period.window() {
            Some(window) => self.load_window(entity, period, now - window, now),
            None => self.load_year(entity, now),
        }
    }

    fn load_window(&self, entity: &Entity, period: Period, start: DateTime<Utc>, now: DateTime<Utc>) -> PeriodAggregate {
        let tz = entity.timezone;
        // Usually two months; a 30-day window ending early in March reaches January.
        let months = YearMonth::range(
            YearMonth::containing(start, tz),
            YearMonth::containing(now, tz).next(),
        );

        let live = self.load_live(&entity.id).map(|l| l.payouts).unwrap_or_default();
        let live_count = live.len();
        let in_window = months
            .iter()
            .filter_map(|&month| self.load_month(&entity.id, month))
            .flat_map(|s| s.transactions.clone())
            .chain(live)
            .filter(|p| p.timestamp >= start && p.timestamp <= now);
        let mut transactions = snapshot::dedup_by_hash(in_window);
        snapshot::sort_newest_first(&mut transactions);

        debug!(
            entity = %entity.id,
            %period,
            months = months.len(),
            live = live_count,
            payouts = transactions.len(),
            "Aggregated window"
        );

        PeriodAggregate {
            entity_id: entity.id.clone(),
            period,
            generated_at: now,
            window_start: start,
            window_end: now,
            summary: Summary::from_payouts(&transactions),
            daily_buckets: snapshot::daily_buckets(&transactions, tz),
            monthly_buckets: Vec::new(),
            transactions,
            warm: None,
        }
    }

    /// The twelve most recent completed months of the entity's calendar
    fn load_year(&self, entity: &Entity, now: DateTime<Utc>) -> PeriodAggregate {
        let tz = entity.timezone;
        let end = YearMonth::containing(now, tz);
        let mut first = end;
        for _ in 0..12 {
            first = first.prev();
        }

        let mut summary = Summary::default();
        let mut monthly_buckets = Vec::with_capacity(12);
        let mut transactions = Vec::new();
        for month in YearMonth::range(first, end) {
            match self.load_month(&entity.id, month) {
                Some(snapshot) => {
                    summary.absorb(&snapshot.summary);
                    monthly_buckets.push(MonthlyBucket::from_snapshot(&snapshot));
                    transactions.extend(snapshot.transactions.iter().cloned());
                }
                None => monthly_buckets.push(MonthlyBucket::placeholder(month)),
            }
        }

        snapshot::sort_newest_first(&mut transactions);
        transactions.truncate(YEAR_TRANSACTION_LIMIT);

        PeriodAggregate {
            entity_id: entity.id.clone(),
            period: Period::TwelveMonths,
            generated_at: now,
            window_start: first.bounds(tz).0,
            window_end: end.bounds(tz).0,
            summary,
            daily_buckets: Vec::new(),
            monthly_buckets,
            transactions,
            warm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::build;
    use crate::test_support::{day, entity, payout};
    use chrono::TimeZone;
    use chrono_tz::Tz;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn write(store: &SnapshotStore, month: &str, payouts: &[Payout]) {
        let snapshot = build("acme", ym(month), Tz::UTC, payouts, at(2025, 4, 1));
        store.write(&snapshot).unwrap();
    }

    fn loader(dir: &TempDir) -> SnapshotLoader {
        SnapshotLoader::new(SnapshotStore::new(dir.path()), Duration::from_secs(300))
    }

    fn seeded(dir: &TempDir) -> SnapshotLoader {
        let loader = loader(dir);
        write(
            loader.store(),
            "2025-02",
            &[payout("0xf1", at(2025, 2, 10), 400.0), payout("0xf2", at(2025, 2, 27), 120.0)],
        );
        write(
            loader.store(),
            "2025-03",
            &[
                payout("0xm1", day(2), 80.0),
                payout("0xm2", day(20), 60.0),
                payout("0xm3", day(24), 15.0),
            ],
        );
        loader
    }

    #[test]
    fn parses_periods() {
        assert_eq!("30d".parse::<Period>().unwrap(), Period::ThirtyDays);
        assert!("1y".parse::<Period>().is_err());
        assert_eq!(serde_json::to_string(&Period::TwelveMonths).unwrap(), "\"12m\"");
    }

    #[test]
    fn window_summary_is_recomputed_from_filtered_transactions() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);
        let now = at(2025, 3, 25);

        let week = loader.load_period(&entity(), Period::SevenDays, now);
        let hashes: Vec<_> = week.transactions.iter().map(|p| p.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xm3", "0xm2"]);
        assert_eq!(week.summary.total_payouts, 75.0);
        assert_eq!(week.daily_buckets.len(), 2);

        let month = loader.load_period(&entity(), Period::ThirtyDays, now);
        assert_eq!(month.summary.payout_count, 4, "Feb 27 plus three March payouts");
        assert_eq!(month.summary.total_payouts, 275.0);
    }

    #[test]
    fn thirty_days_contains_seven_days() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);

        for now in [at(2025, 3, 3), at(2025, 3, 21), at(2025, 3, 31)] {
            let week: HashSet<_> = loader
                .load_period(&entity(), Period::SevenDays, now)
                .transactions
                .into_iter()
                .map(|p| p.tx_hash)
                .collect();
            let month: HashSet<_> = loader
                .load_period(&entity(), Period::ThirtyDays, now)
                .transactions
                .into_iter()
                .map(|p| p.tx_hash)
                .collect();
            assert!(week.is_subset(&month));
        }
    }

    #[test]
    fn window_merges_live_payouts_of_the_open_month() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);
        let april = |d| Utc.with_ymd_and_hms(2025, 4, d, 12, 0, 0).unwrap();
        loader
            .store()
            .write_live(&LiveWindow {
                entity_id: "acme".into(),
                since: at(2025, 3, 21),
                fetched_at: april(20),
                // 0xm3 is already frozen in March and must count once
                payouts: vec![payout("0xapr", april(18), 500.0), payout("0xm3", day(24), 15.0)],
            })
            .unwrap();
        let now = at(2025, 4, 20);

        let week = loader.load_period(&entity(), Period::SevenDays, now);
        assert_eq!(week.summary.total_payouts, 500.0);
        assert_eq!(week.summary.payout_count, 1);

        let month = loader.load_period(&entity(), Period::ThirtyDays, now);
        let hashes: Vec<_> = month.transactions.iter().map(|p| p.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xapr", "0xm3"]);
        assert_eq!(month.summary.total_payouts, 515.0);

        // Completed months only; the live window stays out of the year view
        let year = loader.load_period(&entity(), Period::TwelveMonths, now);
        assert!(year.transactions.iter().all(|p| p.tx_hash != "0xapr"));
    }

    #[test]
    fn thirty_days_early_march_reaches_january() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);
        write(loader.store(), "2025-01", &[payout("0xj", at(2025, 1, 31), 500.0)]);

        let month = loader.load_period(&entity(), Period::ThirtyDays, at(2025, 3, 1));
        assert!(month.transactions.iter().any(|p| p.tx_hash == "0xj"));
    }

    #[test]
    fn twelve_months_always_has_twelve_buckets() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);
        write(loader.store(), "2024-11", &[payout("0xn", at(2024, 11, 5), 1000.0)]);

        let year = loader.load_period(&entity(), Period::TwelveMonths, at(2025, 4, 15));
        assert_eq!(year.monthly_buckets.len(), 12);
        assert_eq!(year.monthly_buckets[0].month, ym("2024-04"));
        assert_eq!(year.monthly_buckets[11].month, ym("2025-03"));
        assert_eq!(year.monthly_buckets.iter().filter(|b| b.has_data).count(), 3);
        assert_eq!(year.summary.total_payouts, 1675.0);
        assert_eq!(year.summary.payout_count, 6);
        assert_eq!(year.summary.largest_payout, 1000.0);
        assert_eq!(year.transactions[0].tx_hash, "0xm3");
    }

    #[test]
    fn twelve_months_caps_transactions() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir);
        let payouts: Vec<_> = (0..150)
            .map(|i| payout(&format!("0x{:03}", i), day(1 + i % 28), 20.0))
            .collect();
        write(loader.store(), "2025-03", &payouts);

        let year = loader.load_period(&entity(), Period::TwelveMonths, at(2025, 4, 2));
        assert_eq!(year.transactions.len(), YEAR_TRANSACTION_LIMIT);
        assert_eq!(year.summary.payout_count, 150);
    }

    #[test]
    fn empty_store_yields_zero_aggregate() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir);
        let week = loader.load_period(&entity(), Period::SevenDays, at(2025, 3, 25));
        assert_eq!(week.summary, Summary::default());
        assert!(week.transactions.is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir);
        fs::create_dir_all(dir.path().join("acme")).unwrap();
        fs::write(loader.store().path_for("acme", ym("2025-03")), b"garbage").unwrap();

        assert!(loader.load_month("acme", ym("2025-03")).is_none());
        let year = loader.load_period(&entity(), Period::TwelveMonths, at(2025, 4, 2));
        assert!(year.monthly_buckets.iter().all(|b| !b.has_data));
    }

    #[test]
    fn cached_month_survives_store_removal_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let loader = seeded(&dir);
        assert!(loader.load_month("acme", ym("2025-03")).is_some());

        fs::remove_file(loader.store().path_for("acme", ym("2025-03"))).unwrap();
        assert!(loader.load_month("acme", ym("2025-03")).is_some());

        loader.invalidate();
        assert!(loader.load_month("acme", ym("2025-03")).is_none());
    }
}
