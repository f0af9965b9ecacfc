//! Monthly snapshot construction
//!
//! A snapshot freezes one entity's payouts for one calendar month of the
//! entity's own time zone: a summary, sparse daily buckets and the
//! transaction list (newest first).

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::month::YearMonth;
use crate::normalize::Payout;
use crate::tokens::PaymentMethod;

/// USD totals per payment method
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBreakdown {
    #[serde(default)]
    pub rise: f64,
    #[serde(default)]
    pub crypto: f64,
    #[serde(default)]
    pub wire: f64,
}

impl MethodBreakdown {
    pub fn add(&mut self, method: PaymentMethod, amount: f64) {
        match method {
            PaymentMethod::Rise => self.rise += amount,
            PaymentMethod::Crypto => self.crypto += amount,
            PaymentMethod::Wire => self.wire += amount,
        }
    }

    pub fn get(&self, method: PaymentMethod) -> f64 {
        match method {
            PaymentMethod::Rise => self.rise,
            PaymentMethod::Crypto => self.crypto,
            PaymentMethod::Wire => self.wire,
        }
    }

    pub fn merge(&mut self, other: &MethodBreakdown) {
        for method in PaymentMethod::ALL {
            self.add(method, other.get(method));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_payouts: f64,
    pub payout_count: usize,
    pub largest_payout: f64,
    pub avg_payout: f64,
    #[serde(default)]
    pub by_method: MethodBreakdown,
}

impl Summary {
    pub fn from_payouts<'a>(payouts: impl IntoIterator<Item = &'a Payout>) -> Self {
        let mut summary = Summary::default();
        for payout in payouts {
            summary.total_payouts += payout.amount_usd;
            summary.payout_count += 1;
            summary.largest_payout = summary.largest_payout.max(payout.amount_usd);
            summary.by_method.add(payout.payment_method, payout.amount_usd);
        }
        summary.finish();
        summary
    }

    /// Fold another precomputed summary into this one
    pub fn absorb(&mut self, other: &Summary) {
        self.total_payouts += other.total_payouts;
        self.payout_count += other.payout_count;
        self.largest_payout = self.largest_payout.max(other.largest_payout);
        self.by_method.merge(&other.by_method);
        self.finish();
    }

    fn finish(&mut self) {
        self.avg_payout = if self.payout_count > 0 {
            self.total_payouts / self.payout_count as f64
        } else {
            0.0
        };
    }
}

/// Payouts of one entity-local calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub total: f64,
    pub count: usize,
    #[serde(default)]
    pub by_method: MethodBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySnapshot {
    pub entity_id: String,
    pub year_month: YearMonth,
    pub timezone: Tz,
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub daily_buckets: Vec<DailyBucket>,
    /// Newest first
    pub transactions: Vec<Payout>,
}

impl MonthlySnapshot {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Payouts seen by the latest successful warm sync, from `since` up to
/// `fetched_at`. Covers the open month (and any month not yet snapshotted);
/// replaced wholesale by the next sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveWindow {
    pub entity_id: String,
    pub since: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub payouts: Vec<Payout>,
}

/// Group payouts into days of `tz`, ascending. Days without payouts are omitted.
pub fn daily_buckets<'a>(payouts: impl IntoIterator<Item = &'a Payout>, tz: Tz) -> Vec<DailyBucket> {
    let mut days: BTreeMap<NaiveDate, DailyBucket> = BTreeMap::new();
    for payout in payouts {
        let date = payout.timestamp.with_timezone(&tz).date_naive();
        let bucket = days.entry(date).or_insert_with(|| DailyBucket {
            date,
            total: 0.0,
            count: 0,
            by_method: MethodBreakdown::default(),
        });
        bucket.total += payout.amount_usd;
        bucket.count += 1;
        bucket.by_method.add(payout.payment_method, payout.amount_usd);
    }
    days.into_values().collect()
}

/// Newest first; hash breaks ties so output is deterministic
pub fn sort_newest_first(payouts: &mut [Payout]) {
    payouts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.tx_hash.cmp(&b.tx_hash)));
}

/// Keep the first payout seen for each hash
pub fn dedup_by_hash(payouts: impl IntoIterator<Item = Payout>) -> Vec<Payout> {
    let mut seen = HashSet::new();
    payouts.into_iter().filter(|p| seen.insert(p.tx_hash.clone())).collect()
}

/// Build the snapshot for `month`. Payouts outside the entity-local month are ignored.
pub fn build(
    entity_id: &str,
    month: YearMonth,
    tz: Tz,
    payouts: &[Payout],
    generated_at: DateTime<Utc>,
) -> MonthlySnapshot {
    let mut transactions = dedup_by_hash(
        payouts
            .iter()
            .filter(|p| month.contains(p.timestamp.with_timezone(&tz).date_naive()))
            .cloned(),
    );
    sort_newest_first(&mut transactions);

    MonthlySnapshot {
        entity_id: entity_id.to_string(),
        year_month: month,
        timezone: tz,
        generated_at,
        summary: Summary::from_payouts(&transactions),
        daily_buckets: daily_buckets(&transactions, tz),
        transactions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::test_support::{day, entity, payout, transfer_at};

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    #[test]
    fn spam_transfer_never_reaches_snapshot() {
        let e = entity();
        let raw = vec![transfer_at("0xbig", day(12), 50.0), transfer_at("0xsmall", day(12), 5.0)];
        let payouts = Normalizer::new(2500.0, Default::default()).normalize_all(&raw, &e);

        let snapshot = build(&e.id, ym("2025-03"), e.timezone, &payouts, day(31));

        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.daily_buckets.len(), 1);
        assert_eq!(snapshot.daily_buckets[0].total, 50.0);
        assert_eq!(snapshot.summary.total_payouts, 50.0);
    }

    #[test]
    fn buckets_sum_to_summary() {
        let payouts: Vec<_> = (1..=20)
            .map(|i| payout(&format!("0x{:02}", i), day((i % 28) + 1), 10.0 + i as f64 * 3.37))
            .collect();
        let snapshot = build("acme", ym("2025-03"), Tz::UTC, &payouts, day(31));

        let bucket_sum: f64 = snapshot.daily_buckets.iter().map(|b| b.total).sum();
        assert!((bucket_sum - snapshot.summary.total_payouts).abs() < 1e-9);
        let bucket_count: usize = snapshot.daily_buckets.iter().map(|b| b.count).sum();
        assert_eq!(bucket_count, snapshot.summary.payout_count);
        assert_eq!(snapshot.summary.largest_payout, 10.0 + 20.0 * 3.37);
    }

    #[test]
    fn duplicate_hashes_count_once() {
        let p = payout("0xsame", day(4), 120.0);
        let snapshot = build("acme", ym("2025-03"), Tz::UTC, &[p.clone(), p], day(31));
        assert_eq!(snapshot.summary.payout_count, 1);
        assert_eq!(snapshot.summary.total_payouts, 120.0);
        assert_eq!(snapshot.summary.avg_payout, 120.0);
    }

    #[test]
    fn days_follow_entity_time_zone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2025-03-01 03:00 UTC is still Feb 28 in New York
        let late = payout("0xlate", "2025-03-01T03:00:00Z".parse().unwrap(), 40.0);
        let in_march = payout("0xmarch", "2025-03-02T15:00:00Z".parse().unwrap(), 60.0);

        let march = build("acme", ym("2025-03"), tz, &[late.clone(), in_march.clone()], day(31));
        assert_eq!(march.summary.total_payouts, 60.0);

        let feb = build("acme", ym("2025-02"), tz, &[late, in_march], day(31));
        assert_eq!(feb.daily_buckets[0].date, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    }

    #[test]
    fn transactions_are_newest_first_and_serialized_camel_case() {
        let snapshot = build(
            "acme",
            ym("2025-03"),
            Tz::UTC,
            &[payout("0xa", day(2), 20.0), payout("0xb", day(9), 30.0)],
            day(31),
        );
        assert_eq!(snapshot.transactions[0].tx_hash, "0xb");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["yearMonth"], "2025-03");
        assert_eq!(json["summary"]["totalPayouts"], 50.0);
        assert_eq!(json["dailyBuckets"][0]["date"], "2025-03-02");
        assert_eq!(json["transactions"][0]["paymentMethod"], "crypto");
    }
}
