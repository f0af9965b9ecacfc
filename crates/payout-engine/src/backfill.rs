//! Historical snapshot backfill
//!
//! Planning finds every completed month since the epoch start that has no
//! snapshot, including holes left by a month that failed on an earlier run.
//! Each month is fetched, normalized and written independently; a failure in
//! one month never affects its siblings.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::Entity;
use crate::explorer::{Pagination, TransferSource, TransferWindow, fetch_entity};
use crate::month::YearMonth;
use crate::normalize::Normalizer;
use crate::snapshot;
use crate::store::{SnapshotStore, WriteOutcome};

/// Months in `[epoch_start, current)` without a snapshot, ascending.
/// `current` and later months are never planned since they are still open.
pub fn plan_months(existing: &[YearMonth], epoch_start: YearMonth, current: YearMonth) -> Vec<YearMonth> {
    let present: HashSet<YearMonth> = existing.iter().copied().collect();
    YearMonth::range(epoch_start, current)
        .into_iter()
        .filter(|month| !present.contains(month))
        .collect()
}

/// One month to build
#[derive(Debug, Clone)]
pub struct MonthJob<'a> {
    pub entity: &'a Entity,
    pub month: YearMonth,
    /// Overwrite an existing snapshot
    pub rebuild: bool,
}

/// Build the job list for `entities`.
///
/// An explicit month list replaces the computed plan. Open months (the
/// entity's current local month and later) are dropped either way.
pub fn plan<'a>(
    store: &SnapshotStore,
    entities: &[&'a Entity],
    epoch_start: YearMonth,
    now: DateTime<Utc>,
    explicit_months: &[YearMonth],
    rebuild: bool,
) -> Result<Vec<MonthJob<'a>>> {
    if rebuild && explicit_months.is_empty() {
        bail!("--rebuild requires at least one --month");
    }

    let mut jobs = Vec::new();
    for &entity in entities {
        let current = YearMonth::containing(now, entity.timezone);
        let months = if explicit_months.is_empty() {
            plan_months(&store.list_months(&entity.id)?, epoch_start, current)
        } else {
            let (closed, open): (Vec<YearMonth>, Vec<YearMonth>) =
                explicit_months.iter().copied().partition(|m| *m < current);
            for month in open {
                warn!(entity = %entity.id, %month, "Skipping open month; only completed months are snapshotted");
            }
            closed
        };

        jobs.extend(months.into_iter().map(|month| MonthJob { entity, month, rebuild }));
    }
    Ok(jobs)
}

/// What happened to one month
#[derive(Debug, Clone, PartialEq)]
pub enum MonthOutcome {
    Written { payouts: usize, total_usd: f64 },
    Replaced { payouts: usize, total_usd: f64 },
    SkippedExisting,
    /// No payouts; nothing is written
    Empty,
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub planned: usize,
    pub written: usize,
    pub replaced: usize,
    pub skipped_existing: usize,
    pub empty: usize,
    /// (entity, month, error)
    pub failed: Vec<(String, YearMonth, String)>,
}

impl BackfillReport {
    fn record(&mut self, entity_id: &str, month: YearMonth, outcome: Result<MonthOutcome>) {
        match outcome {
            Ok(MonthOutcome::Written { .. }) => self.written += 1,
            Ok(MonthOutcome::Replaced { .. }) => self.replaced += 1,
            Ok(MonthOutcome::SkippedExisting) => self.skipped_existing += 1,
            Ok(MonthOutcome::Empty) => self.empty += 1,
            Err(e) => self.failed.push((entity_id.to_string(), month, format!("{:#}", e))),
        }
    }
}

/// Everything a month build needs
pub struct Backfill<'a, S: TransferSource + ?Sized> {
    pub source: &'a S,
    pub store: &'a SnapshotStore,
    pub normalizer: Normalizer,
    pub pagination: Pagination,
    pub concurrency: usize,
}

impl<S: TransferSource + ?Sized> Backfill<'_, S> {
    /// Run every job, at most `concurrency` at a time
    pub async fn run(&self, jobs: Vec<MonthJob<'_>>) -> BackfillReport {
        let mut report = BackfillReport {
            planned: jobs.len(),
            ..Default::default()
        };

        let results: Vec<_> = stream::iter(jobs)
            .map(|job| async move {
                let outcome = self.build_month(&job).await;
                (job.entity.id.clone(), job.month, outcome)
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        for (entity_id, month, outcome) in results {
            match &outcome {
                Ok(MonthOutcome::Written { payouts, total_usd }) | Ok(MonthOutcome::Replaced { payouts, total_usd }) => {
                    info!(entity = %entity_id, %month, payouts, total_usd, "Snapshot written")
                }
                Ok(MonthOutcome::Empty) => info!(entity = %entity_id, %month, "No payouts, nothing written"),
                Ok(MonthOutcome::SkippedExisting) => {}
                Err(e) => warn!(entity = %entity_id, %month, error = %format!("{:#}", e), "Month failed"),
            }
            report.record(&entity_id, month, outcome);
        }

        report
    }

    async fn build_month(&self, job: &MonthJob<'_>) -> Result<MonthOutcome> {
        let entity = job.entity;
        if !job.rebuild && self.store.exists(&entity.id, job.month) {
            return Ok(MonthOutcome::SkippedExisting);
        }

        let (start, end) = job.month.bounds(entity.timezone);
        let window = TransferWindow::between(start, end);
        let fetch = fetch_entity(self.source, &entity.addresses, &window, &self.pagination).await;
        if let Some(failure) = fetch.failure_message() {
            bail!("incomplete fetch: {}", failure);
        }

        let payouts = self.normalizer.normalize_all(&fetch.transfers, entity);
        let snapshot = snapshot::build(&entity.id, job.month, entity.timezone, &payouts, Utc::now());
        if snapshot.is_empty() {
            return Ok(MonthOutcome::Empty);
        }

        let payouts = snapshot.summary.payout_count;
        let total_usd = snapshot.summary.total_payouts;
        if job.rebuild {
            self.store.replace(&snapshot)?;
            return Ok(MonthOutcome::Replaced { payouts, total_usd });
        }

        Ok(match self.store.write(&snapshot)? {
            WriteOutcome::Created => MonthOutcome::Written { payouts, total_usd },
            WriteOutcome::AlreadyExists => MonthOutcome::SkippedExisting,
        })
    }
}
