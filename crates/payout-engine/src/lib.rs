//! Payout ingestion and tiered aggregation
//!
//! Explorer transfers are normalized into payouts, frozen into monthly
//! snapshots, reconciled into a warm-cache row per entity, and merged into
//! 7-day, 30-day and 12-month aggregates.

pub mod backfill;
pub mod config;
pub mod constants;
pub mod ephemeral;
pub mod error;
pub mod explorer;
pub mod month;
pub mod normalize;
pub mod period;
pub mod prices;
pub mod report;
pub mod snapshot;
pub mod sourcing;
pub mod store;
pub mod tokens;
pub mod warm;

pub use config::{Config, Entity, FileConfig};
pub use error::ExplorerError;
pub use month::YearMonth;
pub use normalize::{Normalizer, Payout};
pub use period::{Period, PeriodAggregate, SnapshotLoader};
pub use snapshot::MonthlySnapshot;
pub use store::SnapshotStore;
pub use warm::{WarmCache, WarmCacheRow};

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by unit tests

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use chrono_tz::Tz;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use crate::config::Entity;
    use crate::error::ExplorerError;
    use crate::explorer::{PageRequest, RawTransfer, TransferKind, TransferPage, TransferSource};
    use crate::normalize::Payout;
    use crate::tokens::PaymentMethod;

    pub const FIRM_ADDRESS: &str = "0x1111111111111111111111111111111111111111";
    pub const TRADER_ADDRESS: &str = "0x2222222222222222222222222222222222222222";

    /// Noon UTC on the given day of March 2025
    pub fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, 12, 0, 0).unwrap()
    }

    pub fn entity() -> Entity {
        Entity::new("acme", Tz::UTC, &[FIRM_ADDRESS])
    }

    /// Outbound USDC transfer worth `usd`
    pub fn transfer_at(hash: &str, at: DateTime<Utc>, usd: f64) -> RawTransfer {
        RawTransfer {
            hash: hash.to_string(),
            from: FIRM_ADDRESS.to_string(),
            to: Some(TRADER_ADDRESS.to_string()),
            kind: TransferKind::Token,
            symbol: Some("USDC".to_string()),
            raw_value: Some(format!("{}", (usd * 1_000_000.0).round() as u128)),
            decimals: Some(6),
            value: Some(usd),
            block_number: None,
            block_timestamp: Some(at),
        }
    }

    pub fn payout(hash: &str, at: DateTime<Utc>, usd: f64) -> Payout {
        Payout {
            tx_hash: hash.to_string(),
            entity_id: "acme".to_string(),
            amount_usd: usd,
            payment_method: PaymentMethod::Crypto,
            timestamp: at,
            from_address: FIRM_ADDRESS.to_string(),
            to_address: Some(TRADER_ADDRESS.to_string()),
        }
    }

    /// In-memory explorer: pages per address, cursor is the next page index
    #[derive(Default)]
    pub struct FakeSource {
        pages: HashMap<String, Vec<Vec<RawTransfer>>>,
        failing: HashSet<String>,
        /// Window starts whose requests fail, for any address
        failing_windows: HashSet<DateTime<Utc>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_pages(mut self, address: &str, pages: Vec<Vec<RawTransfer>>) -> Self {
            self.pages.insert(address.to_string(), pages);
            self
        }

        pub fn failing(mut self, address: &str) -> Self {
            self.failing.insert(address.to_string());
            self
        }

        pub fn failing_from(mut self, window_start: DateTime<Utc>) -> Self {
            self.failing_windows.insert(window_start);
            self
        }

        pub fn calls(&self, address: &str) -> usize {
            self.calls.lock().unwrap().get(address).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl TransferSource for FakeSource {
        async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
            *self.calls.lock().unwrap().entry(request.address.to_string()).or_default() += 1;

            let window_fails = request.window.from.is_some_and(|from| self.failing_windows.contains(&from));
            if self.failing.contains(request.address) || window_fails {
                return Err(ExplorerError::RetriesExhausted {
                    attempts: 3,
                    last: Box::new(ExplorerError::Http { status: 503 }),
                });
            }

            let index: usize = request.cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let pages = self.pages.get(request.address);
            let transfers = pages.and_then(|p| p.get(index)).cloned().unwrap_or_default();
            let has_next = pages.is_some_and(|p| index + 1 < p.len());

            Ok(TransferPage {
                transfers,
                next_cursor: has_next.then(|| (index + 1).to_string()),
            })
        }
    }
}
