//! Shared server state

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use payout_engine::config::Config;
use payout_engine::ephemeral::EphemeralCache;
use payout_engine::explorer::{Pagination, TransferSource};
use payout_engine::normalize::Normalizer;
use payout_engine::period::SnapshotLoader;
use payout_engine::store::SnapshotStore;
use payout_engine::warm::{Reconciler, WarmCache};

use crate::routes::Overview;

pub struct AppState {
    pub config: Config,
    pub loader: SnapshotLoader,
    pub warm: WarmCache,
    pub source: Arc<dyn TransferSource>,
    pub normalizer: Normalizer,
    /// All-entity overview, keyed by ISO week
    pub overview_cache: EphemeralCache<String, Overview>,
    pub clock: fn() -> DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub async fn new(config: Config, source: Arc<dyn TransferSource>, native_usd_price: f64) -> Result<Self> {
        let warm = WarmCache::open(&config.warm_cache_path()).await?;
        Ok(Self::with_warm(config, source, native_usd_price, warm))
    }

    pub fn with_warm(config: Config, source: Arc<dyn TransferSource>, native_usd_price: f64, warm: WarmCache) -> Self {
        let loader = SnapshotLoader::new(SnapshotStore::new(config.snapshot_dir()), config.month_cache_ttl);
        Self {
            normalizer: Normalizer::new(native_usd_price, config.explorer.clock),
            overview_cache: EphemeralCache::new(config.aggregate_cache_ttl),
            loader,
            warm,
            source,
            config,
            clock: Utc::now,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn reconciler(&self) -> Reconciler<'_, dyn TransferSource> {
        Reconciler {
            source: &*self.source,
            loader: &self.loader,
            warm: &self.warm,
            normalizer: self.normalizer,
            pagination: Pagination::from_settings(&self.config.explorer),
        }
    }

    /// Drop every in-memory cache after new data lands
    pub fn invalidate_caches(&self) {
        self.overview_cache.invalidate();
        self.loader.invalidate();
    }
}
