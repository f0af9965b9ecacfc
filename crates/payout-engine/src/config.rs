//! Configuration for the payout tracker

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::explorer::BlockClock;
use crate::month::YearMonth;

// =============================================================================
// File-based Configuration (config.toml)
// =============================================================================

/// Configuration loaded from config.toml
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub explorer: ExplorerSection,
    #[serde(default)]
    pub valuation: ValuationSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub entities: Vec<EntitySection>,
}

/// Explorer API settings
#[derive(Debug, Deserialize)]
pub struct ExplorerSection {
    /// API key (may be left empty when EXPLORER_API_KEY is set)
    #[serde(default)]
    pub api_key: String,
    /// Network slug, e.g. "eth-mainnet"
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reference_block")]
    pub reference_block: u64,
    #[serde(default = "default_reference_timestamp")]
    pub reference_timestamp: i64,
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: f64,
}

/// Native asset valuation
#[derive(Debug, Deserialize)]
pub struct ValuationSection {
    #[serde(default = "default_native_usd_price")]
    pub native_usd_price: f64,
    /// Refresh the native price from price APIs once per run
    #[serde(default)]
    pub live_native_price: bool,
}

impl Default for ValuationSection {
    fn default() -> Self {
        Self {
            native_usd_price: default_native_usd_price(),
            live_native_price: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Sync, backfill and cache tuning
#[derive(Debug, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_entity_delay_ms")]
    pub entity_delay_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_epoch_start")]
    pub epoch_start: String,
    #[serde(default = "default_backfill_concurrency")]
    pub backfill_concurrency: usize,
    #[serde(default = "default_month_cache_ttl_secs")]
    pub month_cache_ttl_secs: u64,
    #[serde(default = "default_aggregate_cache_ttl_secs")]
    pub aggregate_cache_ttl_secs: u64,
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: i64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            entity_delay_ms: default_entity_delay_ms(),
            retention_days: default_retention_days(),
            epoch_start: default_epoch_start(),
            backfill_concurrency: default_backfill_concurrency(),
            month_cache_ttl_secs: default_month_cache_ttl_secs(),
            aggregate_cache_ttl_secs: default_aggregate_cache_ttl_secs(),
            max_staleness_secs: default_max_staleness_secs(),
        }
    }
}

/// One tracked firm or wallet
#[derive(Debug, Deserialize)]
pub struct EntitySection {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub addresses: Vec<String>,
}

fn default_network() -> String {
    "eth-mainnet".to_string()
}

fn default_page_delay_ms() -> u64 {
    constants::DEFAULT_PAGE_DELAY_MS
}

fn default_max_retries() -> u32 {
    constants::DEFAULT_MAX_RETRIES
}

fn default_request_timeout_secs() -> u64 {
    constants::DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_reference_block() -> u64 {
    constants::REFERENCE_BLOCK
}

fn default_reference_timestamp() -> i64 {
    constants::REFERENCE_BLOCK_TIMESTAMP
}

fn default_block_time_secs() -> f64 {
    constants::BLOCK_TIME_SECONDS
}

fn default_native_usd_price() -> f64 {
    constants::FALLBACK_NATIVE_USD_PRICE
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_entity_delay_ms() -> u64 {
    constants::DEFAULT_ENTITY_DELAY_MS
}

fn default_retention_days() -> i64 {
    constants::DEFAULT_RETENTION_DAYS
}

fn default_epoch_start() -> String {
    constants::DEFAULT_EPOCH_START.to_string()
}

fn default_backfill_concurrency() -> usize {
    constants::DEFAULT_BACKFILL_CONCURRENCY
}

fn default_month_cache_ttl_secs() -> u64 {
    constants::DEFAULT_MONTH_CACHE_TTL_SECS
}

fn default_aggregate_cache_ttl_secs() -> u64 {
    constants::DEFAULT_AGGREGATE_CACHE_TTL_SECS
}

fn default_max_staleness_secs() -> i64 {
    constants::DEFAULT_MAX_STALENESS_SECS
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| {
            "Failed to parse config.toml. Check for:\n\
             - Missing required fields ([explorer] section, entities[].id, entities[].addresses)\n\
             - Invalid TOML syntax (missing quotes, brackets, etc.)\n\
             - Incorrect data types (strings vs numbers)\n\n\
             See config.toml.example for the expected format."
        })
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// A tracked entity with validated addresses and time zone
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub name: String,
    /// Calendar used for day and month bucketing
    pub timezone: Tz,
    /// Lower-cased 0x addresses
    pub addresses: Vec<String>,
}

impl Entity {
    pub fn new(id: &str, timezone: Tz, addresses: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            timezone,
            addresses: addresses.iter().map(|a| a.to_ascii_lowercase()).collect(),
        }
    }

    /// Is `address` one of this entity's payout wallets?
    pub fn owns(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }
}

/// Explorer client settings
#[derive(Debug, Clone)]
pub struct ExplorerSettings {
    pub api_key: String,
    pub network: String,
    pub page_delay: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub clock: BlockClock,
}

impl ExplorerSettings {
    /// Endpoint URL including the API key
    pub fn endpoint(&self) -> String {
        format!(
            "{}{}",
            constants::EXPLORER_URL_TEMPLATE.replace("{network}", &self.network),
            self.api_key
        )
    }
}

/// Warm-cache retention as a duration; negative or overflowing day counts are rejected
pub fn retention_window(days: i64) -> Result<chrono::Duration> {
    match chrono::Duration::try_days(days) {
        Some(retention) if days >= 0 => Ok(retention),
        _ => bail!("retention_days out of range: {}", days),
    }
}

/// Main configuration struct with parsed values
#[derive(Debug, Clone)]
pub struct Config {
    pub explorer: ExplorerSettings,
    /// Fixed native asset valuation for this run
    pub native_usd_price: f64,
    pub live_native_price: bool,
    pub data_dir: PathBuf,
    pub entity_delay: Duration,
    pub retention: chrono::Duration,
    pub epoch_start: YearMonth,
    pub backfill_concurrency: usize,
    pub month_cache_ttl: Duration,
    pub aggregate_cache_ttl: Duration,
    pub max_staleness: chrono::Duration,
    pub entities: Vec<Entity>,
}

impl Config {
    /// Create config from file config; `env_api_key` fills an empty `explorer.api_key`
    pub fn from_file(file_config: &FileConfig, env_api_key: Option<String>) -> Result<Self> {
        let explorer = &file_config.explorer;

        let api_key = if explorer.api_key.trim().is_empty() {
            env_api_key.filter(|k| !k.trim().is_empty()).unwrap_or_default()
        } else {
            explorer.api_key.trim().to_string()
        };
        if api_key.is_empty() {
            bail!("Explorer API key missing: set explorer.api_key in config.toml or EXPLORER_API_KEY");
        }

        if explorer.block_time_secs <= 0.0 {
            bail!("explorer.block_time_secs must be positive");
        }

        let sync = &file_config.sync;
        let epoch_start: YearMonth = sync
            .epoch_start
            .parse()
            .with_context(|| "Invalid sync.epoch_start")?;

        let mut seen = HashSet::new();
        let mut entities = Vec::with_capacity(file_config.entities.len());
        for section in &file_config.entities {
            if !seen.insert(section.id.clone()) {
                bail!("Duplicate entity id '{}'", section.id);
            }
            entities.push(parse_entity(section)?);
        }

        let retention = retention_window(sync.retention_days)?;
        let max_staleness = match chrono::Duration::try_seconds(sync.max_staleness_secs) {
            Some(staleness) if sync.max_staleness_secs >= 0 => staleness,
            _ => bail!("sync.max_staleness_secs out of range: {}", sync.max_staleness_secs),
        };

        Ok(Self {
            explorer: ExplorerSettings {
                api_key,
                network: explorer.network.clone(),
                page_delay: Duration::from_millis(explorer.page_delay_ms),
                max_retries: explorer.max_retries.max(1),
                request_timeout: Duration::from_secs(explorer.request_timeout_secs),
                clock: BlockClock {
                    reference_block: explorer.reference_block,
                    reference_timestamp: explorer.reference_timestamp,
                    block_time_secs: explorer.block_time_secs,
                },
            },
            native_usd_price: file_config.valuation.native_usd_price,
            live_native_price: file_config.valuation.live_native_price,
            data_dir: file_config.storage.data_dir.clone(),
            entity_delay: Duration::from_millis(sync.entity_delay_ms),
            retention,
            epoch_start,
            backfill_concurrency: sync.backfill_concurrency.max(1),
            month_cache_ttl: Duration::from_secs(sync.month_cache_ttl_secs),
            aggregate_cache_ttl: Duration::from_secs(sync.aggregate_cache_ttl_secs),
            max_staleness,
            entities,
        })
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Entities matching the filter (all when the filter is empty)
    pub fn select_entities(&self, filter: &[String]) -> Result<Vec<&Entity>> {
        if filter.is_empty() {
            return Ok(self.entities.iter().collect());
        }
        filter
            .iter()
            .map(|id| self.entity(id).with_context(|| format!("Unknown entity '{}'", id)))
            .collect()
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(constants::SNAPSHOT_DIRNAME)
    }

    pub fn warm_cache_path(&self) -> PathBuf {
        self.data_dir.join(constants::WARM_CACHE_FILENAME)
    }
}

fn parse_entity(section: &EntitySection) -> Result<Entity> {
    if section.id.trim().is_empty() || section.id.contains(['/', '\\', '.']) {
        bail!("Invalid entity id '{}'", section.id);
    }
    let timezone: Tz = section
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid timezone '{}' for entity {}", section.timezone, section.id))?;

    if section.addresses.is_empty() {
        bail!("Entity {} has no addresses", section.id);
    }
    let mut addresses = Vec::with_capacity(section.addresses.len());
    for address in &section.addresses {
        if !is_valid_address(address) {
            bail!("Invalid address '{}' for entity {}", address, section.id);
        }
        let lower = address.to_ascii_lowercase();
        if !addresses.contains(&lower) {
            addresses.push(lower);
        }
    }

    Ok(Entity {
        id: section.id.clone(),
        name: section.name.clone().unwrap_or_else(|| section.id.clone()),
        timezone,
        addresses,
    })
}

/// 0x-prefixed, 20-byte hex address
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42
        && (address.starts_with("0x") || address.starts_with("0X"))
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Mask API keys in URLs for safe logging
pub fn mask_api_key(url: &str) -> String {
    if let Some(idx) = url.find("/v2/") {
        format!("{}****", &url[..idx + 4])
    } else if let Some(idx) = url.find("api-key=") {
        format!("{}****", &url[..idx + 8])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [explorer]
        api_key = "secret"

        [sync]
        epoch_start = "2024-06"

        [[entities]]
        id = "acme"
        name = "Acme Funding"
        timezone = "America/New_York"
        addresses = ["0xAbCdEf0123456789abcdef0123456789ABCDEF01", "0xabcdef0123456789abcdef0123456789abcdef01"]
    "#;

    #[test]
    fn loads_sample_with_defaults() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let config = Config::from_file(&file, None).unwrap();

        assert_eq!(config.explorer.api_key, "secret");
        assert_eq!(config.explorer.page_delay, Duration::from_millis(300));
        assert_eq!(config.epoch_start.to_string(), "2024-06");
        assert_eq!(config.retention, chrono::Duration::days(90));

        let acme = config.entity("acme").unwrap();
        assert_eq!(acme.name, "Acme Funding");
        assert_eq!(acme.timezone, chrono_tz::America::New_York);
        // Duplicate after lower-casing collapses
        assert_eq!(acme.addresses, vec!["0xabcdef0123456789abcdef0123456789abcdef01"]);
        assert!(acme.owns("0xABCDEF0123456789ABCDEF0123456789ABCDEF01"));
    }

    #[test]
    fn out_of_range_durations_are_config_errors() {
        let huge = SAMPLE.replace("epoch_start = \"2024-06\"", "epoch_start = \"2024-06\"\n        retention_days = 9223372036854775807");
        let err = Config::from_file(&FileConfig::parse(&huge).unwrap(), None).unwrap_err();
        assert!(err.to_string().contains("retention_days"));

        let negative = SAMPLE.replace("epoch_start = \"2024-06\"", "epoch_start = \"2024-06\"\n        max_staleness_secs = -1");
        let err = Config::from_file(&FileConfig::parse(&negative).unwrap(), None).unwrap_err();
        assert!(err.to_string().contains("max_staleness_secs"));

        assert!(retention_window(i64::MAX).is_err());
        assert_eq!(retention_window(30).unwrap(), chrono::Duration::days(30));
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let file = FileConfig::parse(&SAMPLE.replace("\"secret\"", "\"\"")).unwrap();
        let err = Config::from_file(&file, None).unwrap_err();
        assert!(err.to_string().contains("API key missing"));

        let config = Config::from_file(&file, Some("from-env".into())).unwrap();
        assert_eq!(config.explorer.api_key, "from-env");
    }

    #[test]
    fn rejects_bad_timezone_and_address() {
        let file = FileConfig::parse(&SAMPLE.replace("America/New_York", "Mars/Olympus")).unwrap();
        assert!(Config::from_file(&file, None).is_err());

        let file = FileConfig::parse(&SAMPLE.replace("0xAbCdEf0123456789abcdef0123456789ABCDEF01", "0x1234")).unwrap();
        assert!(Config::from_file(&file, None).is_err());
    }

    #[test]
    fn select_entities_rejects_unknown_ids() {
        let config = Config::from_file(&FileConfig::parse(SAMPLE).unwrap(), None).unwrap();
        assert_eq!(config.select_entities(&[]).unwrap().len(), 1);
        assert!(config.select_entities(&["nope".to_string()]).is_err());
    }

    #[test]
    fn masks_key_in_endpoint() {
        let config = Config::from_file(&FileConfig::parse(SAMPLE).unwrap(), None).unwrap();
        let endpoint = config.explorer.endpoint();
        assert_eq!(endpoint, "https://eth-mainnet.g.alchemy.com/v2/secret");
        assert_eq!(mask_api_key(&endpoint), "https://eth-mainnet.g.alchemy.com/v2/****");
    }
}
