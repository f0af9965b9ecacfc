//! Centralized constants for the payout tracker
//!
//! Universal values that apply to every tracked entity. Entity-specific
//! configuration is loaded from config.toml.

// =============================================================================
// API Endpoints
// =============================================================================

/// Explorer JSON-RPC base URL template (`{network}` is substituted, API key appended)
pub const EXPLORER_URL_TEMPLATE: &str = "https://{network}.g.alchemy.com/v2/";

/// Explorer method returning paginated transfers for an address
pub const EXPLORER_TRANSFERS_METHOD: &str = "alchemy_getAssetTransfers";

/// Maximum transfers requested per page (hex-encoded as the API expects)
pub const EXPLORER_PAGE_SIZE_HEX: &str = "0x3e8";

/// CoinGecko API base URL
pub const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko current ETH price endpoint
pub const COINGECKO_SIMPLE_PRICE: &str = "/simple/price?ids=ethereum&vs_currencies=usd";

/// Binance API base URL (no key required)
pub const BINANCE_API_BASE: &str = "https://api.binance.com/api/v3";

/// Binance current ETH price endpoint
pub const BINANCE_TICKER: &str = "/ticker/price?symbol=ETHUSDT";

// =============================================================================
// Payout Rules
// =============================================================================

/// Minimum USD value for a transfer to count as a payout
pub const SPAM_THRESHOLD_USD: f64 = 10.0;

/// Decimals of the chain's native asset
pub const NATIVE_DECIMALS: u32 = 18;

/// Fallback native asset price when neither config nor price APIs provide one
pub const FALLBACK_NATIVE_USD_PRICE: f64 = 2500.0;

/// Transactions kept on a 12-month aggregate (newest first)
pub const YEAR_TRANSACTION_LIMIT: usize = 100;

// =============================================================================
// Block Clock Calibration (Ethereum mainnet)
// Reference point for converting block numbers to approximate timestamps
// =============================================================================

/// Reference block for timestamp estimation
pub const REFERENCE_BLOCK: u64 = 19_000_000;

/// Unix timestamp of the reference block (2024-01-13 UTC, approximate)
pub const REFERENCE_BLOCK_TIMESTAMP: i64 = 1_705_173_443;

/// Average block time in seconds
pub const BLOCK_TIME_SECONDS: f64 = 12.0;

/// Padding applied to estimated block ranges so estimation drift never cuts a window short
pub const BLOCK_RANGE_PADDING_SECONDS: i64 = 86_400;

// =============================================================================
// Defaults
// =============================================================================

/// Delay between explorer pages
pub const DEFAULT_PAGE_DELAY_MS: u64 = 300;

/// Retry attempts for one explorer page
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Delay between entities during batch sync (~5 req/s explorer budget)
pub const DEFAULT_ENTITY_DELAY_MS: u64 = 1000;

/// Orphaned warm-cache rows older than this are deleted
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// First month backfill ever considers
pub const DEFAULT_EPOCH_START: &str = "2024-01";

/// Parallel month builds during backfill
pub const DEFAULT_BACKFILL_CONCURRENCY: usize = 2;

/// Snapshot loader cache TTL
pub const DEFAULT_MONTH_CACHE_TTL_SECS: u64 = 300;

/// Ephemeral aggregate cache TTL
pub const DEFAULT_AGGREGATE_CACHE_TTL_SECS: u64 = 3600;

/// Oldest data a sourcing tier may serve
pub const DEFAULT_MAX_STALENESS_SECS: i64 = 6 * 3600;

/// Window fetched live by the warm-cache reconciler
pub const WARM_WINDOW_DAYS: i64 = 30;

// =============================================================================
// File Names
// =============================================================================

/// Snapshot directory under the data dir
pub const SNAPSHOT_DIRNAME: &str = "snapshots";

/// Warm cache database filename
pub const WARM_CACHE_FILENAME: &str = "warm_cache.sqlite";

/// Default config file path
pub const CONFIG_FILENAME: &str = "config.toml";
