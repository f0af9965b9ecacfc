//! Explorer transfer pagination
//!
//! Fetches outbound transfers for an address newest-first, one page at a
//! time. Pages are throttled by an explicit delay, failed requests are retried
//! with exponential backoff, and pagination stops early once a page reaches
//! past the window's cutoff. A final client-side filter re-applies the window
//! so a page straddling the boundary never leaks older transfers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{ExplorerSettings, mask_api_key};
use crate::constants;
use crate::error::ExplorerError;

// =============================================================================
// Block clock
// =============================================================================

/// Linear block-number ↔ time estimate anchored at a reference block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockClock {
    pub reference_block: u64,
    pub reference_timestamp: i64,
    pub block_time_secs: f64,
}

impl Default for BlockClock {
    fn default() -> Self {
        Self {
            reference_block: constants::REFERENCE_BLOCK,
            reference_timestamp: constants::REFERENCE_BLOCK_TIMESTAMP,
            block_time_secs: constants::BLOCK_TIME_SECONDS,
        }
    }
}

impl BlockClock {
    /// Approximate timestamp of `block`
    pub fn timestamp_of(&self, block: u64) -> Option<DateTime<Utc>> {
        let delta_blocks = block as i64 - self.reference_block as i64;
        let secs = self.reference_timestamp + (delta_blocks as f64 * self.block_time_secs).round() as i64;
        DateTime::from_timestamp(secs, 0)
    }

    /// Approximate block produced at `instant` (clamped at genesis)
    pub fn block_at(&self, instant: DateTime<Utc>) -> u64 {
        let delta_secs = (instant.timestamp() - self.reference_timestamp) as f64;
        let block = self.reference_block as f64 + delta_secs / self.block_time_secs;
        block.max(0.0).round() as u64
    }
}

// =============================================================================
// Transfers and pages
// =============================================================================

/// Kind of value moved by a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Chain's native asset (18 decimals)
    Native,
    /// ERC-20 style token
    Token,
    /// NFTs and anything else the explorer reports
    Other,
}

/// A transfer as returned by the explorer. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransfer {
    /// Lower-cased transaction hash
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub kind: TransferKind,
    pub symbol: Option<String>,
    /// Integer amount in the asset's smallest unit (hex or decimal string)
    pub raw_value: Option<String>,
    pub decimals: Option<u32>,
    /// Explorer's decoded amount, used when the raw value is missing
    pub value: Option<f64>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<DateTime<Utc>>,
}

impl RawTransfer {
    /// Metadata timestamp, else an estimate from the block number
    pub fn effective_timestamp(&self, clock: &BlockClock) -> Option<DateTime<Utc>> {
        self.block_timestamp
            .or_else(|| self.block_number.and_then(|b| clock.timestamp_of(b)))
    }
}

/// One page of transfers, newest first
#[derive(Debug, Clone, Default)]
pub struct TransferPage {
    pub transfers: Vec<RawTransfer>,
    pub next_cursor: Option<String>,
}

/// Half-open time window `[from, until)`; `from` doubles as the pagination cutoff
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferWindow {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TransferWindow {
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: None,
        }
    }

    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.from.is_some() || self.until.is_some()
    }

    pub fn contains(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = timestamp else {
            return !self.is_bounded();
        };
        self.from.is_none_or(|from| ts >= from) && self.until.is_none_or(|until| ts < until)
    }
}

/// Parameters of a single page request
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub address: &'a str,
    pub window: &'a TransferWindow,
    pub cursor: Option<&'a str>,
}

/// Anything that can serve transfer pages (the HTTP explorer, or a fixture)
#[async_trait]
pub trait TransferSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError>;
}

// =============================================================================
// Retry
// =============================================================================

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based; the first attempt has none)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.pow(attempt.min(16))
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ExplorerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExplorerError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            sleep(policy.delay_for_attempt(attempt)).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(attempt = attempt + 1, max_attempts = attempts, error = %e, "Explorer request failed, retrying");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(ExplorerError::RetriesExhausted {
        attempts,
        last: Box::new(last_error.unwrap_or_else(|| ExplorerError::Transport("no attempt made".into()))),
    })
}

// =============================================================================
// HTTP explorer client
// =============================================================================

/// JSON-RPC envelope
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<TransfersResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransfersResult {
    #[serde(default)]
    transfers: Vec<WireTransfer>,
    #[serde(default)]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransfer {
    hash: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    asset: Option<String>,
    category: String,
    #[serde(default)]
    block_num: Option<String>,
    #[serde(default)]
    raw_contract: Option<WireRawContract>,
    #[serde(default)]
    metadata: Option<WireMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireRawContract {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    decimal: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMetadata {
    #[serde(default)]
    block_timestamp: Option<String>,
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

impl From<WireTransfer> for RawTransfer {
    fn from(w: WireTransfer) -> Self {
        let kind = match w.category.as_str() {
            "external" | "internal" => TransferKind::Native,
            "erc20" => TransferKind::Token,
            _ => TransferKind::Other,
        };
        let (raw_value, decimals) = match w.raw_contract {
            Some(rc) => (rc.value, rc.decimal.as_deref().and_then(parse_hex_u64).map(|d| d as u32)),
            None => (None, None),
        };
        let block_timestamp = w
            .metadata
            .and_then(|m| m.block_timestamp)
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            hash: w.hash.to_ascii_lowercase(),
            from: w.from.to_ascii_lowercase(),
            to: w.to.map(|t| t.to_ascii_lowercase()),
            kind,
            symbol: w.asset,
            raw_value,
            decimals,
            value: w.value,
            block_number: w.block_num.as_deref().and_then(parse_hex_u64),
            block_timestamp,
        }
    }
}

/// HTTP client for the explorer's transfers API
pub struct ExplorerClient {
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
    clock: BlockClock,
}

impl ExplorerClient {
    pub fn new(settings: &ExplorerSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(settings.request_timeout).build()?;
        Ok(Self {
            http,
            endpoint: settings.endpoint(),
            retry: RetryPolicy {
                max_attempts: settings.max_retries,
                ..RetryPolicy::default()
            },
            clock: settings.clock,
        })
    }

    fn request_body(&self, request: &PageRequest<'_>) -> serde_json::Value {
        let padding = chrono::Duration::seconds(constants::BLOCK_RANGE_PADDING_SECONDS);
        let from_block = request
            .window
            .from
            .map(|from| format!("{:#x}", self.clock.block_at(from - padding)))
            .unwrap_or_else(|| "0x0".to_string());
        let to_block = request
            .window
            .until
            .map(|until| format!("{:#x}", self.clock.block_at(until + padding)))
            .unwrap_or_else(|| "latest".to_string());

        let mut params = json!({
            "fromAddress": request.address,
            "fromBlock": from_block,
            "toBlock": to_block,
            "category": ["external", "erc20"],
            "order": "desc",
            "withMetadata": true,
            "excludeZeroValue": true,
            "maxCount": constants::EXPLORER_PAGE_SIZE_HEX,
        });
        if let Some(cursor) = request.cursor {
            params["pageKey"] = json!(cursor);
        }

        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": constants::EXPLORER_TRANSFERS_METHOD,
            "params": [params],
        })
    }

    async fn request_page(&self, request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExplorerError::RateLimited);
        }
        if !status.is_success() {
            return Err(ExplorerError::Http { status: status.as_u16() });
        }

        let text = response.text().await?;
        parse_page(&text)
    }
}

fn parse_page(text: &str) -> Result<TransferPage, ExplorerError> {
    let body: RpcResponse = serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(100).collect();
        ExplorerError::Decode(format!("{} (response: {})", e, preview))
    })?;

    if let Some(err) = body.error {
        return Err(ExplorerError::Api {
            code: err.code,
            message: err.message,
        });
    }
    let result = body
        .result
        .ok_or_else(|| ExplorerError::Decode("response has neither result nor error".into()))?;

    Ok(TransferPage {
        transfers: result.transfers.into_iter().map(RawTransfer::from).collect(),
        next_cursor: result.page_key.filter(|k| !k.is_empty()),
    })
}

#[async_trait]
impl TransferSource for ExplorerClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
        debug!(
            endpoint = %mask_api_key(&self.endpoint),
            address = request.address,
            cursor = request.cursor.unwrap_or("-"),
            "Requesting transfer page"
        );
        with_retry(self.retry, || self.request_page(request)).await
    }
}

// =============================================================================
// Fetch-all
// =============================================================================

/// Pagination behaviour shared by every fetch-all call
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Delay between consecutive requests
    pub page_delay: Duration,
    pub clock: BlockClock,
}

impl Pagination {
    pub fn from_settings(settings: &ExplorerSettings) -> Self {
        Self {
            page_delay: settings.page_delay,
            clock: settings.clock,
        }
    }
}

/// Fetch every transfer for `address` inside `window`, newest first.
pub async fn fetch_all<S: TransferSource + ?Sized>(
    source: &S,
    address: &str,
    window: &TransferWindow,
    pagination: &Pagination,
) -> Result<Vec<RawTransfer>, ExplorerError> {
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        if pages > 0 && !pagination.page_delay.is_zero() {
            sleep(pagination.page_delay).await;
        }

        let page = source
            .fetch_page(&PageRequest {
                address,
                window,
                cursor: cursor.as_deref(),
            })
            .await?;
        pages += 1;

        // Pages are newest-first, so once the oldest entry predates the cutoff
        // no later page can contain anything inside the window.
        let oldest = page
            .transfers
            .iter()
            .filter_map(|t| t.effective_timestamp(&pagination.clock))
            .min();
        let crossed_cutoff = matches!((window.from, oldest), (Some(cutoff), Some(oldest)) if oldest < cutoff);

        all.extend(page.transfers);

        match page.next_cursor {
            Some(next) if !crossed_cutoff => {
                if cursor.as_deref() == Some(next.as_str()) {
                    warn!(address, cursor = %next, "Explorer repeated a page cursor, stopping");
                    break;
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    let fetched = all.len();
    all.retain(|t| window.contains(t.effective_timestamp(&pagination.clock)));
    debug!(address, pages, fetched, kept = all.len(), "Fetched transfers");

    Ok(all)
}

/// Transfers for every address of an entity, with per-address failures kept apart
#[derive(Debug, Default)]
pub struct EntityFetch {
    /// Deduplicated by transaction hash
    pub transfers: Vec<RawTransfer>,
    /// (address, error) for addresses whose fetch failed
    pub failures: Vec<(String, ExplorerError)>,
}

impl EntityFetch {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Summary of failures for logs and `sync_error`
    pub fn failure_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|(address, e)| format!("{}: {}", address, e))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Fetch all addresses sequentially; a failing address never blocks the others.
pub async fn fetch_entity<S: TransferSource + ?Sized>(
    source: &S,
    addresses: &[String],
    window: &TransferWindow,
    pagination: &Pagination,
) -> EntityFetch {
    let mut result = EntityFetch::default();
    let mut seen = HashSet::new();

    for (i, address) in addresses.iter().enumerate() {
        if i > 0 && !pagination.page_delay.is_zero() {
            sleep(pagination.page_delay).await;
        }

        match fetch_all(source, address, window, pagination).await {
            Ok(transfers) => {
                for transfer in transfers {
                    if seen.insert(transfer.hash.clone()) {
                        result.transfers.push(transfer);
                    }
                }
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to fetch transfers for address");
                result.failures.push((address.clone(), e));
            }
        }
    }

    result
}
