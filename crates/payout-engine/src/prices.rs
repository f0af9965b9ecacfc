//! Native asset USD price (CoinGecko → Binance → configured price)
//!
//! The price is looked up at most once per run, so every native transfer in
//! that run is valued the same way.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::constants;

/// CoinGecko simple price response
#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    ethereum: Option<UsdPrice>,
}

#[derive(Debug, Deserialize)]
struct UsdPrice {
    usd: f64,
}

/// Binance ticker response: {"symbol":"ETHUSDT","price":"3120.55000000"}
#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: String,
}

/// Price for this run: live when enabled and reachable, else `configured`
pub async fn native_usd_price(configured: f64, live: bool) -> f64 {
    if !live {
        return configured;
    }

    match fetch_current_price().await {
        Ok(price) => {
            info!(price, "Using live native asset price");
            price
        }
        Err(e) => {
            warn!(error = %e, fallback = configured, "Live price unavailable, using configured price");
            configured
        }
    }
}

/// Current ETH price: CoinGecko first, Binance as fallback
pub async fn fetch_current_price() -> Result<f64> {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
    match fetch_current_price_coingecko(&client).await {
        Ok(price) => Ok(price),
        Err(e) => {
            warn!(error = %e, "CoinGecko price failed, trying Binance");
            fetch_current_price_binance(&client).await
        }
    }
}

async fn fetch_current_price_coingecko(client: &reqwest::Client) -> Result<f64> {
    let url = format!("{}{}", constants::COINGECKO_API_BASE, constants::COINGECKO_SIMPLE_PRICE);

    let max_retries = 3;
    let mut last_error = None;

    for attempt in 0..max_retries {
        if attempt > 0 {
            sleep(Duration::from_secs(2u64.pow(attempt))).await;
        }

        match client.get(&url).header("Accept", "application/json").send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await?;
                return parse_coingecko(&body);
            }
            Ok(response) if response.status().as_u16() == 429 => {
                last_error = Some(anyhow::anyhow!("Rate limited (429)"));
            }
            Ok(response) => {
                last_error = Some(anyhow::anyhow!("API returned status: {}", response.status()));
            }
            Err(e) => {
                last_error = Some(anyhow::anyhow!("Request failed: {}", e));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Failed after {} retries", max_retries)))
}

async fn fetch_current_price_binance(client: &reqwest::Client) -> Result<f64> {
    let url = format!("{}{}", constants::BINANCE_API_BASE, constants::BINANCE_TICKER);
    let response = client.get(&url).header("Accept", "application/json").send().await?;

    if !response.status().is_success() {
        anyhow::bail!("Binance ticker returned status: {}", response.status());
    }
    parse_binance(&response.text().await?)
}

fn parse_coingecko(body: &str) -> Result<f64> {
    let data: SimplePriceResponse = serde_json::from_str(body)?;
    data.ethereum
        .map(|p| p.usd)
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| anyhow::anyhow!("No ETH price in response"))
}

fn parse_binance(body: &str) -> Result<f64> {
    let data: TickerResponse = serde_json::from_str(body)?;
    data.price
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| anyhow::anyhow!("No price in Binance response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_payloads() {
        assert_eq!(parse_coingecko(r#"{"ethereum":{"usd":3120.5}}"#).unwrap(), 3120.5);
        assert!(parse_coingecko(r#"{"bitcoin":{"usd":1.0}}"#).is_err());
        assert_eq!(parse_binance(r#"{"symbol":"ETHUSDT","price":"3120.55000000"}"#).unwrap(), 3120.55);
        assert!(parse_binance(r#"{"symbol":"ETHUSDT","price":"n/a"}"#).is_err());
    }

    #[tokio::test]
    async fn configured_price_when_live_disabled() {
        assert_eq!(native_usd_price(2500.0, false).await, 2500.0);
    }
}
