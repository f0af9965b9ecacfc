//! Raw transfer → canonical payout

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::trace;

use crate::config::Entity;
use crate::constants::SPAM_THRESHOLD_USD;
use crate::explorer::{BlockClock, RawTransfer};
use crate::tokens::{PaymentMethod, Token, Valuation};

/// Canonical payout. `tx_hash` is unique per entity across every tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub tx_hash: String,
    pub entity_id: String,
    pub amount_usd: f64,
    pub payment_method: PaymentMethod,
    pub timestamp: DateTime<Utc>,
    pub from_address: String,
    #[serde(default)]
    pub to_address: Option<String>,
}

/// Why a transfer was not turned into a payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    Inbound,
    UnsupportedToken,
    BadAmount,
    BelowThreshold,
    NoTimestamp,
}

/// Converts transfers using a valuation fixed for the whole run
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub native_usd_price: f64,
    pub clock: BlockClock,
}

impl Normalizer {
    pub fn new(native_usd_price: f64, clock: BlockClock) -> Self {
        Self { native_usd_price, clock }
    }

    pub fn normalize(&self, transfer: &RawTransfer, entity: &Entity) -> Option<Payout> {
        match self.classify(transfer, entity) {
            Ok(payout) => Some(payout),
            Err(reason) => {
                trace!(hash = %transfer.hash, ?reason, "Dropped transfer");
                None
            }
        }
    }

    /// Normalize a batch, keeping the first occurrence of each hash
    pub fn normalize_all(&self, transfers: &[RawTransfer], entity: &Entity) -> Vec<Payout> {
        let mut seen = HashSet::new();
        transfers
            .iter()
            .filter_map(|t| self.normalize(t, entity))
            .filter(|p| seen.insert(p.tx_hash.clone()))
            .collect()
    }

    fn classify(&self, transfer: &RawTransfer, entity: &Entity) -> Result<Payout, Dropped> {
        if !entity.owns(&transfer.from) {
            return Err(Dropped::Inbound);
        }

        let token = Token::of(transfer);
        let (Some(method), Some(valuation)) = (token.payment_method(), token.valuation()) else {
            return Err(Dropped::UnsupportedToken);
        };

        let units = token_amount(transfer, token).ok_or(Dropped::BadAmount)?;
        let amount_usd = match valuation {
            Valuation::Stable => units,
            Valuation::Native => units * self.native_usd_price,
        };
        if !amount_usd.is_finite() || amount_usd < SPAM_THRESHOLD_USD {
            return Err(Dropped::BelowThreshold);
        }

        let timestamp = transfer.effective_timestamp(&self.clock).ok_or(Dropped::NoTimestamp)?;

        Ok(Payout {
            tx_hash: transfer.hash.to_ascii_lowercase(),
            entity_id: entity.id.clone(),
            amount_usd,
            payment_method: method,
            timestamp,
            from_address: transfer.from.to_ascii_lowercase(),
            to_address: transfer.to.as_ref().map(|t| t.to_ascii_lowercase()),
        })
    }
}

/// Amount in whole token units, scaled from the raw integer value
fn token_amount(transfer: &RawTransfer, token: Token) -> Option<f64> {
    let decimals = transfer.decimals.or_else(|| token.default_decimals())?;

    match transfer.raw_value.as_deref().and_then(parse_raw_value) {
        Some(raw) => Some(raw as f64 / 10f64.powi(decimals as i32)),
        None => transfer.value.filter(|v| v.is_finite() && *v >= 0.0),
    }
}

/// Hex (`0x`-prefixed) or decimal integer string
fn parse_raw_value(value: &str) -> Option<u128> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some("") => Some(0),
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
