//! Supported payout assets
//!
//! The asset table is closed: anything not listed maps to
//! [`Token::Unsupported`] and is dropped by the normalizer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::NATIVE_DECIMALS;
use crate::explorer::{RawTransfer, TransferKind};

/// How a payout reached the trader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Paid through the Rise payroll token
    Rise,
    /// Stablecoin or native asset sent on-chain
    Crypto,
    /// Bank wire (recorded off-chain)
    Wire,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 3] = [PaymentMethod::Rise, PaymentMethod::Crypto, PaymentMethod::Wire];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Rise => "rise",
            PaymentMethod::Crypto => "crypto",
            PaymentMethod::Wire => "wire",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a token's USD amount is derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Valuation {
    /// Pegged 1:1 to USD
    Stable,
    /// Native asset at the run's fixed price
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Usdc,
    Usdt,
    Dai,
    RisePay,
    Eth,
    Unsupported,
}

impl Token {
    /// Classify a transfer; native transfers are always [`Token::Eth`]
    pub fn of(transfer: &RawTransfer) -> Token {
        match transfer.kind {
            TransferKind::Native => Token::Eth,
            TransferKind::Token => transfer.symbol.as_deref().map(Token::from_symbol).unwrap_or(Token::Unsupported),
            TransferKind::Other => Token::Unsupported,
        }
    }

    pub fn from_symbol(symbol: &str) -> Token {
        match symbol.trim().to_ascii_uppercase().as_str() {
            "USDC" => Token::Usdc,
            "USDT" => Token::Usdt,
            "DAI" => Token::Dai,
            "RISEPAY" => Token::RisePay,
            _ => Token::Unsupported,
        }
    }

    /// Payment method, or `None` for unsupported assets
    pub fn payment_method(&self) -> Option<PaymentMethod> {
        match self {
            Token::RisePay => Some(PaymentMethod::Rise),
            Token::Usdc | Token::Usdt | Token::Dai | Token::Eth => Some(PaymentMethod::Crypto),
            Token::Unsupported => None,
        }
    }

    pub fn valuation(&self) -> Option<Valuation> {
        match self {
            Token::Usdc | Token::Usdt | Token::Dai | Token::RisePay => Some(Valuation::Stable),
            Token::Eth => Some(Valuation::Native),
            Token::Unsupported => None,
        }
    }

    /// Decimals used when the explorer omits them
    pub fn default_decimals(&self) -> Option<u32> {
        match self {
            Token::Usdc | Token::Usdt | Token::RisePay => Some(6),
            Token::Dai => Some(18),
            Token::Eth => Some(NATIVE_DECIMALS),
            Token::Unsupported => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_closed() {
        assert_eq!(Token::from_symbol("usdc"), Token::Usdc);
        assert_eq!(Token::from_symbol("RISEPAY"), Token::RisePay);
        assert_eq!(Token::from_symbol("PEPE"), Token::Unsupported);
        assert_eq!(Token::Unsupported.payment_method(), None);
        assert_eq!(Token::Unsupported.valuation(), None);
    }

    #[test]
    fn methods() {
        assert_eq!(Token::RisePay.payment_method(), Some(PaymentMethod::Rise));
        assert_eq!(Token::Eth.payment_method(), Some(PaymentMethod::Crypto));
        assert_eq!(Token::Eth.valuation(), Some(Valuation::Native));
        assert_eq!(serde_json::to_string(&PaymentMethod::Wire).unwrap(), "\"wire\"");
    }
}
