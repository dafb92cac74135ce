//! Currency codes for Warden
//!
//! Covers ISO 4217 fiat codes as well as on-chain asset tickers. Amounts
//! never carry their currency; ledger entries, policies and journeys store
//! the code next to the amount.

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest accepted currency code (covers tickers such as `USDC` or `MATIC`)
pub const MAX_CURRENCY_CODE_LEN: usize = 10;

/// An upper-case currency or asset code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Validate and normalize a currency code
    pub fn new(code: impl AsRef<str>) -> Result<Self> {
        let code = code.as_ref().trim().to_ascii_uppercase();
        if code.len() < 3 || code.len() > MAX_CURRENCY_CODE_LEN {
            return Err(WardenError::invalid_input(
                "currency",
                format!("code must be 3 to {} characters", MAX_CURRENCY_CODE_LEN),
            ));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(WardenError::invalid_input(
                "currency",
                "code must be alphanumeric",
            ));
        }
        Ok(Self(code))
    }

    /// US dollar
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// Euro
    pub fn eur() -> Self {
        Self("EUR".to_string())
    }

    /// USD Coin
    pub fn usdc() -> Self {
        Self("USDC".to_string())
    }

    /// The code as a string slice
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}
