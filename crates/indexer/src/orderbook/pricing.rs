//! Price derivation from raw wei amounts.
//!
//! Orders quote raw `uint256` amounts in an arbitrary pay token. The
//! formatter turns those into the three denominations stored on order
//! items and activity rows: display units of the pay token, USD, and
//! the chain's native coin.

use alloy::primitives::{Address, U256};
use std::collections::HashMap;

use crate::config::PayTokenConfig;

/// One raw price expressed in every stored denomination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    /// Whole display units of the pay token, e.g. 1.5 WETH.
    pub display: f64,
    /// USD equivalent at the configured rate.
    pub in_usd: f64,
    /// Native-coin equivalent at the configured rate.
    pub in_native: f64,
}

/// Converts raw order prices using the configured pay-token table.
///
/// Rates are read-only after boot; an external rate feed would replace
/// the whole config on restart.
#[derive(Debug, Clone)]
pub struct PriceFormatter {
    tokens: HashMap<Address, PayTokenConfig>,
}

impl PriceFormatter {
    /// Build a formatter from the configured pay tokens.
    pub fn new(pay_tokens: &[PayTokenConfig]) -> Self {
        let tokens = pay_tokens
            .iter()
            .map(|token| (token.address, token.clone()))
            .collect();
        Self { tokens }
    }

    /// Look up a pay token; `None` means the currency is not accepted.
    pub fn pay_token(&self, currency: &Address) -> Option<&PayTokenConfig> {
        self.tokens.get(currency)
    }

    /// Convert a raw wei amount in `currency` to all denominations.
    ///
    /// Returns `None` for unknown currencies. Precision beyond `f64`
    /// is intentionally dropped; raw amounts are stored alongside.
    pub fn quote(&self, currency: &Address, raw: &U256) -> Option<PriceQuote> {
        let token = self.tokens.get(currency)?;
        let units: f64 = raw.to_string().parse().unwrap_or(0.0);
        let display = units / 10f64.powi(token.decimals as i32);
        Some(PriceQuote {
            display,
            in_usd: display * token.usd_rate,
            in_native: display * token.native_rate,
        })
    }
}
