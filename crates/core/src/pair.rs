//! Currency pair identifiers and key derivation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build the normalized lookup key for a currency pair ("BTC:USDT").
///
/// Both symbols are upper-cased, so `pair_key("btc", "usdt")` and
/// `pair_key("BTC", "USDT")` address the same entry.
pub fn pair_key(from: &str, to: &str) -> String {
    format!("{}:{}", from.to_uppercase(), to.to_uppercase())
}

/// Split a pair key back into its symbols.
///
/// Returns `None` unless the key has exactly two non-empty parts.
pub fn split_pair_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(from), Some(to), None) if !from.is_empty() && !to.is_empty() => {
            Some((from.to_uppercase(), to.to_uppercase()))
        }
        _ => None,
    }
}

/// A currency pair as it appears on the wire (`{"fsym": "BTC", "tsym": "USDT"}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pair {
    #[serde(rename = "fsym")]
    pub from: String,
    #[serde(rename = "tsym")]
    pub to: String,
}

impl Pair {
    /// Create a pair with upper-cased symbols.
    pub fn new(from: impl AsRef<str>, to: impl AsRef<str>) -> Self {
        Self {
            from: from.as_ref().to_uppercase(),
            to: to.as_ref().to_uppercase(),
        }
    }

    /// Return the same pair with upper-cased symbols.
    pub fn normalized(&self) -> Self {
        Self::new(&self.from, &self.to)
    }

    /// Subscription key for this pair.
    pub fn key(&self) -> String {
        pair_key(&self.from, &self.to)
    }

    /// True when either symbol is blank.
    pub fn is_empty(&self) -> bool {
        self.from.trim().is_empty() || self.to.trim().is_empty()
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}
