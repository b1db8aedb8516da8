//! Normalized ticker snapshot shared by every producer and consumer.

use crate::pair::{pair_key, Pair};
use serde::{Deserialize, Serialize};

/// Canonical 24h market snapshot for one currency pair.
///
/// Exchange adapters build it once from their own wire format; after that it
/// is only cloned and moved through channels, never mutated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TickerData {
    /// Storage id, 0 until persisted.
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "from_sym")]
    pub from_symbol: String,
    #[serde(rename = "to_sym")]
    pub to_symbol: String,
    pub change_24_hour: f64,
    pub change_pct_24_hour: f64,
    pub open_24_hour: f64,
    pub volume_24_hour: f64,
    pub low_24_hour: f64,
    pub high_24_hour: f64,
    pub price: f64,
    pub supply: f64,
    pub mkt_cap: f64,
    /// Last update, epoch milliseconds.
    pub last_update: i64,
    /// Adapter-specific display payload, kept verbatim.
    #[serde(default)]
    pub display_data_raw: String,
}

impl TickerData {
    /// Empty snapshot for a pair (symbols upper-cased).
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from_symbol: from.to_uppercase(),
            to_symbol: to.to_uppercase(),
            ..Default::default()
        }
    }

    /// Subscription key this record is routed by.
    pub fn key(&self) -> String {
        pair_key(&self.from_symbol, &self.to_symbol)
    }

    /// The pair this record describes.
    pub fn pair(&self) -> Pair {
        Pair::new(&self.from_symbol, &self.to_symbol)
    }

    /// Copy of this record carrying a storage id.
    pub fn with_id(&self, id: i64) -> Self {
        Self { id, ..self.clone() }
    }
}
