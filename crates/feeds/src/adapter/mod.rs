//! Exchange adapters.
//!
//! Each adapter implements [`crate::RestClient`] and/or
//! [`crate::UpstreamProtocol`] for one data provider.

pub mod cryptocompare;
pub mod kraken;

pub use cryptocompare::{CryptoCompareRest, CryptoCompareWs};
pub use kraken::{KrakenRest, KrakenWs};

/// Compact raw snapshot kept in `TickerData::display_data_raw`.
pub(crate) fn display_blob(from: &str, to: &str, fields: &[(&str, f64)], last_update: i64) -> String {
    let mut blob = serde_json::Map::new();
    blob.insert("FROMSYMBOL".into(), from.into());
    blob.insert("TOSYMBOL".into(), to.into());
    for (name, value) in fields {
        blob.insert((*name).into(), (*value).into());
    }
    blob.insert("LASTUPDATE".into(), last_update.into());
    serde_json::Value::Object(blob).to_string()
}
