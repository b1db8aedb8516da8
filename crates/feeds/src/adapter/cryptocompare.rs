//! CryptoCompare REST and streaming adapters.

use super::display_blob;
use crate::heartbeat::{Heartbeat, HEARTBEAT_CHECK_INTERVAL};
use crate::{FeedError, Message, RestClient, UpstreamConnection, UpstreamProtocol};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use ticker_core::TickerData;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

pub const REST_API_URL: &str = "https://min-api.cryptocompare.com";
pub const WS_API_URL: &str = "wss://streamer.cryptocompare.com/v2";

/// Full ticker data for multiple symbols.
const MULTIPLE_SYMBOLS_FULL_DATA: &str = "/data/pricemultifull";

const TYPE_TICKER: &str = "5";
const TYPE_HEARTBEAT: &str = "999";

/// Streaming URL with the API key attached.
pub fn ws_url(api_key: &str) -> Result<String, FeedError> {
    Ok(Url::parse_with_params(WS_API_URL, &[("api_key", api_key)])?.to_string())
}

#[derive(Debug, Default, Deserialize)]
struct MultiFullResponse {
    #[serde(rename = "RAW", default)]
    raw: HashMap<String, HashMap<String, RawTicker>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE", default)]
struct RawTicker {
    change24hour: f64,
    changepct24hour: f64,
    open24hour: f64,
    volume24hour: f64,
    volume24hourto: f64,
    low24hour: f64,
    high24hour: f64,
    price: f64,
    supply: f64,
    mktcap: f64,
    lastupdate: i64,
}

fn convert_rest(from: &str, to: &str, response: &MultiFullResponse) -> Result<TickerData, FeedError> {
    let raw = response
        .raw
        .get(from)
        .and_then(|quotes| quotes.get(to))
        .ok_or_else(|| FeedError::ParseError(format!("no data for {}/{}", from, to)))?;

    Ok(TickerData {
        change_24_hour: raw.change24hour,
        change_pct_24_hour: raw.changepct24hour,
        open_24_hour: raw.open24hour,
        volume_24_hour: raw.volume24hour,
        low_24_hour: raw.low24hour,
        high_24_hour: raw.high24hour,
        price: raw.price,
        supply: raw.supply,
        mkt_cap: raw.mktcap,
        last_update: raw.lastupdate * 1000,
        display_data_raw: display_blob(
            from,
            to,
            &[
                ("OPEN24HOUR", raw.open24hour),
                ("VOLUME24HOUR", raw.volume24hour),
                ("VOLUME24HOURTO", raw.volume24hourto),
                ("HIGH24HOUR", raw.high24hour),
                ("PRICE", raw.price),
                ("SUPPLY", raw.supply),
                ("MKTCAP", raw.mktcap),
            ],
            raw.lastupdate,
        ),
        ..TickerData::new(from, to)
    })
}

/// `pricemultifull` REST client.
pub struct CryptoCompareRest {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CryptoCompareRest {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, FeedError> {
        Self::with_base_url(REST_API_URL, api_key, timeout)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn build_url(&self, from: &str, to: &str) -> Result<Url, FeedError> {
        let url = Url::parse_with_params(
            &format!("{}{}", self.base_url, MULTIPLE_SYMBOLS_FULL_DATA),
            &[("fsyms", from), ("tsyms", to), ("api_key", self.api_key.as_str())],
        )?;
        Ok(url)
    }
}

#[async_trait]
impl RestClient for CryptoCompareRest {
    async fn get(&self, from: &str, to: &str) -> Result<TickerData, FeedError> {
        let (from, to) = (from.to_uppercase(), to.to_uppercase());
        let response = self.client.get(self.build_url(&from, &to)?).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::Rest(format!("HTTP {} for {}/{}", response.status(), from, to)));
        }

        let body: MultiFullResponse = response.json().await?;
        convert_rest(&from, &to, &body)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE", default)]
struct StreamFrame {
    #[serde(rename = "TYPE")]
    kind: String,
    message: String,
    fromsymbol: String,
    tosymbol: String,
    price: f64,
    lastupdate: i64,
    volume24hour: f64,
    volume24hourto: f64,
    open24hour: f64,
    high24hour: f64,
    low24hour: f64,
    currentsupply: f64,
    currentsupplymktcap: f64,
}

#[derive(Debug, PartialEq)]
enum Decoded {
    Heartbeat,
    Ticker(TickerData),
    /// Any other frame type, with its message if present.
    Other(String, String),
}

fn decode_frame(text: &str) -> Result<Decoded, FeedError> {
    let frame: StreamFrame = serde_json::from_str(text)?;
    match frame.kind.as_str() {
        TYPE_HEARTBEAT => Ok(Decoded::Heartbeat),
        TYPE_TICKER => Ok(Decoded::Ticker(TickerData {
            open_24_hour: frame.open24hour,
            volume_24_hour: frame.volume24hour,
            low_24_hour: frame.low24hour,
            high_24_hour: frame.high24hour,
            price: frame.price,
            supply: frame.currentsupply,
            mkt_cap: frame.currentsupplymktcap,
            last_update: frame.lastupdate * 1000,
            display_data_raw: display_blob(
                &frame.fromsymbol,
                &frame.tosymbol,
                &[
                    ("OPEN24HOUR", frame.open24hour),
                    ("VOLUME24HOUR", frame.volume24hour),
                    ("VOLUME24HOURTO", frame.volume24hourto),
                    ("HIGH24HOUR", frame.high24hour),
                    ("PRICE", frame.price),
                    ("SUPPLY", frame.currentsupply),
                    ("MKTCAP", frame.currentsupplymktcap),
                ],
                frame.lastupdate,
            ),
            ..TickerData::new(&frame.fromsymbol, &frame.tosymbol)
        })),
        _ => Ok(Decoded::Other(frame.kind, frame.message)),
    }
}

/// Streaming protocol for `streamer.cryptocompare.com`.
///
/// The server sends a heartbeat frame (type 999) every 30 seconds; two
/// missed checks trigger a reconnect.
pub struct CryptoCompareWs {
    heartbeat_interval: Duration,
}

impl CryptoCompareWs {
    pub fn new() -> Self {
        Self::with_heartbeat_interval(HEARTBEAT_CHECK_INTERVAL)
    }

    pub fn with_heartbeat_interval(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

impl Default for CryptoCompareWs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamProtocol for CryptoCompareWs {
    fn channel_name(&self, from: &str, to: &str) -> String {
        format!("5~CCCAGG~{}~{}", from.to_uppercase(), to.to_uppercase())
    }

    fn subscribe_message(&self, channel: &str, _id: i64) -> Result<Message, FeedError> {
        let frame = serde_json::json!({ "action": "SubAdd", "subs": [channel] });
        Ok(Message::Text(frame.to_string()))
    }

    fn unsubscribe_message(&self, channel: &str, _id: i64) -> Result<Message, FeedError> {
        let frame = serde_json::json!({ "action": "SubRemove", "subs": [channel] });
        Ok(Message::Text(frame.to_string()))
    }

    async fn handle_messages(&self, conn: UpstreamConnection, cancel: CancellationToken) {
        let mut heartbeat = Heartbeat::new();
        let mut check = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = check.tick() => {
                    heartbeat.decrease();
                    if heartbeat.is_lost() {
                        if let Err(e) = conn.recover(FeedError::HeartbeatLost).await {
                            error!("CryptoCompare: stream stopped: {}", e);
                            return;
                        }
                        heartbeat.reset();
                        check.reset();
                    }
                }
                frame = conn.read() => match frame {
                    Ok(Message::Text(text)) => match decode_frame(&text) {
                        Ok(Decoded::Heartbeat) => heartbeat.reset(),
                        Ok(Decoded::Ticker(data)) => {
                            if conn.publish(data).await.is_err() {
                                return;
                            }
                        }
                        Ok(Decoded::Other(kind, message)) => match kind.as_str() {
                            "401" | "429" | "500" => warn!("CryptoCompare: {} {}", kind, message),
                            _ => debug!("CryptoCompare: {} {}", kind, message),
                        },
                        Err(e) => warn!("CryptoCompare: {}", e),
                    },
                    Ok(_) => {}
                    Err(FeedError::Cancelled) => return,
                    Err(e) => {
                        if let Err(e) = conn.recover(e).await {
                            error!("CryptoCompare: stream stopped: {}", e);
                            return;
                        }
                        heartbeat.reset();
                        check.reset();
                    }
                },
            }
        }
    }
}
