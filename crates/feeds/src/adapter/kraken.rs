//! Kraken public REST and v2 streaming adapters.
//!
//! Neither endpoint needs an API key. The streaming feed reports the pair as
//! `FROM/TO` and sends a `heartbeat` channel frame about once a second while
//! subscribed.

use super::display_blob;
use crate::heartbeat::Heartbeat;
use crate::{FeedError, Message, RestClient, UpstreamConnection, UpstreamProtocol};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use ticker_core::TickerData;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub const REST_API_URL: &str = "https://api.kraken.com";
pub const WS_API_URL: &str = "wss://ws.kraken.com/v2";

const TICKER_INFORMATION: &str = "/0/public/Ticker";

/// Two public REST calls per second at most.
pub const RATE_LIMIT: Duration = Duration::from_millis(500);

/// Heartbeats arrive every second, so a much shorter check than the
/// CryptoCompare one is enough.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TickerResponse {
    error: Vec<serde_json::Value>,
    result: HashMap<String, RestTicker>,
}

/// Ticker info. Array fields are `[today, last 24 hours]` except `p`
/// which is `[vwap today, vwap 24 hours]`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestTicker {
    o: String,
    v: Vec<String>,
    p: Vec<String>,
    t: Vec<u64>,
    l: Vec<String>,
    h: Vec<String>,
}

fn number(values: &[String], index: usize, field: &str) -> Result<f64, FeedError> {
    values
        .get(index)
        .ok_or_else(|| FeedError::ParseError(format!("missing {}[{}]", field, index)))?
        .parse()
        .map_err(|e| FeedError::ParseError(format!("{}[{}]: {}", field, index, e)))
}

fn convert_rest(
    from: &str,
    to: &str,
    response: &TickerResponse,
    last_update: i64,
) -> Result<TickerData, FeedError> {
    if !response.error.is_empty() {
        return Err(FeedError::Rest(format!("server error: {:?}", response.error)));
    }
    // Kraken keys the result by its own pair name (XXBTZUSD for btcusd).
    let tick = response
        .result
        .values()
        .next()
        .ok_or_else(|| FeedError::ParseError(format!("no data for {}/{}", from, to)))?;

    let open = tick
        .o
        .parse()
        .map_err(|e| FeedError::ParseError(format!("o: {}", e)))?;
    let volume = number(&tick.v, 1, "v")?;
    let low = number(&tick.l, 1, "l")?;
    let high = number(&tick.h, 1, "h")?;
    let price = number(&tick.p, 0, "p")?;
    let supply = tick.t.get(1).copied().unwrap_or_default() as f64;

    Ok(TickerData {
        open_24_hour: open,
        volume_24_hour: volume,
        low_24_hour: low,
        high_24_hour: high,
        price,
        supply,
        last_update,
        display_data_raw: display_blob(
            from,
            to,
            &[
                ("OPEN24HOUR", open),
                ("VOLUME24HOUR", volume),
                ("LOW24HOUR", low),
                ("HIGH24HOUR", high),
                ("PRICE", price),
                ("SUPPLY", supply),
            ],
            last_update,
        ),
        ..TickerData::new(from, to)
    })
}

/// `/0/public/Ticker` client, rate limited to one call per [`RATE_LIMIT`].
pub struct KrakenRest {
    client: reqwest::Client,
    base_url: String,
    rate_limit: Duration,
    next_call: Mutex<Instant>,
}

impl KrakenRest {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        Self::with_base_url(REST_API_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limit: RATE_LIMIT,
            next_call: Mutex::new(Instant::now()),
        })
    }

    fn build_url(&self, from: &str, to: &str) -> Result<Url, FeedError> {
        let pair = format!("{}{}", from, to).to_lowercase();
        let url = Url::parse_with_params(
            &format!("{}{}", self.base_url, TICKER_INFORMATION),
            &[("pair", pair.as_str())],
        )?;
        Ok(url)
    }

    /// Wait for this caller's slot. Callers are served in lock order.
    async fn limit_rate(&self) {
        let mut next_call = self.next_call.lock().await;
        tokio::time::sleep_until(*next_call).await;
        *next_call = Instant::now() + self.rate_limit;
    }
}

#[async_trait]
impl RestClient for KrakenRest {
    async fn get(&self, from: &str, to: &str) -> Result<TickerData, FeedError> {
        let (from, to) = (from.to_uppercase(), to.to_uppercase());
        self.limit_rate().await;
        let response = self.client.get(self.build_url(&from, &to)?).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::Rest(format!("HTTP {} for {}/{}", response.status(), from, to)));
        }

        let body: TickerResponse = response.json().await?;
        convert_rest(&from, &to, &body, chrono::Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamFrame {
    method: Option<String>,
    channel: String,
    data: serde_json::Value,
    success: Option<bool>,
    error: Option<String>,
    req_id: Option<i64>,
    result: Option<ResponseResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseResult {
    channel: String,
    symbol: String,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct StreamTicker {
    symbol: String,
    last: f64,
    volume: f64,
    vwap: f64,
    low: f64,
    high: f64,
    change: f64,
    change_pct: f64,
}

#[derive(Debug, PartialEq)]
enum Decoded {
    Heartbeat,
    Tickers(Vec<StreamTicker>),
    /// Server ping carrying its `req_id`.
    Ping(i64),
    Pong,
    /// Reply to a subscribe or unsubscribe request.
    Response(Result<String, String>),
    /// Frame on any other channel, such as `status`.
    Other(String),
}

fn decode_frame(text: &str) -> Result<Decoded, FeedError> {
    let frame: StreamFrame = serde_json::from_str(text)?;
    if let Some(method) = frame.method {
        return Ok(match method.as_str() {
            "ping" => Decoded::Ping(frame.req_id.unwrap_or_default()),
            "pong" => Decoded::Pong,
            _ => match (frame.error, frame.result) {
                (Some(error), _) => Decoded::Response(Err(format!("{} failed: {}", method, error))),
                (None, Some(result)) if frame.success == Some(true) => Decoded::Response(Ok(
                    format!("{} {} {}", method, result.channel, result.symbol),
                )),
                _ => Decoded::Response(Ok(method)),
            },
        });
    }

    match frame.channel.as_str() {
        "heartbeat" => Ok(Decoded::Heartbeat),
        "ticker" => Ok(Decoded::Tickers(serde_json::from_value(frame.data)?)),
        _ => Ok(Decoded::Other(frame.channel)),
    }
}

fn convert_stream(from: &str, to: &str, tick: &StreamTicker, last_update: i64) -> TickerData {
    TickerData {
        change_24_hour: tick.change,
        change_pct_24_hour: tick.change_pct,
        volume_24_hour: tick.volume,
        low_24_hour: tick.low,
        high_24_hour: tick.high,
        price: tick.vwap,
        last_update,
        display_data_raw: display_blob(
            from,
            to,
            &[
                ("CHANGE24HOUR", tick.change),
                ("CHANGEPCT24HOUR", tick.change_pct),
                ("VOLUME24HOUR", tick.volume),
                ("HIGH24HOUR", tick.high),
                ("LOW24HOUR", tick.low),
                ("PRICE", tick.vwap),
                ("LASTPRICE", tick.last),
            ],
            last_update,
        ),
        ..TickerData::new(from, to)
    }
}

fn request_frame(method: &str, channel: &str, id: i64) -> Message {
    let frame = serde_json::json!({
        "method": method,
        "params": { "channel": "ticker", "symbol": [channel] },
        "req_id": id,
    });
    Message::Text(frame.to_string())
}

/// Streaming protocol for `ws.kraken.com/v2`.
///
/// One missed heartbeat check sends an application ping; a pong or any
/// heartbeat resets the counter. Two missed checks trigger a reconnect.
pub struct KrakenWs {
    heartbeat_interval: Duration,
}

impl KrakenWs {
    pub fn new() -> Self {
        Self::with_heartbeat_interval(HEARTBEAT_CHECK_INTERVAL)
    }

    pub fn with_heartbeat_interval(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

impl Default for KrakenWs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamProtocol for KrakenWs {
    fn channel_name(&self, from: &str, to: &str) -> String {
        format!("{}/{}", from.to_uppercase(), to.to_uppercase())
    }

    fn subscribe_message(&self, channel: &str, id: i64) -> Result<Message, FeedError> {
        Ok(request_frame("subscribe", channel, id))
    }

    fn unsubscribe_message(&self, channel: &str, id: i64) -> Result<Message, FeedError> {
        Ok(request_frame("unsubscribe", channel, id))
    }

    fn ping_message(&self, _channel: &str, id: i64) -> Result<Message, FeedError> {
        let frame = serde_json::json!({ "method": "ping", "req_id": id });
        Ok(Message::Text(frame.to_string()))
    }

    fn pong_message(&self, _channel: &str, id: i64) -> Result<Message, FeedError> {
        let frame = serde_json::json!({ "method": "pong", "req_id": id });
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
                            error!("Kraken: stream stopped: {}", e);
                            return;
                        }
                        heartbeat.reset();
                        check.reset();
                        continue;
                    }
                    if let Ok(ping) = self.ping_message("", chrono::Utc::now().timestamp_millis()) {
                        if let Err(e) = conn.send(ping).await {
                            debug!("Kraken: ping failed: {}", e);
                        }
                    }
                }
                frame = conn.read() => match frame {
                    Ok(Message::Text(text)) => match decode_frame(&text) {
                        Ok(Decoded::Heartbeat) | Ok(Decoded::Pong) => heartbeat.reset(),
                        Ok(Decoded::Tickers(ticks)) => {
                            let now = chrono::Utc::now().timestamp_millis();
                            for tick in &ticks {
                                let Some((from, to)) = conn.pair_from_channel(&tick.symbol) else {
                                    debug!("Kraken: update for unsubscribed {}", tick.symbol);
                                    continue;
                                };
                                if conn.publish(convert_stream(&from, &to, tick, now)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Decoded::Ping(id)) => {
                            if let Err(e) = conn.pong("", id).await {
                                debug!("Kraken: pong failed: {}", e);
                            }
                        }
                        Ok(Decoded::Response(Ok(detail))) => info!("Kraken: {}", detail),
                        Ok(Decoded::Response(Err(detail))) => warn!("Kraken: {}", detail),
                        Ok(Decoded::Other(channel)) => debug!("Kraken: {} frame", channel),
                        Err(e) => warn!("Kraken: {}", e),
                    },
                    Ok(_) => {}
                    Err(FeedError::Cancelled) => return,
                    Err(e) => {
                        if let Err(e) = conn.recover(e).await {
                            error!("Kraken: stream stopped: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_server, TestServer};
    use crate::{WsClient, WsClientConfig};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const REST_BODY: &str = r#"{
        "error": [],
        "result": {"XXBTZUSD": {
            "a": ["30100.10000", "1", "1.000"], "b": ["30100.00000", "2", "2.000"],
            "c": ["30100.05000", "0.01"], "v": ["1200.5", "2500.25"],
            "p": ["30090.1", "30050.7"], "t": [12000, 25000],
            "l": ["29900.0", "29800.0"], "h": ["30200.0", "30500.0"], "o": "30000.0"
        }}
    }"#;

    /// Next text frame that is not an application ping.
    async fn next_request(server: &mut TestServer) -> (usize, serde_json::Value) {
        loop {
            let (index, text) = timeout(Duration::from_secs(5), server.frames.recv())
                .await
                .unwrap()
                .unwrap();
            let frame: serde_json::Value = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if frame["method"] != "ping" {
                return (index, frame);
            }
        }
    }

    #[test]
    fn test_channel_and_frames() {
        let protocol = KrakenWs::new();
        let channel = protocol.channel_name("btc", "usd");
        assert_eq!(channel, "BTC/USD");

        let Message::Text(sub) = protocol.subscribe_message(&channel, 42).unwrap() else {
            panic!("expected text frame");
        };
        let sub: serde_json::Value = serde_json::from_str(&sub).unwrap();
        assert_eq!(
            sub,
            serde_json::json!({
                "method": "subscribe",
                "params": {"channel": "ticker", "symbol": ["BTC/USD"]},
                "req_id": 42
            })
        );

        let Message::Text(unsub) = protocol.unsubscribe_message(&channel, 43).unwrap() else {
            panic!("expected text frame");
        };
        assert!(unsub.contains(r#""method":"unsubscribe""#));

        let Message::Text(pong) = protocol.pong_message("", 7).unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(pong, r#"{"method":"pong","req_id":7}"#);
    }

    #[test]
    fn test_rest_url() {
        let rest = KrakenRest::with_base_url("http://localhost:1/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            rest.build_url("BTC", "USD").unwrap().as_str(),
            "http://localhost:1/0/public/Ticker?pair=btcusd"
        );
    }

    #[test]
    fn test_convert_rest_response() {
        let body: TickerResponse = serde_json::from_str(REST_BODY).unwrap();
        let data = convert_rest("BTC", "USD", &body, 1_700_000_000_000).unwrap();

        assert_eq!(data.key(), "BTC:USD");
        assert_eq!(data.open_24_hour, 30000.0);
        assert_eq!(data.volume_24_hour, 2500.25);
        assert_eq!(data.low_24_hour, 29800.0);
        assert_eq!(data.high_24_hour, 30500.0);
        assert_eq!(data.price, 30090.1);
        assert_eq!(data.supply, 25000.0);
        assert_eq!(data.last_update, 1_700_000_000_000);

        let blob: serde_json::Value = serde_json::from_str(&data.display_data_raw).unwrap();
        assert_eq!(blob["TOSYMBOL"], "USD");
        assert_eq!(blob["PRICE"], 30090.1);
    }

    #[test]
    fn test_convert_rest_errors() {
        let failed: TickerResponse =
            serde_json::from_str(r#"{"error":["EQuery:Unknown asset pair"]}"#).unwrap();
        assert!(matches!(
            convert_rest("DOGE", "XYZ", &failed, 0),
            Err(FeedError::Rest(msg)) if msg.contains("Unknown asset pair")
        ));

        let empty: TickerResponse = serde_json::from_str(r#"{"error":[],"result":{}}"#).unwrap();
        assert!(matches!(convert_rest("BTC", "USD", &empty, 0), Err(FeedError::ParseError(_))));

        let short: TickerResponse =
            serde_json::from_str(r#"{"result":{"X":{"o":"1.0","v":["1"]}}}"#).unwrap();
        assert!(matches!(convert_rest("BTC", "USD", &short, 0), Err(FeedError::ParseError(_))));
    }

    #[test]
    fn test_decode_stream_frames() {
        assert_eq!(
            decode_frame(r#"{"channel":"heartbeat"}"#).unwrap(),
            Decoded::Heartbeat
        );
        assert_eq!(
            decode_frame(r#"{"method":"ping","req_id":9}"#).unwrap(),
            Decoded::Ping(9)
        );
        assert_eq!(
            decode_frame(r#"{"method":"pong","req_id":9,"time_in":"2024-01-01T00:00:00Z"}"#).unwrap(),
            Decoded::Pong
        );
        assert_eq!(
            decode_frame(
                r#"{"method":"subscribe","result":{"channel":"ticker","snapshot":true,"symbol":"BTC/USD"},"success":true}"#
            )
            .unwrap(),
            Decoded::Response(Ok("subscribe ticker BTC/USD".to_string()))
        );
        assert_eq!(
            decode_frame(r#"{"method":"subscribe","error":"Currency pair not supported","success":false}"#)
                .unwrap(),
            Decoded::Response(Err("subscribe failed: Currency pair not supported".to_string()))
        );
        assert_eq!(
            decode_frame(r#"{"channel":"status","type":"update","data":[{"system":"online"}]}"#).unwrap(),
            Decoded::Other("status".to_string())
        );

        let Decoded::Tickers(ticks) = decode_frame(
            r#"{"channel":"ticker","type":"update","data":[{"symbol":"ETH/USD","bid":3100.1,"bid_qty":2.0,"ask":3100.2,"ask_qty":1.5,"last":3100.15,"volume":900.5,"vwap":3095.4,"low":3050.0,"high":3150.0,"change":20.5,"change_pct":0.66}]}"#,
        )
        .unwrap() else {
            panic!("expected tickers");
        };
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "ETH/USD");

        let data = convert_stream("ETH", "USD", &ticks[0], 5);
        assert_eq!(data.price, 3095.4);
        assert_eq!(data.change_pct_24_hour, 0.66);
        assert_eq!(data.volume_24_hour, 900.5);
        assert_eq!(data.last_update, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_calls_are_spaced() {
        let rest = KrakenRest::with_base_url("http://localhost:1", Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        rest.limit_rate().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        rest.limit_rate().await;
        rest.limit_rate().await;
        assert!(start.elapsed() >= RATE_LIMIT * 2);
        assert!(start.elapsed() < RATE_LIMIT * 3);
    }

    #[tokio::test]
    async fn test_stream_routes_updates_and_answers_pings() {
        let mut server = spawn_server().await;
        let (tx, mut rx) = mpsc::channel(16);
        let client = WsClient::new(
            WsClientConfig::new(server.url.clone()),
            Arc::new(KrakenWs::new()),
            tx,
            None,
        );

        client.subscribe("btc", "usd").await.unwrap();
        let (index, frame) = next_request(&mut server).await;
        assert_eq!(index, 1);
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["params"]["symbol"], serde_json::json!(["BTC/USD"]));

        server
            .push
            .send(r#"{"method":"ping","req_id":7}"#.to_string())
            .unwrap();
        let (_, pong) = next_request(&mut server).await;
        assert_eq!(pong, serde_json::json!({"method": "pong", "req_id": 7}));

        // Updates for pairs nobody subscribed to are dropped.
        server
            .push
            .send(r#"{"channel":"ticker","type":"update","data":[{"symbol":"ETH/USD","vwap":1.0}]}"#.to_string())
            .unwrap();
        server
            .push
            .send(r#"{"channel":"ticker","type":"update","data":[{"symbol":"BTC/USD","vwap":30000.5,"change":12.0}]}"#.to_string())
            .unwrap();

        let data = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(data.key(), "BTC:USD");
        assert_eq!(data.price, 30000.5);
        assert_eq!(data.change_24_hour, 12.0);
        assert!(rx.try_recv().is_err());

        client.close().await;
    }
}
