//! Application configuration.

use crate::error::ServerError;
use crate::ws_server::FanoutConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ticker_core::SymbolSet;
use ticker_feeds::{FileSessionRepo, MemorySessionRepo, PullerConfig, SessionRepo, WsClientConfig};
use tracing::info;

/// Environment variable holding the CryptoCompare API key. Kraken needs none.
pub const API_KEY_ENV: &str = "TICKER_APIKEY";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Market data source for both REST polling and streaming.
    pub provider: Provider,
    pub server: ServerSettings,
    pub fanout: FanoutSettings,
    pub puller: PullerSettings,
    pub upstream: UpstreamSettings,
    pub symbols: SymbolSettings,
    pub session: SessionSettings,
    /// Pairs polled over REST at startup.
    pub pairs: Vec<PollPair>,
    /// Pairs streamed over the upstream WebSocket at startup.
    pub ws_pairs: Vec<StreamPair>,
}

impl AppConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Upstream market data provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    CryptoCompare,
    Kraken,
}

/// Where poll tasks and stream subscriptions are recorded for restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub backend: SessionBackend,
    /// JSON file used by the `file` backend.
    pub path: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Memory,
            path: "session.json".to_string(),
        }
    }
}

impl SessionSettings {
    pub async fn open(&self) -> Result<Arc<dyn SessionRepo>, ServerError> {
        match self.backend {
            SessionBackend::Memory => Ok(Arc::new(MemorySessionRepo::new())),
            SessionBackend::File => {
                info!("  Session file: {}", self.path);
                Ok(Arc::new(FileSessionRepo::open(&self.path).await?))
            }
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// REST client request timeout.
    pub http_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            http_timeout_ms: 5_000,
        }
    }
}

/// Downstream fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    pub gc_interval_secs: u64,
    pub idle_timeout_secs: u64,
    /// Per-client outbound queue length.
    pub queue_capacity: usize,
    /// Shared inbound record channel length.
    pub input_capacity: usize,
    pub write_timeout_secs: u64,
    pub close_grace_ms: u64,
    pub max_message_size: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            gc_interval_secs: 10,
            idle_timeout_secs: 60,
            queue_capacity: 256,
            input_capacity: 1000,
            write_timeout_secs: 10,
            close_grace_ms: 1_000,
            max_message_size: 512,
        }
    }
}

impl From<&FanoutSettings> for FanoutConfig {
    fn from(settings: &FanoutSettings) -> Self {
        FanoutConfig {
            gc_interval: Duration::from_secs(settings.gc_interval_secs),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            queue_capacity: settings.queue_capacity,
            input_capacity: settings.input_capacity,
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            close_grace: Duration::from_millis(settings.close_grace_ms),
            max_message_size: settings.max_message_size,
        }
    }
}

/// REST poll scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullerSettings {
    pub default_interval_secs: u64,
    pub start_jitter_secs: u64,
}

impl Default for PullerSettings {
    fn default() -> Self {
        let defaults = PullerConfig::default();
        Self {
            default_interval_secs: defaults.default_interval_secs,
            start_jitter_secs: defaults.start_jitter_secs,
        }
    }
}

impl From<&PullerSettings> for PullerConfig {
    fn from(settings: &PullerSettings) -> Self {
        PullerConfig {
            default_interval_secs: settings.default_interval_secs,
            start_jitter_secs: settings.start_jitter_secs,
        }
    }
}

/// Upstream WebSocket reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub reconnect_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub ping_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        let defaults = WsClientConfig::default();
        Self {
            reconnect_timeout_secs: defaults.reconnect_timeout_ms / 1000,
            reconnect_delay_ms: defaults.reconnect_delay_ms,
            max_reconnect_delay_ms: defaults.max_reconnect_delay_ms,
            ping_timeout_ms: defaults.ping_timeout_ms,
            write_timeout_ms: defaults.write_timeout_ms,
        }
    }
}

impl UpstreamSettings {
    pub fn ws_config(&self, url: impl Into<String>) -> WsClientConfig {
        WsClientConfig {
            url: url.into(),
            reconnect_timeout_ms: self.reconnect_timeout_secs * 1000,
            reconnect_delay_ms: self.reconnect_delay_ms,
            max_reconnect_delay_ms: self.max_reconnect_delay_ms,
            ping_timeout_ms: self.ping_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
        }
    }
}

/// Symbols clients may request, as comma separated lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolSettings {
    pub crypto: String,
    pub common: String,
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            crypto: "BTC,XRP,ETH,BCH,EOS,LTC,XMR,DASH".to_string(),
            common: "USD,EUR,GBP,JPY,RUR,USDT".to_string(),
        }
    }
}

impl SymbolSettings {
    /// Union of both lists, or `None` when both are empty (no validation).
    pub fn allowed(&self) -> Option<SymbolSet> {
        let set = SymbolSet::from_csv(&format!("{},{}", self.crypto, self.common));
        (!set.is_empty()).then_some(set)
    }
}

/// A pair to poll, with its interval (0 = scheduler default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPair {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub interval_secs: u64,
}

/// A pair to stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPair {
    pub from: String,
    pub to: String,
}
