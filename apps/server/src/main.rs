//! Ticker relay server.
//!
//! Polls and streams prices from CryptoCompare or Kraken, keeps the last value
//! per pair and fans updates out to downstream WebSocket clients.

mod api;
mod config;
mod error;
mod messages;
mod price;
mod store;
mod ws_server;

use api::ApiState;
use clap::Parser;
use config::{AppConfig, Provider, API_KEY_ENV};
use error::ServerError;
use std::sync::Arc;
use std::time::Duration;
use store::LastValueStore;
use ticker_core::{SymbolSet, TickerData};
use ticker_feeds::{
    adapter::{cryptocompare, kraken},
    CryptoCompareRest, CryptoCompareWs, Database, KrakenRest, KrakenWs, Puller, RestClient,
    UpstreamProtocol, WsClient,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ws_server::FanoutServer;

/// Ticker relay CLI
#[derive(Parser, Debug)]
#[command(name = "ticker-server")]
#[command(about = "Real-time crypto price relay", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Log level: trace, debug, info, warn, error (RUST_LOG wins when set)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Allowed crypto symbols, comma separated
    #[arg(long)]
    crypto: Option<String>,

    /// Allowed common currency symbols, comma separated
    #[arg(long)]
    common: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(crypto) = &args.crypto {
        config.symbols.crypto = crypto.clone();
    }
    if let Some(common) = &args.common {
        config.symbols.common = common.clone();
    }
}

/// REST client, streaming protocol and streaming URL for the configured
/// provider.
fn provider_clients(
    provider: Provider,
    http_timeout: Duration,
) -> Result<(Arc<dyn RestClient>, Arc<dyn UpstreamProtocol>, String), ServerError> {
    match provider {
        Provider::CryptoCompare => {
            let api_key = std::env::var(API_KEY_ENV)
                .map_err(|_| ServerError::Config(format!("{} is not set", API_KEY_ENV)))?;
            Ok((
                Arc::new(CryptoCompareRest::new(&api_key, http_timeout)?),
                Arc::new(CryptoCompareWs::new()),
                cryptocompare::ws_url(&api_key)?,
            ))
        }
        Provider::Kraken => Ok((
            Arc::new(KrakenRest::new(http_timeout)?),
            Arc::new(KrakenWs::new()),
            kraken::WS_API_URL.to_string(),
        )),
    }
}

/// Forward every streamed record to the store and the fan-out server.
fn spawn_tee(
    mut inbound: mpsc::Receiver<TickerData>,
    outputs: Vec<mpsc::Sender<TickerData>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            for output in &outputs {
                if output.send(data.clone()).await.is_err() {
                    warn!("Output closed, dropping {} update", data.key());
                }
            }
        }
    })
}

async fn run(args: Args) -> Result<(), ServerError> {
    let mut config = AppConfig::load(&args.config)?;
    apply_overrides(&mut config, &args);

    info!("  Provider: {:?}", config.provider);
    let (rest, protocol, ws_url) = provider_clients(
        config.provider,
        Duration::from_millis(config.server.http_timeout_ms),
    )?;

    let allowed = config.symbols.allowed();
    info!(
        "  Allowed symbols: {}",
        allowed
            .as_ref()
            .map(SymbolSet::all)
            .map(|all| all.join(","))
            .unwrap_or_else(|| "any".to_string())
    );

    let shutdown = CancellationToken::new();

    let (store, store_writer) =
        LastValueStore::spawn(config.fanout.input_capacity, shutdown.clone());
    let store: Arc<LastValueStore> = Arc::new(store);

    let session = config.session.open().await?;

    let (fanout, fanout_handles) = FanoutServer::start(
        rest.clone(),
        store.clone(),
        allowed,
        (&config.fanout).into(),
        shutdown.clone(),
    );

    let puller = Arc::new(Puller::new(
        rest.clone(),
        vec![store.data_pipe(), fanout.data_pipe()],
        Some(session.clone()),
        (&config.puller).into(),
    ));

    let (stream_tx, stream_rx) = mpsc::channel(config.fanout.input_capacity);
    let tee = spawn_tee(stream_rx, vec![store.data_pipe(), fanout.data_pipe()]);
    let ws_client = Arc::new(WsClient::new(
        config.upstream.ws_config(ws_url),
        protocol,
        stream_tx,
        Some(session.clone()),
    ));

    match puller.restore_last_session().await {
        Ok(n) if n > 0 => info!("Restored {} poll task(s)", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to restore poll session: {}", e),
    }
    match ws_client.restore_last_session().await {
        Ok(n) if n > 0 => info!("Restored {} stream subscription(s)", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to restore stream session: {}", e),
    }

    for pair in &config.pairs {
        puller
            .add_task(&pair.from, &pair.to, Duration::from_secs(pair.interval_secs))
            .await;
    }
    for pair in &config.ws_pairs {
        if let Err(e) = ws_client.subscribe(&pair.from, &pair.to).await {
            warn!("Failed to stream {}/{}: {}", pair.from, pair.to, e);
        }
    }

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let app = ws_server::router(fanout.clone()).merge(api::router(ApiState {
        fanout: fanout.clone(),
        puller: puller.clone(),
        ws_client: ws_client.clone(),
    }));
    let server_handle = tokio::spawn(ws_server::serve(app, listener, shutdown.clone()));

    info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received");

    puller.close().await;
    ws_client.close().await;
    fanout.close().await;
    shutdown.cancel();

    match tokio::time::timeout(Duration::from_secs(2), server_handle).await {
        Ok(Ok(Err(e))) => error!("Server error: {}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Err(_) => warn!("Server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }
    for handle in fanout_handles {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), store_writer).await;
    tee.abort();

    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Ticker relay starting...");
    info!("  Config: {}", args.config);

    if let Err(e) = run(args).await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kraken_provider_needs_no_api_key() {
        let (_, protocol, url) =
            provider_clients(Provider::Kraken, Duration::from_secs(1)).unwrap();
        assert_eq!(url, kraken::WS_API_URL);
        assert_eq!(protocol.channel_name("btc", "usd"), "BTC/USD");
    }
}
