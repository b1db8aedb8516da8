//! Downstream WebSocket server.
//!
//! Clients subscribe to currency pairs; every record arriving on the shared
//! input pipe is delivered to the active clients subscribed to its pair.
//! Delivery goes through a bounded per-client queue and never blocks. A full
//! queue only cancels the client; its writer task then marks it inactive and
//! the gc sweep removes it.

use crate::error::ServerError;
use crate::messages::{ClientRequest, ServerMessage};
use crate::price;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ticker_core::{Pair, SymbolSet, TickerData};
use ticker_feeds::{Database, RestClient};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

const WELCOME: [&str; 3] = [
    "Welcome to Ticker WS Server!",
    "To get the latest price send request like this:",
    r#"{"type": "price", "pair":{"fsym":"CRYPTO","tsym":"COMMON"}}"#,
];

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Period of the inactive-client sweep.
    pub gc_interval: Duration,
    /// Silence after which a client without subscriptions is dropped.
    pub idle_timeout: Duration,
    /// Per-client outbound queue length.
    pub queue_capacity: usize,
    /// Shared input pipe length.
    pub input_capacity: usize,
    pub write_timeout: Duration,
    /// Delay between the goodbye frame and closing the socket.
    pub close_grace: Duration,
    pub max_message_size: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            queue_capacity: 256,
            input_capacity: 1000,
            write_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(1),
            max_message_size: 512,
        }
    }
}

/// One downstream client.
pub struct ClientConnection {
    id: u64,
    outbound: mpsc::Sender<String>,
    subscriptions: SymbolSet,
    active: AtomicBool,
    cancel: CancellationToken,
}

impl ClientConnection {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the client inactive and stop its tasks. Returns `true` only for
    /// the call that flipped the flag.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.cancel.cancel();
        if was_active {
            debug!("Client #{} deactivated", self.id);
        }
        was_active
    }

    pub fn subscribe(&self, key: &str) -> bool {
        self.subscriptions.add(key)
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.subscriptions.remove(key)
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscriptions.contains(key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Set once the outbound queue overflowed or the writer was told to stop.
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue only signals the writer task; the writer marks the client
    /// inactive and closes the socket.
    pub fn enqueue(&self, text: String) -> bool {
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.cancel.is_cancelled() {
                    warn!("Client #{} outbound queue full, disconnecting", self.id);
                    self.cancel.cancel();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn reply(&self, message: ServerMessage) -> bool {
        match message.to_text() {
            Ok(text) => self.enqueue(text),
            Err(e) => {
                warn!("Failed to encode reply for client #{}: {}", self.id, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Downstream pub/sub server.
pub struct FanoutServer {
    clients: RwLock<HashMap<u64, Arc<ClientConnection>>>,
    next_id: AtomicU64,
    rest: Arc<dyn RestClient>,
    db: Arc<dyn Database>,
    allowed: Option<SymbolSet>,
    config: FanoutConfig,
    pipe: mpsc::Sender<TickerData>,
    shutdown: CancellationToken,
}

impl FanoutServer {
    /// Create the server and spawn its fan-out and gc loops.
    pub fn start(
        rest: Arc<dyn RestClient>,
        db: Arc<dyn Database>,
        allowed: Option<SymbolSet>,
        config: FanoutConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (pipe, inbound) = mpsc::channel(config.input_capacity);
        let server = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            rest,
            db,
            allowed,
            config,
            pipe,
            shutdown,
        });

        let handles = vec![
            tokio::spawn(server.clone().run_fanout(inbound)),
            tokio::spawn(server.clone().run_gc()),
        ];
        (server, handles)
    }

    /// Sender side of the shared input pipe.
    pub fn data_pipe(&self) -> mpsc::Sender<TickerData> {
        self.pipe.clone()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Add a client to the set and return its outbound queue.
    pub async fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let (outbound, queue) = mpsc::channel(self.config.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientConnection {
            id,
            outbound,
            subscriptions: SymbolSet::new(),
            active: AtomicBool::new(true),
            cancel: self.shutdown.child_token(),
        });
        self.clients.write().await.insert(id, client.clone());
        (client, queue)
    }

    pub fn add_client(self: Arc<Self>, upgrade: WebSocketUpgrade) -> Response {
        upgrade
            .max_message_size(self.config.max_message_size)
            .on_upgrade(move |socket| self.handle_socket(socket))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (client, queue) = self.register().await;
        info!("Client #{} connected", client.id);

        for line in WELCOME {
            client.reply(ServerMessage::message(None, line));
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(run_writer(
            client.clone(),
            queue,
            sink,
            self.config.write_timeout,
        ));

        self.read_loop(&client, stream).await;
        let _ = writer.await;
        info!("Client #{} disconnected", client.id);
    }

    /// Read requests until the client goes away, asks to close or idles out.
    ///
    /// A cancelled client is left for its writer to deactivate.
    pub async fn read_loop<S, E>(&self, client: &ClientConnection, mut stream: S)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = client.cancel.cancelled() => return,
                _ = &mut idle => {
                    if client.subscription_count() == 0 {
                        info!("Client #{} idle for {:?}, dropping", client.id, idle_timeout);
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        if self.handle_text(client, &text).await == Flow::Close {
                            tokio::select! {
                                _ = client.cancel.cancelled() => return,
                                _ = tokio::time::sleep(self.config.close_grace) => break,
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Client #{} read error: {}", client.id, e);
                        break;
                    }
                },
            }
        }

        client.deactivate();
    }

    pub async fn handle_text(&self, client: &ClientConnection, text: &str) -> Flow {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.handle_request(client, request).await,
            Err(e) => {
                debug!("Client #{} sent malformed request: {}", client.id, e);
                client.reply(ServerMessage::error(None, ServerError::InvalidRequest.to_string()));
                Flow::Continue
            }
        }
    }

    pub async fn handle_request(&self, client: &ClientConnection, request: ClientRequest) -> Flow {
        match request.kind.as_str() {
            "price" => {
                let Some(pair) = self.checked_pair(client, request.pair) else {
                    return Flow::Continue;
                };
                let reply = match price::last_price(
                    self.rest.as_ref(),
                    self.db.as_ref(),
                    &pair.from,
                    &pair.to,
                )
                .await
                {
                    Ok(data) => ServerMessage::data(data),
                    Err(e) => ServerMessage::error(Some(pair), e.to_string()),
                };
                client.reply(reply);
            }
            "subscribe" => {
                let Some(pair) = self.checked_pair(client, request.pair) else {
                    return Flow::Continue;
                };
                let text = if client.subscribe(&pair.key()) {
                    debug!("Client #{} subscribed to {}", client.id, pair);
                    format!("Successfully subscribed on {}/{} pair updates", pair.from, pair.to)
                } else {
                    "Already subscribed".to_string()
                };
                client.reply(ServerMessage::message(Some(pair), text));
            }
            "unsubscribe" => {
                let Some(pair) = self.checked_pair(client, request.pair) else {
                    return Flow::Continue;
                };
                let text = if client.unsubscribe(&pair.key()) {
                    debug!("Client #{} unsubscribed from {}", client.id, pair);
                    format!("Successfully unsubscribed from {}/{} pair updates", pair.from, pair.to)
                } else {
                    "Not subscribed".to_string()
                };
                client.reply(ServerMessage::message(Some(pair), text));
            }
            "ping" => {
                client.reply(ServerMessage::message(None, "pong"));
            }
            "close" => {
                let mut goodbye = ServerMessage::message(None, "Goodbye!");
                if let Some(reason) = request.reason {
                    debug!("Client #{} closing: {}", client.id, reason);
                    goodbye = goodbye.with_reason(reason);
                }
                client.reply(goodbye);
                return Flow::Close;
            }
            other => {
                client.reply(ServerMessage::error(
                    None,
                    format!("Unknown message type: {}", other),
                ));
            }
        }
        Flow::Continue
    }

    /// Normalize and validate a requested pair, replying with an error frame
    /// when it is unusable.
    fn checked_pair(&self, client: &ClientConnection, pair: Option<Pair>) -> Option<Pair> {
        match self.validate_pair(pair) {
            Ok(pair) => Some(pair),
            Err(e) => {
                client.reply(ServerMessage::error(None, e.to_string()));
                None
            }
        }
    }

    /// Normalize a pair and check both symbols against the allowed set.
    pub fn validate_pair(&self, pair: Option<Pair>) -> Result<Pair, ServerError> {
        let pair = match pair {
            Some(pair) if !pair.is_empty() => pair.normalized(),
            _ => return Err(ServerError::InvalidRequest),
        };
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&pair.from) || !allowed.contains(&pair.to) {
                return Err(ServerError::UnknownSymbol(pair.to_string()));
            }
        }
        Ok(pair)
    }

    /// Deliver one record to every active client subscribed to its pair.
    /// Returns the number of clients it was queued for.
    pub async fn dispatch(&self, data: TickerData) -> usize {
        let key = data.key();
        let text = match ServerMessage::data(data).to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} update: {}", key, e);
                return 0;
            }
        };

        let recipients: Vec<Arc<ClientConnection>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|client| {
                    client.is_active() && !client.is_closing() && client.is_subscribed(&key)
                })
                .cloned()
                .collect()
        };

        recipients
            .iter()
            .filter(|client| client.enqueue(text.clone()))
            .count()
    }

    async fn run_fanout(self: Arc<Self>, mut inbound: mpsc::Receiver<TickerData>) {
        loop {
            let data = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                data = inbound.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            let key = data.key();
            let delivered = self.dispatch(data).await;
            debug!("Fan-out {} to {} client(s)", key, delivered);
        }
        debug!("Fan-out loop stopped");
    }

    /// Remove every inactive client. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, client| {
            if client.is_active() {
                true
            } else {
                client.cancel.cancel();
                false
            }
        });
        before - clients.len()
    }

    async fn run_gc(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.gc_interval,
            self.config.gc_interval,
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep().await;
                    if removed > 0 {
                        info!("Removed {} inactive client(s)", removed);
                    }
                }
            }
        }
        debug!("Client gc stopped");
    }

    /// Disconnect every client and stop the fan-out and gc loops.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.deactivate();
        }
        clients.clear();
    }
}

/// Drain a client's outbound queue into its socket.
pub async fn run_writer<S>(
    client: Arc<ClientConnection>,
    mut queue: mpsc::Receiver<String>,
    mut sink: S,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let text = tokio::select! {
            biased;
            _ = client.cancel.cancelled() => break,
            text = queue.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        match timeout(write_timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Client #{} write failed: {}", client.id, e);
                break;
            }
            Err(_) => {
                warn!("Client #{} write timed out", client.id);
                break;
            }
        }
    }

    client.deactivate();
    let _ = timeout(write_timeout, sink.close()).await;
}

async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(server): State<Arc<FanoutServer>>,
) -> Response {
    server.add_client(upgrade)
}

async fn health_handler(State(server): State<Arc<FanoutServer>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "clients": server.client_count().await,
    }))
}

pub fn router(server: Arc<FanoutServer>) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

/// Serve `app` with a permissive CORS layer until `shutdown` fires.
pub async fn serve(
    app: Router,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{}/v1/ws", addr);
        info!("Control API listening on http://{}/v1", addr);
    }
    axum::serve(listener, app.layer(cors))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
