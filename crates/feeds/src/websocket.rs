//! Reconnecting upstream WebSocket client.
//!
//! Every logical subscription shares one physical connection. The connection
//! is opened by the first subscribe and released after the last unsubscribe.
//! Subscribe and unsubscribe are requests to a single control task, answered
//! over a oneshot reply. The control task opens or closes the connection,
//! sends the upstream frame and updates the registry in one step, so
//! transitions never interleave.
//!
//! Frame encoding and decoding is delegated to an [`UpstreamProtocol`].

use crate::session::{parse_ws_session_name, ws_session_name};
use crate::{FeedError, Message, SessionRepo, UpstreamProtocol};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ticker_core::{Subscription, SubscriptionRegistry, TickerData};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub url: String,
    /// Total time a reconnect keeps retrying before giving up.
    pub reconnect_timeout_ms: u64,
    /// First backoff step; doubles up to `max_reconnect_delay_ms`.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Deadline for the liveness ping write.
    pub ping_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_timeout_ms: 60_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 10_000,
            ping_timeout_ms: 5_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// State shared by the client, its control task and the message handler.
struct Shared {
    config: WsClientConfig,
    protocol: Arc<dyn UpstreamProtocol>,
    registry: SubscriptionRegistry,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    source: Mutex<Option<SplitStream<WsStream>>>,
    /// Bumped on every successful dial.
    generation: AtomicU64,
    /// Set when a read or write on the current connection failed.
    broken: AtomicBool,
    dial_lock: Mutex<()>,
    output: mpsc::Sender<TickerData>,
    session: Option<Arc<dyn SessionRepo>>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Upstream URL without its query string, for logs.
    fn endpoint(&self) -> &str {
        self.config.url.split('?').next().unwrap_or_default()
    }

    async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Liveness check: the connection exists, has not failed, and accepts a
    /// ping within the ping deadline.
    async fn is_alive(&self) -> bool {
        if self.broken.load(Ordering::Acquire) {
            return false;
        }
        let ping = self
            .protocol
            .ping_message("", chrono::Utc::now().timestamp_millis())
            .unwrap_or_else(|_| Message::Ping(Vec::new()));

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return false;
        };
        match timeout(Duration::from_millis(self.config.ping_timeout_ms), sink.send(ping)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Upstream {}: liveness ping failed: {}", self.endpoint(), e);
                self.broken.store(true, Ordering::Release);
                false
            }
            Err(_) => {
                debug!("Upstream {}: liveness ping timed out", self.endpoint());
                self.broken.store(true, Ordering::Release);
                false
            }
        }
    }

    async fn send(&self, frame: Message) -> Result<(), FeedError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(FeedError::NotConnected)?;
        match timeout(Duration::from_millis(self.config.write_timeout_ms), sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                Err(e.into())
            }
            Err(_) => {
                self.broken.store(true, Ordering::Release);
                Err(FeedError::Timeout("upstream write".to_string()))
            }
        }
    }

    /// Re-dial and replay the registry, retrying with backoff until the
    /// reconnect budget runs out.
    ///
    /// With `seen` set, the dial is skipped when another caller already
    /// replaced the connection that generation refers to.
    async fn reconnect(&self, seen: Option<u64>, cancel: &CancellationToken) -> Result<(), FeedError> {
        let _guard = self.dial_lock.lock().await;
        if let Some(seen) = seen {
            if seen != self.generation.load(Ordering::Acquire) && !self.broken.load(Ordering::Acquire) {
                debug!("Upstream {}: already reconnected", self.endpoint());
                return Ok(());
            }
        }

        let budget = Duration::from_millis(self.config.reconnect_timeout_ms);
        let deadline = Instant::now() + budget;
        let max_delay = Duration::from_millis(self.config.max_reconnect_delay_ms);
        let mut delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                res = timeout(remaining, self.dial()) => {
                    res.unwrap_or_else(|_| Err(FeedError::Timeout("upstream dial".to_string())))
                }
            };

            let err = match result {
                Ok(replayed) => {
                    info!(
                        "Upstream {}: connected (attempt #{}, {} subscription(s) replayed)",
                        self.endpoint(), attempt, replayed
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                error!("Upstream {}: giving up on non-retryable error: {}", self.endpoint(), err);
                return Err(err);
            }
            if Instant::now() + delay >= deadline {
                error!(
                    "Upstream {}: reconnect failed after {} attempt(s): {}",
                    self.endpoint(), attempt, err
                );
                return Err(FeedError::ReconnectFailed(budget, err.to_string()));
            }

            warn!(
                "Upstream {}: connect failed: {}. Retrying in {:?} (attempt #{})",
                self.endpoint(), err, delay, attempt
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    /// One dial attempt. Returns how many subscriptions were replayed.
    async fn dial(&self) -> Result<usize, FeedError> {
        self.disconnect().await;

        debug!("Connecting to upstream: {}", self.endpoint());
        let (stream, response) = connect_async(self.config.url.as_str()).await?;
        debug!("Upstream {}: handshake done (status: {:?})", self.endpoint(), response.status());

        let (mut sink, source) = stream.split();
        let subscriptions = self.registry.snapshot();
        for (channel, subscription) in &subscriptions {
            let frame = self.protocol.subscribe_message(channel, subscription.id())?;
            sink.send(frame).await?;
        }

        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.broken.store(false, Ordering::Release);
        Ok(subscriptions.len())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let closed = timeout(Duration::from_millis(self.config.write_timeout_ms), sink.close()).await;
            if let Ok(Err(e)) = closed {
                debug!("Upstream {}: close failed: {}", self.endpoint(), e);
            }
        }
        self.source.lock().await.take();
    }
}

/// Connection accessor handed to [`UpstreamProtocol::handle_messages`].
pub struct UpstreamConnection {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    /// Generation of the connection this handler last read from.
    seen: AtomicU64,
}

impl UpstreamConnection {
    /// Next data frame. Control frames are skipped; a close frame or the end
    /// of the stream is reported as an error.
    pub async fn read(&self) -> Result<Message, FeedError> {
        let mut guard = self.shared.source.lock().await;
        let source = guard.as_mut().ok_or(FeedError::NotConnected)?;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FeedError::Cancelled),
                next = source.next() => next,
            };
            match next {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    self.shared.broken.store(true, Ordering::Release);
                    return Err(FeedError::Disconnected(format!("close frame: {:?}", frame)));
                }
                Some(Ok(msg)) => {
                    self.seen
                        .store(self.shared.generation.load(Ordering::Acquire), Ordering::Release);
                    return Ok(msg);
                }
                Some(Err(e)) => {
                    self.shared.broken.store(true, Ordering::Release);
                    return Err(e.into());
                }
                None => {
                    self.shared.broken.store(true, Ordering::Release);
                    return Err(FeedError::Disconnected("stream ended".to_string()));
                }
            }
        }
    }

    pub async fn send(&self, frame: Message) -> Result<(), FeedError> {
        self.shared.send(frame).await
    }

    /// Answer an application-level ping.
    pub async fn pong(&self, channel: &str, id: i64) -> Result<(), FeedError> {
        let frame = self.shared.protocol.pong_message(channel, id)?;
        self.shared.send(frame).await
    }

    /// Reconnect and resubscribe after `err`. Cancellation wins over retry.
    pub async fn recover(&self, err: FeedError) -> Result<(), FeedError> {
        if matches!(err, FeedError::Cancelled) || self.cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }
        warn!("Upstream {}: {}, reconnecting", self.shared.endpoint(), err);
        self.shared
            .reconnect(Some(self.seen.load(Ordering::Acquire)), &self.cancel)
            .await?;
        self.seen
            .store(self.shared.generation.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    pub fn pair_from_channel(&self, channel: &str) -> Option<(String, String)> {
        self.shared.registry.pair_for_channel(channel)
    }

    pub fn output(&self) -> &mpsc::Sender<TickerData> {
        &self.shared.output
    }

    /// Push a decoded record to the output channel.
    pub async fn publish(&self, data: TickerData) -> Result<(), FeedError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FeedError::Cancelled),
            sent = self.shared.output.send(data) => sent.map_err(|_| FeedError::ChannelClosed),
        }
    }
}

/// Requests served by the control task. Each one is a whole transition:
/// connection state, upstream frame and registry change happen together.
enum Control {
    Subscribe {
        from: String,
        to: String,
        reply: oneshot::Sender<Result<bool, FeedError>>,
    },
    Unsubscribe {
        from: String,
        to: String,
        reply: oneshot::Sender<Result<bool, FeedError>>,
    },
}

struct HandlerTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Sole owner of connection open/close transitions.
struct ControlTask {
    shared: Arc<Shared>,
    handler: Option<HandlerTask>,
}

impl ControlTask {
    async fn run(mut self, mut requests: mpsc::Receiver<Control>) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(Control::Subscribe { from, to, reply }) => {
                        let result = self.subscribe(&from, &to).await;
                        let _ = reply.send(result);
                    }
                    Some(Control::Unsubscribe { from, to, reply }) => {
                        let result = self.unsubscribe(&from, &to).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
            }
        }

        self.stop_handler().await;
        self.shared.disconnect().await;
        debug!("Upstream {}: control task stopped", self.shared.endpoint());
    }

    /// Returns `false` when the pair was already registered.
    async fn subscribe(&mut self, from: &str, to: &str) -> Result<bool, FeedError> {
        let channel = self.shared.protocol.channel_name(from, to);
        if self.shared.registry.contains(&channel) {
            debug!("Already subscribed to {}", channel);
            return Ok(false);
        }

        self.up().await?;

        let id = chrono::Utc::now().timestamp_millis();
        let frame = self.shared.protocol.subscribe_message(&channel, id)?;
        self.shared.send(frame).await?;
        self.shared.registry.insert(&channel, Subscription::new(from, to, id));
        info!("Subscribed to {} ({}/{})", channel, from, to);
        Ok(true)
    }

    /// Returns `false` when the pair was not registered.
    async fn unsubscribe(&mut self, from: &str, to: &str) -> Result<bool, FeedError> {
        let channel = self.shared.protocol.channel_name(from, to);
        let removed = match self.shared.registry.get(&channel) {
            Some(subscription) => {
                match self.shared.protocol.unsubscribe_message(&channel, subscription.id()) {
                    Ok(frame) => {
                        if let Err(e) = self.shared.send(frame).await {
                            warn!("Failed to send unsubscribe for {}: {}", channel, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode unsubscribe for {}: {}", channel, e),
                }
                self.shared.registry.remove(&channel);
                info!("Unsubscribed from {}", channel);
                true
            }
            None => false,
        };

        self.down().await;
        Ok(removed)
    }

    async fn up(&mut self) -> Result<(), FeedError> {
        if self.handler_running() && self.shared.is_connected().await && self.shared.is_alive().await {
            return Ok(());
        }

        self.stop_handler().await;
        let shutdown = self.shared.shutdown.clone();
        self.shared.reconnect(None, &shutdown).await?;
        self.start_handler();
        Ok(())
    }

    async fn down(&mut self) {
        if !self.shared.registry.is_empty() && self.shared.is_alive().await {
            return;
        }
        self.stop_handler().await;
        self.shared.disconnect().await;
        info!("Upstream {}: connection released", self.shared.endpoint());
    }

    fn handler_running(&self) -> bool {
        self.handler
            .as_ref()
            .map_or(false, |handler| !handler.join.is_finished())
    }

    fn start_handler(&mut self) {
        let cancel = self.shared.shutdown.child_token();
        let conn = UpstreamConnection {
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            seen: AtomicU64::new(self.shared.generation.load(Ordering::Acquire)),
        };
        let protocol = self.shared.protocol.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            protocol.handle_messages(conn, token).await;
        });
        self.handler = Some(HandlerTask { cancel, join });
    }

    async fn stop_handler(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.cancel.cancel();
            if let Err(e) = handler.join.await {
                if e.is_panic() {
                    error!("Upstream {}: message handler panicked", self.shared.endpoint());
                }
            }
        }
    }
}

/// Multiplexing upstream client with lazy connect and automatic resubscribe.
pub struct WsClient {
    shared: Arc<Shared>,
    control: mpsc::Sender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsClient {
    /// Create the client and spawn its control task. Nothing is dialed until
    /// the first subscribe.
    pub fn new(
        config: WsClientConfig,
        protocol: Arc<dyn UpstreamProtocol>,
        output: mpsc::Sender<TickerData>,
        session: Option<Arc<dyn SessionRepo>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            protocol,
            registry: SubscriptionRegistry::new(),
            sink: Mutex::new(None),
            source: Mutex::new(None),
            generation: AtomicU64::new(0),
            broken: AtomicBool::new(false),
            dial_lock: Mutex::new(()),
            output,
            session,
            shutdown: CancellationToken::new(),
        });

        let (control, requests) = mpsc::channel(16);
        let task = ControlTask {
            shared: shared.clone(),
            handler: None,
        };
        let handle = tokio::spawn(task.run(requests));

        Self {
            shared,
            control,
            task: Mutex::new(Some(handle)),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<bool, FeedError>>) -> Control,
    ) -> Result<bool, FeedError> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(build(reply))
            .await
            .map_err(|_| FeedError::Cancelled)?;
        response.await.map_err(|_| FeedError::Cancelled)?
    }

    /// Subscribe to a pair, opening the connection if needed.
    ///
    /// Subscribing to a pair that is already registered is a no-op.
    pub async fn subscribe(&self, from: &str, to: &str) -> Result<(), FeedError> {
        let (from, to) = (from.to_uppercase(), to.to_uppercase());
        let added = self
            .request(|reply| Control::Subscribe {
                from: from.clone(),
                to: to.clone(),
                reply,
            })
            .await?;

        if added {
            if let Some(session) = &self.shared.session {
                if let Err(e) = session.add_task(&ws_session_name(&from, &to), 0).await {
                    warn!("Failed to record session for {}/{}: {}", from, to, e);
                }
            }
        }
        Ok(())
    }

    /// Drop a subscription; the connection is released when none remain.
    pub async fn unsubscribe(&self, from: &str, to: &str) -> Result<(), FeedError> {
        let (from, to) = (from.to_uppercase(), to.to_uppercase());
        let removed = self
            .request(|reply| Control::Unsubscribe {
                from: from.clone(),
                to: to.clone(),
                reply,
            })
            .await?;

        if removed {
            if let Some(session) = &self.shared.session {
                if let Err(e) = session.remove_task(&ws_session_name(&from, &to)).await {
                    warn!("Failed to remove session for {}/{}: {}", from, to, e);
                }
            }
        }
        Ok(())
    }

    /// Point-in-time copy of channel -> subscription.
    pub fn list_subscriptions(&self) -> HashMap<String, Subscription> {
        self.shared.registry.snapshot()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.is_connected().await
    }

    /// Re-subscribe every `WS:FROM:TO` entry of the session repository.
    pub async fn restore_last_session(&self) -> Result<usize, FeedError> {
        let Some(session) = &self.shared.session else {
            return Ok(0);
        };
        let entries = session
            .get_session()
            .await
            .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;

        let mut restored = 0;
        for name in entries.keys() {
            let Some((from, to)) = parse_ws_session_name(name) else {
                continue;
            };
            match self.subscribe(&from, &to).await {
                Ok(()) => restored += 1,
                Err(e) => warn!("Failed to restore subscription {}: {}", name, e),
            }
        }
        Ok(restored)
    }

    /// Stop the control task and close the connection.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
