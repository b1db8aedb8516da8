//! HTTP control routes.
//!
//! `/v1/collect` manages REST poll tasks and `/v1/ws/*` manages upstream
//! stream subscriptions. Every reply is a `{code, message, data}` envelope.

use crate::error::ServerError;
use crate::ws_server::FanoutServer;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use ticker_core::{pair_key, Pair};
use ticker_feeds::{Puller, WsClient};
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub fanout: Arc<FanoutServer>,
    pub puller: Arc<Puller>,
    pub ws_client: Arc<WsClient>,
}

/// Body of every collect and stream request.
#[derive(Debug, Clone, Deserialize)]
pub struct PairRequest {
    #[serde(rename = "fsym")]
    pub from: String,
    #[serde(rename = "tsym")]
    pub to: String,
    /// Poll interval in seconds; 0 means the scheduler default.
    #[serde(default)]
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiReply {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

impl IntoResponse for ApiReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::InvalidRequest | ServerError::UnknownSymbol(_) => StatusCode::BAD_REQUEST,
            ServerError::PriceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiReply::new(status, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub from: String,
    pub to: String,
    pub interval_secs: f64,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub from: String,
    pub to: String,
}

type ApiResult = Result<ApiReply, ServerError>;

fn checked(state: &ApiState, body: Result<Json<PairRequest>, JsonRejection>) -> Result<(Pair, u64), ServerError> {
    let Json(request) = body.map_err(|_| ServerError::InvalidRequest)?;
    let pair = state
        .fanout
        .validate_pair(Some(Pair::new(&request.from, &request.to)))?;
    Ok((pair, request.interval))
}

async fn task_status(state: &ApiState) -> Vec<TaskStatus> {
    let mut tasks: Vec<TaskStatus> = state
        .puller
        .list_tasks()
        .await
        .values()
        .map(|task| TaskStatus {
            from: task.from().to_string(),
            to: task.to().to_string(),
            interval_secs: task.interval().as_secs_f64(),
            running: task.is_running(),
        })
        .collect();
    tasks.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
    tasks
}

fn stream_status(state: &ApiState) -> Vec<StreamStatus> {
    let mut streams: Vec<StreamStatus> = state
        .ws_client
        .list_subscriptions()
        .into_values()
        .map(|sub| StreamStatus {
            from: sub.from,
            to: sub.to,
        })
        .collect();
    streams.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
    streams
}

async fn collect_status(State(state): State<ApiState>) -> ApiReply {
    ApiReply::new(StatusCode::OK, "Information about running tasks").with_data(serde_json::json!({
        "tasks": task_status(&state).await,
        "subscriptions": stream_status(&state),
    }))
}

async fn collect_add(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ApiResult {
    let (pair, interval) = checked(&state, body)?;
    if state.puller.list_tasks().await.contains_key(&pair.key()) {
        return Ok(ApiReply::new(StatusCode::OK, "Data for this pair is already being collected"));
    }
    let task = state
        .puller
        .add_task(&pair.from, &pair.to, Duration::from_secs(interval))
        .await;
    info!("API: collecting {} every {:?}", pair, task.interval());
    Ok(ApiReply::new(StatusCode::CREATED, "Data collection started").with_data(TaskStatus {
        from: pair.from,
        to: pair.to,
        interval_secs: task.interval().as_secs_f64(),
        running: task.is_running(),
    }))
}

async fn collect_update(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ApiResult {
    let (pair, interval) = checked(&state, body)?;
    let Some(task) = state.puller.list_tasks().await.remove(&pair.key()) else {
        return Ok(ApiReply::new(StatusCode::OK, "No data is collected for this pair"));
    };
    state
        .puller
        .update_task(&task, Duration::from_secs(interval))
        .await;
    Ok(ApiReply::new(StatusCode::OK, "Task updated successfully").with_data(TaskStatus {
        from: pair.from,
        to: pair.to,
        interval_secs: task.interval().as_secs_f64(),
        running: task.is_running(),
    }))
}

async fn collect_remove(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ApiResult {
    let (pair, _) = checked(&state, body)?;
    if !state.puller.remove_task(&pair.from, &pair.to).await {
        return Ok(ApiReply::new(StatusCode::OK, "No data is collected for this pair"));
    }
    info!("API: stopped collecting {}", pair);
    Ok(ApiReply::new(StatusCode::OK, "Task stopped successfully"))
}

async fn ws_status(State(state): State<ApiState>) -> ApiReply {
    ApiReply::new(StatusCode::OK, "Upstream stream subscriptions").with_data(serde_json::json!({
        "connected": state.ws_client.is_connected().await,
        "subscriptions": stream_status(&state),
    }))
}

async fn ws_subscribe(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ApiResult {
    let (pair, _) = checked(&state, body)?;
    state.ws_client.subscribe(&pair.from, &pair.to).await?;
    info!("API: streaming {}", pair);
    Ok(ApiReply::new(
        StatusCode::OK,
        format!("Subscribed on {} pair updates", pair),
    ))
}

async fn ws_unsubscribe(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> ApiResult {
    let (pair, _) = checked(&state, body)?;
    let channel_known = state
        .ws_client
        .list_subscriptions()
        .values()
        .any(|sub| pair_key(&sub.from, &sub.to) == pair.key());
    state.ws_client.unsubscribe(&pair.from, &pair.to).await?;
    let message = if channel_known {
        format!("Unsubscribed from {} pair updates", pair)
    } else {
        format!("Not subscribed to {}", pair)
    };
    Ok(ApiReply::new(StatusCode::OK, message))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/collect/status", get(collect_status))
        .route(
            "/v1/collect",
            post(collect_add).put(collect_update).delete(collect_remove),
        )
        .route("/v1/ws/status", get(ws_status))
        .route("/v1/ws/subscribe", post(ws_subscribe))
        .route("/v1/ws/unsubscribe", post(ws_unsubscribe))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LastValueStore;
    use crate::ws_server::FanoutConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use ticker_core::{SymbolSet, TickerData};
    use ticker_feeds::{
        CryptoCompareWs, FeedError, MemorySessionRepo, PullerConfig, RestClient, SessionRepo,
        WsClientConfig,
    };
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct FixedRest;

    #[async_trait]
    impl RestClient for FixedRest {
        async fn get(&self, from: &str, to: &str) -> Result<TickerData, FeedError> {
            Ok(TickerData {
                price: 1.0,
                ..TickerData::new(from, to)
            })
        }
    }

    /// Upstream that accepts connections and forwards received text frames.
    async fn upstream() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });
        (url, rx)
    }

    async fn test_state(
        upstream_url: &str,
        session: Arc<dyn SessionRepo>,
    ) -> (ApiState, Router) {
        let shutdown = CancellationToken::new();
        let (store, _writer) = LastValueStore::spawn(16, shutdown.clone());
        let (fanout, _handles) = FanoutServer::start(
            Arc::new(FixedRest),
            Arc::new(store),
            Some(SymbolSet::from_csv("BTC,ETH,USD")),
            FanoutConfig::default(),
            shutdown,
        );
        let (tx, _rx) = mpsc::channel(16);
        let state = ApiState {
            fanout,
            puller: Arc::new(Puller::new(
                Arc::new(FixedRest),
                vec![],
                Some(session.clone()),
                PullerConfig {
                    start_jitter_secs: 0,
                    ..PullerConfig::default()
                },
            )),
            ws_client: Arc::new(WsClient::new(
                WsClientConfig::new(upstream_url),
                Arc::new(CryptoCompareWs::new()),
                tx,
                Some(session),
            )),
        };
        let app = router(state.clone());
        (state, app)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, ApiReply) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_collect_lifecycle() {
        let session = Arc::new(MemorySessionRepo::new());
        let (state, app) = test_state("ws://127.0.0.1:1", session.clone()).await;
        let body = r#"{"fsym":"btc","tsym":"usd","interval":30}"#;

        let (status, reply) = call(&app, Method::POST, "/v1/collect", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(reply.message, "Data collection started");
        assert_eq!(reply.data.unwrap()["interval_secs"], 30.0);
        assert_eq!(session.get_session().await.unwrap().get("BTC:USD"), Some(&30));

        let (status, reply) = call(&app, Method::POST, "/v1/collect", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.message, "Data for this pair is already being collected");

        let (_, reply) = call(
            &app,
            Method::PUT,
            "/v1/collect",
            Some(r#"{"fsym":"BTC","tsym":"USD","interval":5}"#),
        )
        .await;
        assert_eq!(reply.message, "Task updated successfully");
        assert_eq!(state.puller.list_tasks().await["BTC:USD"].interval(), Duration::from_secs(5));

        let (status, reply) = call(&app, Method::GET, "/v1/collect/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let tasks: Vec<TaskStatus> =
            serde_json::from_value(reply.data.unwrap()["tasks"].clone()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].from, "BTC");
        assert_eq!(tasks[0].interval_secs, 5.0);

        let (_, reply) = call(&app, Method::DELETE, "/v1/collect", Some(body)).await;
        assert_eq!(reply.message, "Task stopped successfully");
        let (_, reply) = call(&app, Method::DELETE, "/v1/collect", Some(body)).await;
        assert_eq!(reply.message, "No data is collected for this pair");
        assert!(state.puller.list_tasks().await.is_empty());
        assert!(session.get_session().await.unwrap().is_empty());

        state.puller.close().await;
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (state, app) =
            test_state("ws://127.0.0.1:1", Arc::new(MemorySessionRepo::new())).await;

        let (status, reply) = call(&app, Method::POST, "/v1/collect", Some("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.message, ServerError::InvalidRequest.to_string());

        let (status, reply) = call(
            &app,
            Method::POST,
            "/v1/ws/subscribe",
            Some(r#"{"fsym":"DOGE","tsym":"USD"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.message, "unknown symbol in pair DOGE/USD");
        assert!(state.puller.list_tasks().await.is_empty());
        assert!(state.ws_client.list_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_stream_subscribe_and_unsubscribe() {
        let (url, mut frames) = upstream().await;
        let session = Arc::new(MemorySessionRepo::new());
        let (state, app) = test_state(&url, session.clone()).await;
        let body = r#"{"fsym":"eth","tsym":"usd"}"#;

        let (status, reply) = call(&app, Method::POST, "/v1/ws/subscribe", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.message, "Subscribed on ETH/USD pair updates");
        assert_eq!(
            frames.recv().await.unwrap(),
            r#"{"action":"SubAdd","subs":["5~CCCAGG~ETH~USD"]}"#
        );
        assert_eq!(session.get_session().await.unwrap().get("WS:ETH:USD"), Some(&0));

        let (_, reply) = call(&app, Method::GET, "/v1/ws/status", None).await;
        let data = reply.data.unwrap();
        assert_eq!(data["connected"], true);
        let streams: Vec<StreamStatus> =
            serde_json::from_value(data["subscriptions"].clone()).unwrap();
        assert_eq!(
            streams,
            vec![StreamStatus {
                from: "ETH".to_string(),
                to: "USD".to_string()
            }]
        );

        let (_, reply) = call(&app, Method::POST, "/v1/ws/unsubscribe", Some(body)).await;
        assert_eq!(reply.message, "Unsubscribed from ETH/USD pair updates");
        assert_eq!(
            frames.recv().await.unwrap(),
            r#"{"action":"SubRemove","subs":["5~CCCAGG~ETH~USD"]}"#
        );
        let (_, reply) = call(&app, Method::POST, "/v1/ws/unsubscribe", Some(body)).await;
        assert_eq!(reply.message, "Not subscribed to ETH/USD");
        assert!(state.ws_client.list_subscriptions().is_empty());
        assert!(session.get_session().await.unwrap().is_empty());

        state.ws_client.close().await;
    }
}
