//! Local upstream WebSocket server for tests.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub struct TestServer {
    pub url: String,
    /// (connection number, text frame) for every frame the server receives.
    pub frames: mpsc::UnboundedReceiver<(usize, String)>,
    /// Drops the current connection without a close handshake.
    pub kick: Arc<Notify>,
    /// Text pushed to every open connection.
    pub push: broadcast::Sender<String>,
    pub connections: Arc<AtomicUsize>,
}

pub async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let kick = Arc::new(Notify::new());
    let (push, _) = broadcast::channel(16);
    let connections = Arc::new(AtomicUsize::new(0));

    let (kick_srv, push_srv, connections_srv) = (kick.clone(), push.clone(), connections.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = connections_srv.fetch_add(1, Ordering::SeqCst) + 1;
            let frames_tx = frames_tx.clone();
            let kick = kick_srv.clone();
            let mut pushed = push_srv.subscribe();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                loop {
                    tokio::select! {
                        _ = kick.notified() => return,
                        text = pushed.recv() => {
                            if let Ok(text) = text {
                                let _ = ws.send(Message::Text(text)).await;
                            }
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let _ = frames_tx.send((index, text));
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                let _ = frames_tx.send((index, "CLOSED".to_string()));
                                return;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            });
        }
    });

    TestServer {
        url,
        frames,
        kick,
        push,
        connections,
    }
}
