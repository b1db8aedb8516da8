//! Upstream protocol strategy.

use crate::{FeedError, UpstreamConnection};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use tokio_tungstenite::tungstenite::Message;

/// Exchange-specific framing and decoding plugged into [`crate::WsClient`].
///
/// The client owns the socket and the subscription registry; the protocol
/// only knows how to name channels, encode control frames and turn incoming
/// frames into [`ticker_core::TickerData`].
#[async_trait]
pub trait UpstreamProtocol: Send + Sync + 'static {
    /// Channel name for a pair. Symbols arrive upper-cased.
    fn channel_name(&self, from: &str, to: &str) -> String;

    fn subscribe_message(&self, channel: &str, id: i64) -> Result<Message, FeedError>;

    fn unsubscribe_message(&self, channel: &str, id: i64) -> Result<Message, FeedError>;

    /// Liveness ping frame. `channel` is empty for connection-level pings.
    fn ping_message(&self, _channel: &str, id: i64) -> Result<Message, FeedError> {
        Ok(Message::Ping(id.to_be_bytes().to_vec()))
    }

    fn pong_message(&self, _channel: &str, id: i64) -> Result<Message, FeedError> {
        Ok(Message::Pong(id.to_be_bytes().to_vec()))
    }

    /// Read loop for one connection lifetime.
    ///
    /// Must return once `cancel` fires. Read failures should go through
    /// [`UpstreamConnection::recover`]; if that fails the loop returns and the
    /// next subscribe re-dials.
    async fn handle_messages(&self, conn: UpstreamConnection, cancel: CancellationToken);
}
