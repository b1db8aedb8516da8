//! Error types for feed operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Heartbeat lost")]
    HeartbeatLost,

    #[error("Reconnect failed after {0:?}: {1}")]
    ReconnectFailed(Duration, String),

    #[error("Not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("REST request failed: {0}")]
    Rest(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::ConnectionFailed(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl From<url::ParseError> for FeedError {
    fn from(err: url::ParseError) -> Self {
        FeedError::ConnectionFailed(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FeedError::ParseError(err.to_string())
        } else {
            FeedError::Rest(err.to_string())
        }
    }
}

impl FeedError {
    /// Returns true if the upstream connection should be re-dialed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FeedError::ConnectionFailed(_)
                | FeedError::Disconnected(_)
                | FeedError::Timeout(_)
                | FeedError::HeartbeatLost
                | FeedError::NotConnected
        )
    }
}

/// Errors returned by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored value for {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors returned by a session repository.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session entry not found: {0}")]
    NotFound(String),

    #[error("session backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FeedError::HeartbeatLost.is_transient());
        assert!(FeedError::Disconnected("eof".into()).is_transient());
        assert!(!FeedError::Cancelled.is_transient());
        assert!(!FeedError::ReconnectFailed(Duration::from_secs(60), "dial".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound("BTC:USD".into());
        assert_eq!(err.to_string(), "no stored value for BTC:USD");
    }
}
