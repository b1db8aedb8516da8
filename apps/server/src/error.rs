//! Server error types.

use thiserror::Error;
use ticker_feeds::{FeedError, SessionError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(r#"invalid request: request should look like {{"fsym":"CRYPTO","tsym":"COMMON"}}"#)]
    InvalidRequest,

    #[error("unknown symbol in pair {0}")]
    UnknownSymbol(String),

    #[error("failed to get price")]
    PriceUnavailable,
}
