//! Market data collection: reconnecting upstream WebSocket client,
//! REST poll scheduler and the exchange adapters behind them.
//!
//! ## Architecture
//!
//! - `websocket` - `WsClient`, one shared upstream connection for many subscriptions
//! - `puller` - `Puller`, one jittered REST poll task per pair
//! - `protocol` / `client` - seams for exchange adapters and collaborators
//! - `adapter/` - exchange-specific REST and streaming adapters

pub mod adapter;
pub mod client;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod puller;
pub mod session;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use adapter::{CryptoCompareRest, CryptoCompareWs, KrakenRest, KrakenWs};
pub use client::*;
pub use error::*;
pub use heartbeat::*;
pub use protocol::*;
pub use puller::*;
pub use session::*;
pub use websocket::*;
