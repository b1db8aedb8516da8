//! Capability traits for the collaborators the feeds depend on.

use crate::{FeedError, SessionError, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use ticker_core::TickerData;
use tokio::sync::mpsc;

/// One-shot ticker fetch over REST.
#[async_trait]
pub trait RestClient: Send + Sync + 'static {
    async fn get(&self, from: &str, to: &str) -> Result<TickerData, FeedError>;
}

/// Persistence sink plus last-value lookup.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Inbound channel; records sent here are written asynchronously.
    fn data_pipe(&self) -> mpsc::Sender<TickerData>;

    async fn get_last(&self, from: &str, to: &str) -> Result<TickerData, StoreError>;
}

/// Key-value record of what was running, so it can be restored on restart.
///
/// Names are `FROM:TO` for poll tasks and `WS:FROM:TO` for streaming
/// subscriptions; the value is the poll interval in seconds.
#[async_trait]
pub trait SessionRepo: Send + Sync + 'static {
    async fn add_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError>;

    async fn update_task(&self, name: &str, interval_secs: u64) -> Result<(), SessionError>;

    async fn remove_task(&self, name: &str) -> Result<(), SessionError>;

    async fn get_session(&self) -> Result<HashMap<String, u64>, SessionError>;
}
