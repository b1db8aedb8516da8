//! In-memory last-value store.
//!
//! Records arrive on the inbound pipe and are written by a background task;
//! only the latest record per pair is kept.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use ticker_core::{pair_key, TickerData};
use ticker_feeds::{Database, StoreError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct LastValueStore {
    pipe: mpsc::Sender<TickerData>,
    last: Arc<DashMap<String, TickerData>>,
}

impl LastValueStore {
    /// Create the store and spawn its writer task.
    pub fn spawn(capacity: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (pipe, mut inbound) = mpsc::channel::<TickerData>(capacity);
        let last = Arc::new(DashMap::new());
        let next_id = AtomicI64::new(0);

        let writer_last = last.clone();
        let writer = tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    data = inbound.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let key = data.key();
                debug!("Stored {} #{} price={}", key, id, data.price);
                writer_last.insert(key, data.with_id(id));
            }
            debug!("Store writer stopped");
        });

        (Self { pipe, last }, writer)
    }
}

#[async_trait]
impl Database for LastValueStore {
    fn data_pipe(&self) -> mpsc::Sender<TickerData> {
        self.pipe.clone()
    }

    async fn get_last(&self, from: &str, to: &str) -> Result<TickerData, StoreError> {
        let key = pair_key(from, to);
        self.last
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(key))
    }
}
