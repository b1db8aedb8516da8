//! One-shot price lookup.

use crate::error::ServerError;
use ticker_core::TickerData;
use ticker_feeds::{Database, RestClient};
use tracing::{debug, warn};

/// Fetch the live price, falling back to the last stored value.
///
/// A successful live fetch is also forwarded to the store.
pub async fn last_price(
    rest: &dyn RestClient,
    db: &dyn Database,
    from: &str,
    to: &str,
) -> Result<TickerData, ServerError> {
    match rest.get(from, to).await {
        Ok(data) => {
            if db.data_pipe().send(data.clone()).await.is_err() {
                warn!("Store pipe closed, {}/{} not persisted", from, to);
            }
            return Ok(data);
        }
        Err(e) => debug!("Live price for {}/{} unavailable: {}", from, to, e),
    }

    db.get_last(from, to).await.map_err(|e| {
        debug!("No stored price for {}/{}: {}", from, to, e);
        ServerError::PriceUnavailable
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LastValueStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use ticker_feeds::FeedError;
    use tokio_util::sync::CancellationToken;

    struct FixedRest(Option<f64>);

    #[async_trait]
    impl RestClient for FixedRest {
        async fn get(&self, from: &str, to: &str) -> Result<TickerData, FeedError> {
            match self.0 {
                Some(price) => Ok(TickerData {
                    price,
                    ..TickerData::new(from, to)
                }),
                None => Err(FeedError::Rest("HTTP 503".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_live_price_is_persisted() {
        let (store, _writer) = LastValueStore::spawn(8, CancellationToken::new());
        let data = last_price(&FixedRest(Some(42.0)), &store, "BTC", "USD").await.unwrap();
        assert_eq!(data.price, 42.0);

        // Rest now down: the forwarded record is served from the store.
        let mut fallback = None;
        for _ in 0..100 {
            if let Ok(data) = last_price(&FixedRest(None), &store, "BTC", "USD").await {
                fallback = Some(data);
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fallback.map(|d| d.price), Some(42.0));
    }

    #[tokio::test]
    async fn test_no_live_and_no_stored_price() {
        let (store, _writer) = LastValueStore::spawn(8, CancellationToken::new());
        let err = last_price(&FixedRest(None), &store, "ETH", "EUR").await.unwrap_err();
        assert!(matches!(err, ServerError::PriceUnavailable));
        assert_eq!(err.to_string(), "failed to get price");
    }
}
