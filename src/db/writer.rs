use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::db::cache::TickerCache;
use crate::error::Result;
use crate::types::Ticker;

#[derive(Debug, Clone)]
pub enum CacheBatch {
    Tickers(Vec<Ticker>),
}

/// Receives fetched tickers and persists them to the local cache.
/// Runs as a dedicated background task so ticker refreshes never wait on disk.
/// Coins and candles are written inline since they are read back right away.
pub struct CacheWriter {
    cache: TickerCache,
    rx: mpsc::Receiver<CacheBatch>,
}

impl CacheWriter {
    pub fn new(cache: TickerCache, rx: mpsc::Receiver<CacheBatch>) -> Self {
        Self { cache, rx }
    }

    pub async fn run(mut self) {
        while let Some(batch) = self.rx.recv().await {
            if let Err(e) = self.write(&batch).await {
                error!("Cache write error: {e}");
            }
        }
    }

    async fn write(&self, batch: &CacheBatch) -> Result<()> {
        let (kind, n) = match batch {
            CacheBatch::Tickers(t) => ("tickers", self.cache.upsert_tickers(t).await?),
        };
        debug!(kind, rows = n, "cache batch written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache::sample_ticker;
    use crate::db::test_pool;

    #[tokio::test]
    async fn drains_channel_into_cache() {
        let cache = TickerCache::new(test_pool().await);
        let (tx, rx) = mpsc::channel(4);
        let writer = CacheWriter::new(cache.clone(), rx);

        tx.send(CacheBatch::Tickers(vec![sample_ticker("BTCUSDT", 1.0, 1.0)]))
            .await
            .unwrap();
        tx.send(CacheBatch::Tickers(vec![sample_ticker("ETHUSDT", 2.0, 2.0)]))
            .await
            .unwrap();
        drop(tx);

        // run() returns once the sender side is closed and drained.
        writer.run().await;
        assert_eq!(cache.ticker_count().await.unwrap(), 2);
    }
}
