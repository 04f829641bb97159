use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::config::LISTENER_CAPACITY;
use crate::types::{normalize_symbol, Ticker};

// ---------------------------------------------------------------------------
// TickerStore
// ---------------------------------------------------------------------------

/// Latest ticker per symbol, shared by the refresher, the live stream, the alert
/// monitor and the API. Readers never touch the database.
pub struct TickerStore {
    /// symbol → latest snapshot
    tickers: DashMap<String, Ticker>,
    /// symbol → last price before the most recent update
    previous: DashMap<String, f64>,
    /// Symbols touched by each upsert batch.
    updates: broadcast::Sender<Vec<String>>,
}

impl TickerStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.updates.subscribe()
    }

    pub fn upsert(&self, ticker: Ticker) {
        self.upsert_many(vec![ticker]);
    }

    /// Replace snapshots for every ticker in the batch. A snapshot older than the one
    /// already held is ignored so a slow REST refresh can't overwrite a newer
    /// live-stream update. Returns the symbols that changed.
    pub fn upsert_many(&self, tickers: Vec<Ticker>) -> Vec<String> {
        let mut touched = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            if let Some(existing) = self.tickers.get(&ticker.symbol) {
                if existing.updated_at > ticker.updated_at {
                    continue;
                }
                self.previous.insert(ticker.symbol.clone(), existing.last_price);
            }
            touched.push(ticker.symbol.clone());
            self.tickers.insert(ticker.symbol.clone(), ticker);
        }
        if !touched.is_empty() {
            let _ = self.updates.send(touched.clone());
        }
        touched
    }

    pub fn get(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.get(&normalize_symbol(symbol)).map(|t| t.clone())
    }

    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        self.tickers
            .get(&normalize_symbol(symbol))
            .map(|t| t.last_price)
            .filter(|p| *p > 0.0)
    }

    /// Price before the latest update, if the symbol has been updated at least twice.
    pub fn previous_price(&self, symbol: &str) -> Option<f64> {
        self.previous.get(&normalize_symbol(symbol)).map(|p| *p)
    }

    /// Every ticker, most traded (quote volume) first.
    pub fn all(&self) -> Vec<Ticker> {
        let mut all: Vec<Ticker> = self.tickers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            b.quote_volume
                .total_cmp(&a.quote_volume)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

impl Default for TickerStore {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            tickers: DashMap::new(),
            previous: DashMap::new(),
            updates,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, price: f64, quote_volume: f64, updated_at: i64) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            price_change: 0.0,
            price_change_percent: 0.0,
            high_price: price,
            low_price: price,
            volume: 0.0,
            quote_volume,
            updated_at,
        }
    }

    #[test]
    fn upsert_tracks_previous_price() {
        let store = TickerStore::new();
        store.upsert(ticker("BTCUSDT", 100.0, 1.0, 1));
        assert_eq!(store.previous_price("BTCUSDT"), None);

        store.upsert(ticker("BTCUSDT", 110.0, 1.0, 2));
        assert_eq!(store.price_of("btcusdt"), Some(110.0));
        assert_eq!(store.previous_price("BTCUSDT"), Some(100.0));
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let store = TickerStore::new();
        store.upsert(ticker("BTCUSDT", 110.0, 1.0, 10));
        let touched = store.upsert_many(vec![ticker("BTCUSDT", 90.0, 1.0, 5)]);
        assert!(touched.is_empty());
        assert_eq!(store.price_of("BTCUSDT"), Some(110.0));
    }

    #[test]
    fn zero_price_reads_as_missing() {
        let store = TickerStore::new();
        store.upsert(ticker("DEADUSDT", 0.0, 0.0, 1));
        assert!(store.get("DEADUSDT").is_some());
        assert_eq!(store.price_of("DEADUSDT"), None);
    }

    #[test]
    fn all_sorted_by_quote_volume() {
        let store = TickerStore::new();
        store.upsert_many(vec![
            ticker("AUSDT", 1.0, 5.0, 1),
            ticker("BUSDT", 1.0, 50.0, 1),
            ticker("CUSDT", 1.0, 5.0, 1),
        ]);
        let symbols: Vec<String> = store.all().into_iter().map(|t| t.symbol).collect();
        assert_eq!(symbols, vec!["BUSDT", "AUSDT", "CUSDT"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_touched_symbols() {
        let store = TickerStore::new();
        let mut rx = store.subscribe();
        store.upsert_many(vec![ticker("AUSDT", 1.0, 1.0, 1), ticker("BUSDT", 1.0, 1.0, 1)]);
        assert_eq!(rx.recv().await.unwrap(), vec!["AUSDT".to_string(), "BUSDT".to_string()]);
    }
}
