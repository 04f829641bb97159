use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::UserStore;
use crate::error::{AppError, Result};
use crate::repository::MarketRepository;
use crate::types::{normalize_symbol, CoinInfo, ConversionRecord, Ticker};

/// Fiat currencies offered for conversion besides the pivot.
pub const FIAT_CURRENCIES: &[&str] = &["usd", "eur", "gbp", "jpy", "chf", "cad", "aud", "cny", "inr", "rub"];

/// Coin whose multi-currency price derives the fiat cross rates.
const FIAT_REFERENCE_COIN: &str = "bitcoin";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Conversion {
    pub amount: f64,
    pub result: f64,
    pub rate: f64,
}

/// Prices of currencies expressed in a single pivot currency.
#[derive(Debug, Clone)]
pub struct RateTable {
    pivot: String,
    prices: HashMap<String, f64>,
}

impl RateTable {
    pub fn new(pivot: &str) -> Self {
        let pivot = normalize_symbol(pivot);
        let mut prices = HashMap::new();
        prices.insert(pivot.clone(), 1.0);
        Self { pivot, prices }
    }

    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    /// Set (overwrite) a price. Non-positive and non-finite prices are ignored.
    pub fn insert(&mut self, currency: &str, price_in_pivot: f64) {
        if price_in_pivot.is_finite() && price_in_pivot > 0.0 {
            self.prices.insert(normalize_symbol(currency), price_in_pivot);
        }
    }

    /// Set a price only if the currency has none yet.
    pub fn insert_if_absent(&mut self, currency: &str, price_in_pivot: f64) {
        if !self.prices.contains_key(&normalize_symbol(currency)) {
            self.insert(currency, price_in_pivot);
        }
    }

    pub fn price(&self, currency: &str) -> Option<f64> {
        self.prices.get(&normalize_symbol(currency)).copied()
    }

    pub fn currencies(&self) -> Vec<String> {
        let mut all: Vec<String> = self.prices.keys().cloned().collect();
        all.sort();
        all
    }

    /// Coin prices from the aggregator, already in the pivot currency. When several
    /// coins share a symbol the best-ranked one wins, so `coins` should be in rank order.
    pub fn add_coins(&mut self, coins: &[CoinInfo]) {
        for c in coins {
            self.insert_if_absent(&c.symbol, c.current_price);
        }
    }

    /// Exchange tickers quoted in `quote_asset`. Requires the quote asset itself to be
    /// priced already (e.g. from the aggregator); tickers override aggregator prices
    /// because they are fresher.
    pub fn add_tickers(&mut self, tickers: &[Ticker], quote_asset: &str) {
        let quote_asset = normalize_symbol(quote_asset);
        let Some(quote_price) = self.price(&quote_asset) else {
            debug!(quote_asset, "quote asset has no price, skipping tickers");
            return;
        };
        for t in tickers {
            if let Some(base) = t.symbol.strip_suffix(quote_asset.as_str()) {
                if !base.is_empty() {
                    self.insert(base, t.last_price * quote_price);
                }
            }
        }
    }

    /// Convert `amount` of `from` into `to`.
    pub fn convert(&self, amount: f64, from: &str, to: &str) -> Result<Conversion> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(AppError::InvalidInput("amount must be a non-negative number".to_string()));
        }
        let from = normalize_symbol(from);
        let to = normalize_symbol(to);
        if from.is_empty() || to.is_empty() {
            return Err(AppError::InvalidInput("currency must not be empty".to_string()));
        }
        if from == to {
            return Ok(Conversion { amount, result: amount, rate: 1.0 });
        }
        let from_price = self
            .price(&from)
            .ok_or_else(|| AppError::NotFound(format!("no rate for {from}")))?;
        let to_price = self
            .price(&to)
            .ok_or_else(|| AppError::NotFound(format!("no rate for {to}")))?;
        let rate = from_price / to_price;
        Ok(Conversion { amount, result: amount * rate, rate })
    }
}

/// Builds rate tables from current market data and records user conversions.
pub struct ConversionService {
    repo: Arc<MarketRepository>,
    users: UserStore,
    /// Fiat currency → price in the pivot currency.
    fiat_rates: DashMap<String, f64>,
}

impl ConversionService {
    pub fn new(repo: Arc<MarketRepository>, users: UserStore) -> Self {
        Self { repo, users, fiat_rates: DashMap::new() }
    }

    /// Derive fiat cross rates from the reference coin's price in every fiat:
    /// `price(fiat) = price(coin, pivot) / price(coin, fiat)`.
    pub async fn refresh_fiat_rates(&self) -> Result<usize> {
        let pivot = self.repo.config().vs_currency.to_lowercase();
        let currencies: Vec<String> = FIAT_CURRENCIES.iter().map(|c| c.to_string()).collect();
        let prices = self
            .repo
            .simple_prices(&[FIAT_REFERENCE_COIN.to_string()], &currencies)
            .await?;
        let Some(reference) = prices.get(FIAT_REFERENCE_COIN) else {
            return Ok(0);
        };
        let Some(&in_pivot) = reference.get(&pivot) else {
            return Ok(0);
        };
        for (fiat, &in_fiat) in reference {
            if in_fiat > 0.0 && in_pivot > 0.0 {
                self.fiat_rates.insert(normalize_symbol(fiat), in_pivot / in_fiat);
            }
        }
        info!(fiat = self.fiat_rates.len(), "Fiat rates refreshed");
        Ok(self.fiat_rates.len())
    }

    pub async fn rate_table(&self) -> Result<RateTable> {
        let cfg = self.repo.config();
        let mut table = RateTable::new(&cfg.vs_currency);
        for entry in self.fiat_rates.iter() {
            table.insert(entry.key(), *entry.value());
        }
        table.add_coins(&self.repo.coins().await?);
        if cfg.quote_asset == table.pivot() {
            table.insert(&cfg.quote_asset, 1.0);
        }
        table.add_tickers(&self.repo.tickers().await?, &cfg.quote_asset);
        Ok(table)
    }

    pub async fn convert(&self, amount: f64, from: &str, to: &str) -> Result<Conversion> {
        self.rate_table().await?.convert(amount, from, to)
    }

    /// Convert and append the result to the user's conversion history.
    pub async fn convert_for(&self, user_id: &str, amount: f64, from: &str, to: &str) -> Result<ConversionRecord> {
        let c = self.convert(amount, from, to).await?;
        self.users
            .record_conversion(user_id, &normalize_symbol(from), &normalize_symbol(to), c.amount, c.result, c.rate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache::sample_ticker;
    use crate::repository::tests::{healthy_upstream, repo_with};
    use axum::{routing::get, Json};
    use serde_json::json;

    fn coin(id: &str, symbol: &str, price: f64, rank: i64) -> CoinInfo {
        CoinInfo {
            id: id.to_string(),
            symbol: symbol.to_string(),
            name: id.to_string(),
            image: None,
            current_price: price,
            market_cap: 0.0,
            market_cap_rank: Some(rank),
            price_change_percentage_24h: 0.0,
            total_volume: 0.0,
            updated_at: 0,
        }
    }

    #[test]
    fn same_currency_is_identity() {
        let table = RateTable::new("usd");
        let c = table.convert(12.5, "usd", " USD ").unwrap();
        assert_eq!(c, Conversion { amount: 12.5, result: 12.5, rate: 1.0 });
    }

    #[test]
    fn converts_through_pivot() {
        let mut table = RateTable::new("USD");
        table.insert("BTC", 60_000.0);
        table.insert("ETH", 3_000.0);

        let c = table.convert(2.0, "btc", "eth").unwrap();
        assert!((c.rate - 20.0).abs() < 1e-9);
        assert!((c.result - 40.0).abs() < 1e-9);

        let back = table.convert(3_000.0, "USD", "ETH").unwrap();
        assert!((back.result - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_amounts_and_unknown_currencies() {
        let mut table = RateTable::new("USD");
        table.insert("BTC", 60_000.0);
        assert!(matches!(table.convert(-1.0, "BTC", "USD"), Err(AppError::InvalidInput(_))));
        assert!(matches!(table.convert(f64::NAN, "BTC", "USD"), Err(AppError::InvalidInput(_))));
        assert!(matches!(table.convert(1.0, "BTC", "XYZ"), Err(AppError::NotFound(_))));
        assert!(matches!(table.convert(1.0, "", "USD"), Err(AppError::InvalidInput(_))));
        assert_eq!(table.convert(0.0, "BTC", "USD").unwrap().result, 0.0);
    }

    #[test]
    fn zero_prices_are_never_stored() {
        let mut table = RateTable::new("USD");
        table.insert("DEAD", 0.0);
        table.insert("NAN", f64::NAN);
        assert_eq!(table.price("DEAD"), None);
        assert_eq!(table.currencies(), vec!["USD".to_string()]);
    }

    #[test]
    fn best_ranked_coin_wins_symbol_clash_and_tickers_override() {
        let mut table = RateTable::new("USD");
        table.add_coins(&[
            coin("bitcoin", "BTC", 60_000.0, 1),
            coin("bitcoin-fake", "BTC", 0.01, 900),
            coin("tether", "USDT", 1.0, 3),
        ]);
        assert_eq!(table.price("BTC"), Some(60_000.0));

        table.add_tickers(
            &[sample_ticker("BTCUSDT", 61_000.0, 1.0), sample_ticker("USDT", 5.0, 1.0)],
            "USDT",
        );
        assert_eq!(table.price("BTC"), Some(61_000.0));
        assert_eq!(table.price("USDT"), Some(1.0), "bare quote symbol is not a pair");
    }

    #[test]
    fn tickers_skipped_without_quote_price() {
        let mut table = RateTable::new("EUR");
        table.add_tickers(&[sample_ticker("BTCUSDT", 61_000.0, 1.0)], "USDT");
        assert_eq!(table.price("BTC"), None);
    }

    #[tokio::test]
    async fn service_builds_table_and_records_history() {
        let router = healthy_upstream().route(
            "/simple/price",
            get(|| async { Json(json!({ "bitcoin": { "usd": 64000.0, "eur": 58000.0 } })) }),
        );
        let (repo, pool) = repo_with(router).await;
        repo.refresh_tickers().await.unwrap();
        repo.refresh_coins().await.unwrap();

        let users = UserStore::new(pool);
        let service = ConversionService::new(Arc::clone(&repo), users.clone());
        assert_eq!(service.refresh_fiat_rates().await.unwrap(), 2);

        let record = service.convert_for("alice", 1.0, "btc", "eur").await.unwrap();
        assert_eq!(record.from_currency, "BTC");
        assert_eq!(record.to_currency, "EUR");
        // BTC from the ticker (64000 USDT * 1.0), EUR = 64000/58000 USD.
        let expected = 64_000.0 / (64_000.0 / 58_000.0);
        assert!((record.result - expected).abs() < 1e-6, "result {}", record.result);

        let history = users.conversion_history("alice", 10).await.unwrap();
        assert_eq!(history.len(), 1);

        assert!(matches!(service.convert(1.0, "BTC", "DOGE").await, Err(AppError::NotFound(_))));
    }
}
