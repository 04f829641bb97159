use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::Config;
use crate::db::{CacheBatch, TickerCache, UserStore};
use crate::error::{AppError, Result};
use crate::fetcher::{AggregatorClient, ExchangeClient};
use crate::state::TickerStore;
use crate::types::{now_ms, Candle, CandleInterval, CoinInfo, CoinSearchHit, Ticker};

/// Where a refresh's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fetched from the network; `n` records.
    Fresh(usize),
    /// Network failed; serving `n` cached records.
    Cached(usize),
}

/// Fetch-or-refresh orchestration over the REST clients, the in-memory store and
/// the local cache.
pub struct MarketRepository {
    cfg: Config,
    exchange: ExchangeClient,
    aggregator: AggregatorClient,
    cache: TickerCache,
    store: Arc<TickerStore>,
    cache_tx: mpsc::Sender<CacheBatch>,
    users: UserStore,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
}

impl MarketRepository {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        exchange: ExchangeClient,
        aggregator: AggregatorClient,
        cache: TickerCache,
        store: Arc<TickerStore>,
        cache_tx: mpsc::Sender<CacheBatch>,
        users: UserStore,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self { cfg, exchange, aggregator, cache, store, cache_tx, users, health, latency }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<TickerStore> {
        &self.store
    }

    pub fn cache(&self) -> &TickerCache {
        &self.cache
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn latency(&self) -> &Arc<LatencyStats> {
        &self.latency
    }

    fn enqueue(&self, batch: CacheBatch) {
        if let Err(e) = self.cache_tx.try_send(batch) {
            warn!("Cache writer channel full: {e}");
        }
    }

    /// Seed the in-memory store from the cache so the previous session's data is
    /// served before the first refresh completes.
    pub async fn load_cached_tickers(&self) -> Result<usize> {
        let cached = self.cache.load_tickers().await?;
        Ok(self.store.upsert_many(cached).len())
    }

    // -----------------------------------------------------------------------
    // Tickers
    // -----------------------------------------------------------------------

    /// Fetch every ticker, keep the tracked ones, update the store and queue a cache
    /// write. On network failure the cache is served instead; the error surfaces only
    /// when there is nothing cached either.
    pub async fn refresh_tickers(&self) -> Result<RefreshOutcome> {
        let started = Instant::now();
        match self.exchange.fetch_tickers().await {
            Ok(all) => {
                self.latency.record(started.elapsed());
                let received = all.len();
                let tracked: Vec<Ticker> = all.into_iter().filter(|t| self.cfg.tracks(&t.symbol)).collect();
                let n = tracked.len();
                self.store.upsert_many(tracked.clone());
                self.enqueue(CacheBatch::Tickers(tracked));
                self.health.record_refresh_ok(now_ms());
                info!(received, tracked = n, elapsed_ms = started.elapsed().as_millis() as u64, "Ticker refresh complete");
                Ok(RefreshOutcome::Fresh(n))
            }
            Err(e) => {
                self.health.record_refresh_failure();
                if self.store.is_empty() {
                    self.load_cached_tickers().await?;
                }
                if self.store.is_empty() {
                    return Err(e);
                }
                warn!(cached = self.store.len(), "Ticker refresh failed, serving cache: {e}");
                Ok(RefreshOutcome::Cached(self.store.len()))
            }
        }
    }

    pub async fn tickers(&self) -> Result<Vec<Ticker>> {
        if !self.store.is_empty() {
            return Ok(self.store.all());
        }
        self.cache.load_tickers().await
    }

    /// Store, then cache, then network. Untracked symbols are answered but never kept.
    pub async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        if let Some(t) = self.store.get(symbol) {
            return Ok(t);
        }
        if let Some(t) = self.cache.get_ticker(symbol).await? {
            return Ok(t);
        }
        let t = self.exchange.fetch_ticker(symbol).await?;
        if self.cfg.tracks(&t.symbol) {
            self.store.upsert(t.clone());
            self.enqueue(CacheBatch::Tickers(vec![t.clone()]));
        }
        Ok(t)
    }

    /// Candles from the network, written through to the cache. Falls back to cached
    /// candles when the network is unavailable.
    pub async fn candles(&self, symbol: &str, interval: CandleInterval, limit: u32) -> Result<Vec<Candle>> {
        match self.exchange.fetch_candles(symbol, interval, limit).await {
            Ok(candles) => {
                // Written synchronously so the fallback below always has the latest rows.
                self.cache.upsert_candles(&candles).await?;
                Ok(candles)
            }
            Err(e @ (AppError::NotFound(_) | AppError::InvalidInput(_))) => Err(e),
            Err(e) => {
                let cached = self.cache.load_candles(symbol, interval, limit).await?;
                if cached.is_empty() {
                    return Err(e);
                }
                warn!(symbol, %interval, cached = cached.len(), "Candle fetch failed, serving cache: {e}");
                Ok(cached)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Coins
    // -----------------------------------------------------------------------

    pub async fn refresh_coins(&self) -> Result<RefreshOutcome> {
        let started = Instant::now();
        match self
            .aggregator
            .fetch_markets(&self.cfg.vs_currency, 1, self.cfg.coin_page_size)
            .await
        {
            Ok(coins) => {
                self.latency.record(started.elapsed());
                let n = coins.len();
                self.cache.upsert_coins(&coins).await?;
                info!(coins = n, "Coin refresh complete");
                Ok(RefreshOutcome::Fresh(n))
            }
            Err(e) => {
                let cached = self.cache.load_coins().await?.len();
                if cached == 0 {
                    return Err(e);
                }
                warn!(cached, "Coin refresh failed, serving cache: {e}");
                Ok(RefreshOutcome::Cached(cached))
            }
        }
    }

    pub async fn coins(&self) -> Result<Vec<CoinInfo>> {
        self.cache.load_coins().await
    }

    /// Spot prices of the given coin ids in each fiat currency.
    pub async fn simple_prices(
        &self,
        ids: &[String],
        vs_currencies: &[String],
    ) -> Result<crate::fetcher::aggregator::SimplePrices> {
        self.aggregator.fetch_simple_prices(ids, vs_currencies).await
    }

    /// Aggregator search. The query is added to the user's search history when a user
    /// is given; failing to record it does not fail the search.
    pub async fn search(&self, user_id: Option<&str>, query: &str) -> Result<Vec<CoinSearchHit>> {
        let hits = self.aggregator.search(query).await?;
        if let Some(user) = user_id {
            if let Err(e) = self.users.record_search(user, query).await {
                warn!(user, "Failed to record search: {e}");
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::fetcher::serve_fake;
    use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn tickers(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        if let Some(symbol) = q.get("symbol") {
            return Json(json!({ "symbol": symbol, "lastPrice": "0.05", "closeTime": 20 }));
        }
        Json(json!([
            { "symbol": "BTCUSDT", "lastPrice": "64000", "quoteVolume": "900", "closeTime": 10 },
            { "symbol": "ETHUSDT", "lastPrice": "3000", "quoteVolume": "500", "closeTime": 10 },
            { "symbol": "ETHBTC", "lastPrice": "0.05", "quoteVolume": "5", "closeTime": 10 }
        ]))
    }

    async fn markets() -> Json<Value> {
        Json(json!([
            { "id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 64000.0, "market_cap_rank": 1 },
            { "id": "tether", "symbol": "usdt", "name": "Tether", "current_price": 1.0, "market_cap_rank": 3 }
        ]))
    }

    async fn klines() -> Json<Value> {
        Json(json!([[1000, "1", "2", "0.5", "1.5", "10", 1999]]))
    }

    async fn search() -> Json<Value> {
        Json(json!({ "coins": [{ "id": "bitcoin", "symbol": "BTC", "name": "Bitcoin" }] }))
    }

    async fn unavailable() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    pub(crate) fn healthy_upstream() -> Router {
        Router::new()
            .route("/api/v3/ticker/24hr", get(tickers))
            .route("/api/v3/klines", get(klines))
            .route("/coins/markets", get(markets))
            .route("/search", get(search))
    }

    pub(crate) fn broken_upstream() -> Router {
        Router::new()
            .route("/api/v3/ticker/24hr", get(unavailable))
            .route("/api/v3/klines", get(unavailable))
            .route("/coins/markets", get(unavailable))
    }

    /// Repository wired to a fake upstream and an in-memory database. The cache writer
    /// task is spawned so queued batches land in the cache.
    pub(crate) async fn repo_with(router: Router) -> (Arc<MarketRepository>, sqlx::SqlitePool) {
        let base = serve_fake(router).await;
        let pool = test_pool().await;
        let cfg = Config::for_tests(&base, &base);
        let cache = TickerCache::new(pool.clone());
        let (cache_tx, cache_rx) = mpsc::channel(16);
        tokio::spawn(crate::db::CacheWriter::new(cache.clone(), cache_rx).run());
        let repo = MarketRepository::new(
            cfg,
            ExchangeClient::new(&base).unwrap(),
            AggregatorClient::new(&base).unwrap(),
            cache,
            TickerStore::new(),
            cache_tx,
            UserStore::new(pool.clone()),
            Arc::new(HealthState::new()),
            Arc::new(LatencyStats::new()),
        );
        (Arc::new(repo), pool)
    }

    #[tokio::test]
    async fn refresh_keeps_only_tracked_symbols() {
        let (repo, _) = repo_with(healthy_upstream()).await;
        assert_eq!(repo.refresh_tickers().await.unwrap(), RefreshOutcome::Fresh(2));
        let symbols: Vec<String> = repo.tickers().await.unwrap().into_iter().map(|t| t.symbol).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(repo.health.refreshes_ok(), 1);
        assert_eq!(repo.latency.len(), 1);
    }

    #[tokio::test]
    async fn untracked_ticker_lookup_is_not_kept() {
        let (repo, _) = repo_with(healthy_upstream()).await;
        repo.refresh_tickers().await.unwrap();

        let t = repo.ticker("ethbtc").await.unwrap();
        assert_eq!(t.symbol, "ETHBTC");
        assert_eq!(t.last_price, 0.05);

        // Give the cache writer a chance to run before checking nothing was queued.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let symbols: Vec<String> = repo.tickers().await.unwrap().into_iter().map(|t| t.symbol).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(repo.cache.get_ticker("ETHBTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_cache() {
        let (repo, pool) = repo_with(broken_upstream()).await;
        assert!(repo.refresh_tickers().await.is_err(), "nothing cached yet");

        TickerCache::new(pool)
            .upsert_tickers(&[crate::db::cache::sample_ticker("BTCUSDT", 1.0, 1.0)])
            .await
            .unwrap();
        assert_eq!(repo.refresh_tickers().await.unwrap(), RefreshOutcome::Cached(1));
        assert_eq!(repo.health.consecutive_failures(), 2);
        assert_eq!(repo.ticker("btcusdt").await.unwrap().last_price, 1.0);
    }

    #[tokio::test]
    async fn candles_write_through_and_fall_back() {
        let (repo, pool) = repo_with(healthy_upstream()).await;
        let fresh = repo.candles("BTCUSDT", CandleInterval::OneHour, 10).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(
            repo.cache.load_candles("BTCUSDT", CandleInterval::OneHour, 10).await.unwrap(),
            fresh
        );

        let (broken, _) = repo_with(broken_upstream()).await;
        assert!(broken.candles("BTCUSDT", CandleInterval::OneHour, 10).await.is_err());

        // Same database, broken network: cached rows are served.
        let offline = MarketRepository { cache: TickerCache::new(pool), ..clone_repo(&broken) };
        let cached = offline.candles("BTCUSDT", CandleInterval::OneHour, 10).await.unwrap();
        assert_eq!(cached, fresh);
    }

    fn clone_repo(r: &MarketRepository) -> MarketRepository {
        MarketRepository {
            cfg: r.cfg.clone(),
            exchange: r.exchange.clone(),
            aggregator: r.aggregator.clone(),
            cache: r.cache.clone(),
            store: Arc::clone(&r.store),
            cache_tx: r.cache_tx.clone(),
            users: r.users.clone(),
            health: Arc::clone(&r.health),
            latency: Arc::clone(&r.latency),
        }
    }

    #[tokio::test]
    async fn coins_refresh_and_search_records_history() {
        let (repo, pool) = repo_with(healthy_upstream()).await;
        assert_eq!(repo.refresh_coins().await.unwrap(), RefreshOutcome::Fresh(2));
        assert_eq!(repo.coins().await.unwrap()[0].id, "bitcoin");

        let hits = repo.search(Some("alice"), "Bit").await.unwrap();
        assert_eq!(hits.len(), 1);
        let history = UserStore::new(pool).search_history("alice", 10).await.unwrap();
        assert_eq!(history[0].query, "bit");
    }
}
