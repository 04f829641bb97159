mod alerts;
mod api;
mod config;
mod convert;
mod db;
mod error;
mod fetcher;
mod refresher;
mod repository;
mod state;
mod types;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertMonitor;
use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::convert::ConversionService;
use crate::db::{CacheWriter, TickerCache, UserStore};
use crate::error::Result;
use crate::fetcher::{AggregatorClient, ExchangeClient};
use crate::refresher::TickerRefresher;
use crate::repository::{MarketRepository, RefreshOutcome};
use crate::state::TickerStore;
use crate::types::AlertTriggered;
use crate::ws::LiveTickerStream;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Cache writer ---
    let cache = TickerCache::new(pool.clone());
    let (cache_tx, cache_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let writer = CacheWriter::new(cache.clone(), cache_rx);
    tokio::spawn(async move { writer.run().await });

    // --- Shared state ---
    let store = TickerStore::new();
    let users = UserStore::new(pool.clone());
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());

    let repo = Arc::new(MarketRepository::new(
        cfg.clone(),
        ExchangeClient::new(&cfg.exchange_api_url)?,
        AggregatorClient::new(&cfg.aggregator_api_url)?,
        cache,
        Arc::clone(&store),
        cache_tx,
        users.clone(),
        Arc::clone(&health),
        latency,
    ));

    // --- Bootstrap: cached data first, then one network refresh ---
    let cached = repo.load_cached_tickers().await?;
    info!("Loaded {cached} cached tickers");
    match repo.refresh_tickers().await {
        Ok(RefreshOutcome::Fresh(n)) => info!("Bootstrap complete: {n} tracked tickers"),
        Ok(RefreshOutcome::Cached(n)) => warn!("Bootstrap offline: serving {n} cached tickers"),
        Err(e) => warn!("Bootstrap refresh failed, starting empty: {e}"),
    }
    if let Err(e) = repo.refresh_coins().await {
        warn!("Bootstrap coin refresh failed: {e}");
    }

    let conversions = Arc::new(ConversionService::new(Arc::clone(&repo), users.clone()));
    if let Err(e) = conversions.refresh_fiat_rates().await {
        warn!("Bootstrap fiat rate refresh failed: {e}");
    }

    // --- Spawn tasks ---

    // Alert monitor: reacts to every ticker store update
    let (alert_tx, alert_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let monitor = AlertMonitor::new(Arc::clone(&store), users.clone(), alert_tx);
    tokio::spawn(async move { monitor.run().await });

    let consumer_users = users.clone();
    tokio::spawn(async move { alert_consumer(alert_rx, consumer_users).await });

    // Periodic REST refresh
    let refresher = TickerRefresher::new(
        Arc::clone(&repo),
        Arc::clone(&conversions),
        Duration::from_secs(cfg.refresh_interval_secs),
    );
    tokio::spawn(async move { refresher.run().await });

    // Live mini-ticker stream (optional)
    if cfg.live_stream {
        let live = LiveTickerStream::new(cfg.clone(), Arc::clone(&store), Arc::clone(&health));
        tokio::spawn(async move { live.run().await });
    } else {
        info!("LIVE_STREAM disabled: prices update every {}s", cfg.refresh_interval_secs);
    }

    // HTTP API server
    if cfg.api_token.is_none() {
        warn!("API_TOKEN not set: /users routes are open");
    }
    let api_state = ApiState {
        repo,
        users,
        conversions,
        api_token: cfg.api_token.as_deref().map(Arc::from),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Logs fired alerts. Users who turned notifications off only show up at debug level.
async fn alert_consumer(mut rx: mpsc::Receiver<AlertTriggered>, users: UserStore) {
    while let Some(event) = rx.recv().await {
        let a = &event.alert;
        let notify = match users.preferences(&a.user_id).await {
            Ok(prefs) => prefs.notifications_enabled,
            Err(e) => {
                warn!(user = %a.user_id, "Failed to read preferences: {e}");
                true
            }
        };
        if notify {
            info!(
                event = "ALERT_TRIGGERED",
                alert_id = a.id,
                user = %a.user_id,
                symbol = %a.symbol,
                condition = %a.condition,
                target = a.target_price,
                price = event.price,
                "ALERT | {} {} {} | price: {}",
                a.symbol, a.condition, a.target_price, event.price,
            );
        } else {
            debug!(alert_id = a.id, user = %a.user_id, "alert triggered, notifications off");
        }
    }
}
