use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::config::COIN_REFRESH_EVERY_CYCLES;
use crate::convert::ConversionService;
use crate::repository::{MarketRepository, RefreshOutcome};

/// Periodic REST refresh. Tickers refresh every cycle; coin listings and fiat rates
/// change slowly and refresh every `COIN_REFRESH_EVERY_CYCLES` cycles.
pub struct TickerRefresher {
    repo: Arc<MarketRepository>,
    conversions: Arc<ConversionService>,
    every: Duration,
}

impl TickerRefresher {
    pub fn new(repo: Arc<MarketRepository>, conversions: Arc<ConversionService>, every: Duration) -> Self {
        Self { repo, conversions, every }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.every);
        ticker.tick().await; // skip immediate first tick, bootstrap already refreshed

        let mut cycle: u64 = 0;
        loop {
            ticker.tick().await;
            cycle += 1;
            self.tick(cycle).await;
        }
    }

    async fn tick(&self, cycle: u64) {
        match self.repo.refresh_tickers().await {
            Ok(RefreshOutcome::Fresh(n)) => debug!(cycle, tickers = n, "refresh cycle"),
            Ok(RefreshOutcome::Cached(n)) => warn!(cycle, cached = n, "Ticker refresh served from cache"),
            Err(e) => error!("Ticker refresh failed: {e}"),
        }

        if cycle % COIN_REFRESH_EVERY_CYCLES != 0 {
            return;
        }
        if let Err(e) = self.repo.refresh_coins().await {
            error!("Coin refresh failed: {e}");
        }
        if let Err(e) = self.conversions.refresh_fiat_rates().await {
            error!("Fiat rate refresh failed: {e}");
        }
    }
}
