use serde_json::Value;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::fetcher::dto::{candle_from_row, ticker_from_dto, TickerDto};
use crate::fetcher::{build_http_client, get_json};
use crate::types::{normalize_symbol, now_ms, Candle, CandleInterval, Ticker};

/// REST client for the exchange's public market-data endpoints.
#[derive(Clone)]
pub struct ExchangeClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExchangeClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 24h statistics for every listed symbol.
    pub async fn fetch_tickers(&self) -> Result<Vec<Ticker>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let items: Vec<TickerDto> = get_json(&self.client, &url, &[]).await?;
        let now = now_ms();
        let tickers: Vec<Ticker> = items.iter().filter_map(|d| ticker_from_dto(d, now)).collect();
        debug!(received = items.len(), mapped = tickers.len(), "exchange tickers fetched");
        Ok(tickers)
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let symbol = normalize_symbol(symbol);
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let dto: TickerDto = match get_json(&self.client, &url, &[("symbol", symbol.clone())]).await {
            // The exchange answers unknown symbols with 400 "Invalid symbol".
            Err(AppError::Upstream { status: 400, .. }) => {
                return Err(AppError::NotFound(format!("symbol {symbol}")))
            }
            other => other?,
        };
        ticker_from_dto(&dto, now_ms()).ok_or_else(|| AppError::NotFound(format!("symbol {symbol}")))
    }

    /// Candlesticks, oldest first.
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let symbol = normalize_symbol(symbol);
        let url = format!("{}/api/v3/klines", self.base_url);
        let query = [
            ("symbol", symbol.clone()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<Value>> = match get_json(&self.client, &url, &query).await {
            Err(AppError::Upstream { status: 400, .. }) => {
                return Err(AppError::NotFound(format!("symbol {symbol}")))
            }
            other => other?,
        };
        Ok(rows
            .iter()
            .filter_map(|row| candle_from_row(&symbol, interval, row))
            .collect())
    }
}
