use crate::error::{AppError, Result};

pub const EXCHANGE_API_URL: &str = "https://api.binance.com";
pub const EXCHANGE_WS_URL: &str = "wss://stream.binance.com:9443/ws/!miniTicker@arr";
pub const AGGREGATOR_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Timeout applied to every upstream REST request (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 15;

/// Heartbeat ping interval for the live ticker stream (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[500, 1_000, 2_000, 5_000];

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the user-store change broadcast. Lagging listeners re-read a snapshot.
pub const LISTENER_CAPACITY: usize = 256;

/// Coins are refreshed once every this many ticker refresh cycles.
pub const COIN_REFRESH_EVERY_CYCLES: u64 = 10;

/// Default and maximum number of candles requested per call.
pub const DEFAULT_CANDLE_LIMIT: u32 = 100;
pub const MAX_CANDLE_LIMIT: u32 = 1000;

/// Per-user cap for conversion and search history rows.
pub const HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange_api_url: String,
    pub exchange_ws_url: String,
    pub aggregator_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Bearer token required on `/users/*` routes when set (API_TOKEN).
    pub api_token: Option<String>,
    /// Tickers are kept only for symbols quoted in this asset (QUOTE_ASSET).
    pub quote_asset: String,
    /// Explicit symbol list; overrides the quote-asset filter when non-empty (TRACKED_SYMBOLS).
    pub tracked_symbols: Vec<String>,
    /// Fiat currency the aggregator prices coins in (VS_CURRENCY).
    pub vs_currency: String,
    /// Number of coins fetched from the aggregator markets endpoint (COIN_PAGE_SIZE).
    pub coin_page_size: u32,
    /// Ticker refresh interval (REFRESH_INTERVAL_SECS).
    pub refresh_interval_secs: u64,
    /// Subscribe to the exchange mini-ticker stream (LIVE_STREAM).
    pub live_stream: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            exchange_api_url: std::env::var("EXCHANGE_API_URL")
                .unwrap_or_else(|_| EXCHANGE_API_URL.to_string()),
            exchange_ws_url: std::env::var("EXCHANGE_WS_URL")
                .unwrap_or_else(|_| EXCHANGE_WS_URL.to_string()),
            aggregator_api_url: std::env::var("AGGREGATOR_API_URL")
                .unwrap_or_else(|_| AGGREGATOR_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "tracker.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            api_token: std::env::var("API_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            quote_asset: std::env::var("QUOTE_ASSET")
                .unwrap_or_else(|_| "USDT".to_string())
                .trim()
                .to_uppercase(),
            tracked_symbols: parse_symbol_list(&std::env::var("TRACKED_SYMBOLS").unwrap_or_default()),
            vs_currency: std::env::var("VS_CURRENCY")
                .unwrap_or_else(|_| "usd".to_string())
                .trim()
                .to_lowercase(),
            coin_page_size: std::env::var("COIN_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<u32>()
                .unwrap_or(100)
                .clamp(1, 250),
            refresh_interval_secs: std::env::var("REFRESH_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30)
                .max(1),
            live_stream: std::env::var("LIVE_STREAM")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    /// True if a ticker symbol should be kept by the refresh cycle.
    pub fn tracks(&self, symbol: &str) -> bool {
        if self.tracked_symbols.is_empty() {
            symbol.ends_with(&self.quote_asset)
        } else {
            self.tracked_symbols.iter().any(|s| s == symbol)
        }
    }
}

/// Split a comma-separated list into normalized symbols, dropping blanks.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
impl Config {
    /// Config pointing at local fake upstreams.
    pub fn for_tests(exchange_api_url: &str, aggregator_api_url: &str) -> Self {
        Self {
            exchange_api_url: exchange_api_url.to_string(),
            exchange_ws_url: String::new(),
            aggregator_api_url: aggregator_api_url.to_string(),
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            api_token: None,
            quote_asset: "USDT".to_string(),
            tracked_symbols: Vec::new(),
            vs_currency: "usd".to_string(),
            coin_page_size: 100,
            refresh_interval_secs: 30,
            live_stream: false,
        }
    }
}
