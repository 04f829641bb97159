use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror routes.rs shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct TickerResponse {
    pub symbol: String,
    pub last_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub quote_volume: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct WatchlistEntryResponse {
    pub symbol: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct AlertResponse {
    pub id: i64,
    pub symbol: String,
    pub condition: String,
    pub target_price: f64,
    pub triggered: bool,
    pub triggered_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct HealthResponse {
    pub status: Option<String>,
    pub live_connected: Option<bool>,
    pub last_refresh_at_ms: Option<i64>,
    pub consecutive_failures: Option<u64>,
    pub tickers_in_memory: Option<i64>,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

/// What a pane shows: a spinner, an error line, or its data.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T> {
    Loading,
    Error(String),
    Content(T),
}

impl<T> LoadState<T> {
    pub fn from_result<E: std::fmt::Display>(res: Result<T, E>) -> Self {
        match res {
            Ok(v) => LoadState::Content(v),
            Err(e) => LoadState::Error(e.to_string()),
        }
    }

    pub fn content(&self) -> Option<&T> {
        match self {
            LoadState::Content(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Tickers,
    Watchlist,
    Alerts,
}

impl Pane {
    pub fn next(self) -> Self {
        match self {
            Pane::Tickers => Pane::Watchlist,
            Pane::Watchlist => Pane::Alerts,
            Pane::Alerts => Pane::Tickers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub tickers: LoadState<Vec<TickerResponse>>,
    pub watchlist: LoadState<Vec<WatchlistEntryResponse>>,
    pub alerts: LoadState<Vec<AlertResponse>>,
    pub health: HealthResponse,
    pub focus: Pane,
    pub last_refresh: std::time::Instant,
    pub base_url: String,
    pub user_id: String,
    pub token: Option<String>,
}

impl AppState {
    pub fn new(base_url: String, user_id: String, token: Option<String>) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            tickers: LoadState::Loading,
            watchlist: LoadState::Loading,
            alerts: LoadState::Loading,
            health: HealthResponse::default(),
            focus: Pane::Tickers,
            last_refresh: std::time::Instant::now(),
            base_url,
            user_id,
            token,
        }
    }

    /// `{base}/users/{user}/{segments..}` with every segment percent-encoded.
    pub fn user_url(&self, segments: &[&str]) -> Result<String, String> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| format!("bad API_URL: {e}"))?;
        url.path_segments_mut()
            .map_err(|_| format!("bad API_URL: {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .push("users")
            .push(&self.user_id)
            .extend(segments);
        Ok(url.into())
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<T, String> {
        let resp = self.authed(client.get(url)).send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        resp.json::<T>().await.map_err(|e| format!("parse error: {e}"))
    }

    async fn get_user_json<T: serde::de::DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        segments: &[&str],
    ) -> Result<T, String> {
        let url = self.user_url(segments)?;
        self.get_json(client, &url).await
    }

    pub fn is_watched(&self, symbol: &str) -> bool {
        self.watchlist
            .content()
            .is_some_and(|w| w.iter().any(|e| e.symbol == symbol))
    }

    /// Number of rows in the focused pane.
    pub fn focused_len(&self) -> usize {
        match self.focus {
            Pane::Tickers => self.tickers.content().map_or(0, Vec::len),
            Pane::Watchlist => self.watchlist.content().map_or(0, Vec::len),
            Pane::Alerts => self.alerts.content().map_or(0, Vec::len),
        }
    }

    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let tickers_url = format!("{}/tickers", self.base_url);
        let health_url = format!("{}/health", self.base_url);

        let (tickers, health, watchlist, alerts) = tokio::join!(
            self.get_json::<Vec<TickerResponse>>(client, &tickers_url),
            self.get_json::<HealthResponse>(client, &health_url),
            self.get_user_json::<Vec<WatchlistEntryResponse>>(client, &["watchlist"]),
            self.get_user_json::<Vec<AlertResponse>>(client, &["alerts"]),
        );

        match health {
            Ok(h) => {
                self.health = h;
                self.status = ConnectionStatus::Connected;
            }
            Err(e) => self.status = ConnectionStatus::Error(e),
        }
        self.tickers = LoadState::from_result(tickers);
        self.watchlist = LoadState::from_result(watchlist);
        self.alerts = LoadState::from_result(alerts);
        self.last_refresh = std::time::Instant::now();
    }

    /// Add `symbol` to the watchlist, or remove it if already there.
    pub async fn toggle_watchlist(&mut self, client: &reqwest::Client, symbol: &str) {
        let url = if self.is_watched(symbol) {
            self.user_url(&["watchlist", symbol]).map(|u| client.delete(u))
        } else {
            self.user_url(&["watchlist"])
                .map(|u| client.post(u).json(&serde_json::json!({ "symbol": symbol })))
        };
        let req = match url {
            Ok(req) => req,
            Err(e) => {
                self.status = ConnectionStatus::Error(e);
                return;
            }
        };
        match self.authed(req).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.watchlist = LoadState::from_result(self.get_user_json(client, &["watchlist"]).await);
            }
            Ok(resp) => self.status = ConnectionStatus::Error(format!("watchlist: HTTP {}", resp.status())),
            Err(e) => self.status = ConnectionStatus::Error(format!("watchlist: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// More decimals for cheap coins.
pub fn format_price(p: f64) -> String {
    if p >= 1000.0 {
        format!("{p:.2}")
    } else if p >= 1.0 {
        format!("{p:.4}")
    } else {
        format!("{p:.8}")
    }
}

pub fn format_change(pct: f64) -> String {
    format!("{pct:+.2}%")
}

pub fn format_volume(v: f64) -> String {
    if v >= 1e9 {
        format!("{:.2}B", v / 1e9)
    } else if v >= 1e6 {
        format!("{:.2}M", v / 1e6)
    } else if v >= 1e3 {
        format!("{:.1}K", v / 1e3)
    } else {
        format!("{v:.0}")
    }
}

/// Convert millisecond epoch timestamp to HH:MM:SS string (UTC).
pub fn format_time_ms(ms: i64) -> String {
    let secs = (ms / 1_000) as u64;
    let h = (secs / 3600) % 24;
    let m = (secs / 60) % 60;
    let s = secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

#[allow(dead_code)]
fn main() {
    // Entry point lives in src/bin/tui.rs
}
