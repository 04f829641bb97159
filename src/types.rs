use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// 24h rolling statistics for one exchange symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: f64,
    pub quote_volume: f64,
    /// Millisecond UTC epoch of the snapshot.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Aggregator coin snapshot (market cap ranking view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CoinInfo {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub image: Option<String>,
    pub current_price: f64,
    pub market_cap: f64,
    pub market_cap_rank: Option<i64>,
    pub price_change_percentage_24h: f64,
    pub total_volume: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinSearchHit {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub market_cap_rank: Option<i64>,
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl CandleInterval {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1m" => Some(CandleInterval::OneMinute),
            "5m" => Some(CandleInterval::FiveMinutes),
            "15m" => Some(CandleInterval::FifteenMinutes),
            "1h" => Some(CandleInterval::OneHour),
            "4h" => Some(CandleInterval::FourHours),
            "1d" => Some(CandleInterval::OneDay),
            "1w" => Some(CandleInterval::OneWeek),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::FifteenMinutes => "15m",
            CandleInterval::OneHour => "1h",
            CandleInterval::FourHours => "4h",
            CandleInterval::OneDay => "1d",
            CandleInterval::OneWeek => "1w",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Per-user documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchlistEntry {
    pub user_id: String,
    pub symbol: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Above,
    Below,
}

impl AlertCondition {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "above" => Some(AlertCondition::Above),
            "below" => Some(AlertCondition::Below),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertCondition::Above => write!(f, "above"),
            AlertCondition::Below => write!(f, "below"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub condition: AlertCondition,
    pub target_price: f64,
    pub created_at: i64,
    pub triggered: bool,
    pub triggered_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub base_currency: String,
    pub favorite_view: String,
    pub refresh_interval_secs: i64,
    pub notifications_enabled: bool,
}

impl UserPreferences {
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            base_currency: "USD".to_string(),
            favorite_view: "tickers".to_string(),
            refresh_interval_secs: 30,
            notifications_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversionRecord {
    pub id: i64,
    pub user_id: String,
    pub from_currency: String,
    pub to_currency: String,
    pub amount: f64,
    pub result: f64,
    pub rate: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchRecord {
    pub user_id: String,
    pub query: String,
    pub searched_at: i64,
}

// ---------------------------------------------------------------------------
// Events sent over channels between tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AlertTriggered {
    pub alert: PriceAlert,
    pub price: f64,
    pub triggered_at: i64,
}

/// Trim + uppercase. Symbols are stored and compared in this form.
pub fn normalize_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parse_matches_display() {
        for s in ["1m", "5m", "15m", "1h", "4h", "1d", "1w"] {
            let interval = CandleInterval::parse(s).unwrap();
            assert_eq!(interval.to_string(), s);
        }
        assert!(CandleInterval::parse("2h").is_none());
    }

    #[test]
    fn alert_condition_parse_is_case_insensitive() {
        assert_eq!(AlertCondition::parse(" Above "), Some(AlertCondition::Above));
        assert_eq!(AlertCondition::parse("BELOW"), Some(AlertCondition::Below));
        assert_eq!(AlertCondition::parse("cross"), None);
    }
}
