use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::fetcher::dto::num_or_zero;
use crate::types::{normalize_symbol, Ticker};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// One rolling 24h mini-ticker event. Prices arrive as decimal strings.
#[derive(Debug, Deserialize)]
struct RawMiniTicker {
    #[serde(rename = "e")]
    event_type: Option<String>,
    /// Event time, ms.
    #[serde(rename = "E")]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "c")]
    close: Option<Value>,
    #[serde(rename = "o")]
    open: Option<Value>,
    #[serde(rename = "h")]
    high: Option<Value>,
    #[serde(rename = "l")]
    low: Option<Value>,
    #[serde(rename = "v")]
    volume: Option<Value>,
    #[serde(rename = "q")]
    quote_volume: Option<Value>,
}

/// Parse a raw mini-ticker frame into tickers.
///
/// The all-market stream sends a JSON array of events; single-symbol streams send
/// one object. Events of other types and events without a symbol or a positive
/// close price are skipped. `received_at` stands in for a missing event time.
pub fn parse_ws_frame(raw: &str, received_at: i64) -> Vec<Ticker> {
    let msgs: Vec<RawMiniTicker> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawMiniTicker>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample: String = raw.chars().take(500).collect();
            warn!(count, "[WS PARSE] unrecognized frame: {sample}");
        }
        return vec![];
    }

    msgs.into_iter()
        .filter_map(|m| ticker_from_mini(m, received_at))
        .collect()
}

fn ticker_from_mini(msg: RawMiniTicker, received_at: i64) -> Option<Ticker> {
    if msg.event_type.as_deref().is_some_and(|e| e != "24hrMiniTicker") {
        return None;
    }
    let symbol = normalize_symbol(msg.symbol.as_deref()?);
    if symbol.is_empty() {
        return None;
    }
    let close = num_or_zero(msg.close.as_ref());
    if close <= 0.0 {
        return None;
    }
    let open = num_or_zero(msg.open.as_ref());
    let (price_change, price_change_percent) = if open > 0.0 {
        (close - open, (close - open) / open * 100.0)
    } else {
        (0.0, 0.0)
    };

    Some(Ticker {
        symbol,
        last_price: close,
        price_change,
        price_change_percent,
        high_price: num_or_zero(msg.high.as_ref()),
        low_price: num_or_zero(msg.low.as_ref()),
        volume: num_or_zero(msg.volume.as_ref()),
        quote_volume: num_or_zero(msg.quote_volume.as_ref()),
        updated_at: msg.event_time.filter(|t| *t > 0).unwrap_or(received_at),
    })
}
