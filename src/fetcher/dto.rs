//! Wire shapes returned by the exchange and aggregator REST APIs and the pure
//! functions mapping them into domain records.
//!
//! Both APIs are loose about numeric types: the exchange sends decimals as JSON
//! strings, the aggregator sends numbers that may be `null`. Every numeric field is
//! therefore kept as a raw `serde_json::Value` and parsed with [`num_or_zero`], so a
//! single malformed field never rejects a whole payload.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{normalize_symbol, Candle, CandleInterval, CoinInfo, CoinSearchHit, Ticker};

/// Parse a JSON number or numeric string. Missing, null, malformed and non-finite
/// values all map to `0.0`.
pub fn num_or_zero(v: Option<&Value>) -> f64 {
    let parsed = match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|x| x.is_finite()).unwrap_or(0.0)
}

fn int_or_zero(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// `GET /api/v3/ticker/24hr` element.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerDto {
    #[serde(default)]
    pub symbol: String,
    pub last_price: Option<Value>,
    pub price_change: Option<Value>,
    pub price_change_percent: Option<Value>,
    pub high_price: Option<Value>,
    pub low_price: Option<Value>,
    pub volume: Option<Value>,
    pub quote_volume: Option<Value>,
    pub close_time: Option<Value>,
}

/// Returns None when the payload carries no symbol.
pub fn ticker_from_dto(dto: &TickerDto, fallback_ts: i64) -> Option<Ticker> {
    let symbol = normalize_symbol(&dto.symbol);
    if symbol.is_empty() {
        return None;
    }
    let close_time = int_or_zero(dto.close_time.as_ref());
    Some(Ticker {
        symbol,
        last_price: num_or_zero(dto.last_price.as_ref()),
        price_change: num_or_zero(dto.price_change.as_ref()),
        price_change_percent: num_or_zero(dto.price_change_percent.as_ref()),
        high_price: num_or_zero(dto.high_price.as_ref()),
        low_price: num_or_zero(dto.low_price.as_ref()),
        volume: num_or_zero(dto.volume.as_ref()),
        quote_volume: num_or_zero(dto.quote_volume.as_ref()),
        updated_at: if close_time > 0 { close_time } else { fallback_ts },
    })
}

/// One kline is a positional array:
/// `[open_time, open, high, low, close, volume, close_time, ...]`.
/// Rows shorter than seven entries are dropped.
pub fn candle_from_row(symbol: &str, interval: CandleInterval, row: &[Value]) -> Option<Candle> {
    if row.len() < 7 {
        return None;
    }
    Some(Candle {
        symbol: normalize_symbol(symbol),
        interval: interval.to_string(),
        open_time: int_or_zero(row.first()),
        open: num_or_zero(row.get(1)),
        high: num_or_zero(row.get(2)),
        low: num_or_zero(row.get(3)),
        close: num_or_zero(row.get(4)),
        volume: num_or_zero(row.get(5)),
        close_time: int_or_zero(row.get(6)),
    })
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// `GET /coins/markets` element.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinMarketDto {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub image: Option<String>,
    pub current_price: Option<Value>,
    pub market_cap: Option<Value>,
    pub market_cap_rank: Option<i64>,
    pub price_change_percentage_24h: Option<Value>,
    pub total_volume: Option<Value>,
}

pub fn coin_from_dto(dto: &CoinMarketDto, ts: i64) -> CoinInfo {
    CoinInfo {
        id: dto.id.clone(),
        symbol: normalize_symbol(&dto.symbol),
        name: dto.name.clone(),
        image: dto.image.clone(),
        current_price: num_or_zero(dto.current_price.as_ref()),
        market_cap: num_or_zero(dto.market_cap.as_ref()),
        market_cap_rank: dto.market_cap_rank,
        price_change_percentage_24h: num_or_zero(dto.price_change_percentage_24h.as_ref()),
        total_volume: num_or_zero(dto.total_volume.as_ref()),
        updated_at: ts,
    }
}

/// `GET /search` envelope. Only the coin section is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponseDto {
    #[serde(default)]
    pub coins: Vec<SearchCoinDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchCoinDto {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub market_cap_rank: Option<i64>,
    pub thumb: Option<String>,
}

pub fn search_hit_from_dto(dto: &SearchCoinDto) -> CoinSearchHit {
    CoinSearchHit {
        id: dto.id.clone(),
        symbol: normalize_symbol(&dto.symbol),
        name: dto.name.clone(),
        market_cap_rank: dto.market_cap_rank,
        thumb: dto.thumb.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn num_or_zero_handles_strings_numbers_and_garbage() {
        assert_eq!(num_or_zero(Some(&json!("42.5"))), 42.5);
        assert_eq!(num_or_zero(Some(&json!(" 1.25 "))), 1.25);
        assert_eq!(num_or_zero(Some(&json!(7))), 7.0);
        assert_eq!(num_or_zero(Some(&json!("abc"))), 0.0);
        assert_eq!(num_or_zero(Some(&json!(""))), 0.0);
        assert_eq!(num_or_zero(Some(&json!("NaN"))), 0.0);
        assert_eq!(num_or_zero(Some(&Value::Null)), 0.0);
        assert_eq!(num_or_zero(Some(&json!(true))), 0.0);
        assert_eq!(num_or_zero(None), 0.0);
    }

    #[test]
    fn ticker_dto_transcribes_fields() {
        let dto: TickerDto = serde_json::from_value(json!({
            "symbol": "btcusdt",
            "priceChange": "-94.99",
            "priceChangePercent": "-1.2",
            "lastPrice": "64000.10",
            "highPrice": "65000",
            "lowPrice": "63000.5",
            "volume": "1234.5",
            "quoteVolume": "79000000",
            "closeTime": 1_700_000_000_000i64,
            "count": 10
        }))
        .unwrap();

        let t = ticker_from_dto(&dto, 1).unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.last_price, 64000.10);
        assert_eq!(t.price_change, -94.99);
        assert_eq!(t.price_change_percent, -1.2);
        assert_eq!(t.high_price, 65000.0);
        assert_eq!(t.low_price, 63000.5);
        assert_eq!(t.volume, 1234.5);
        assert_eq!(t.quote_volume, 79_000_000.0);
        assert_eq!(t.updated_at, 1_700_000_000_000);
    }

    #[test]
    fn ticker_dto_malformed_numbers_fall_back_to_zero() {
        let dto: TickerDto = serde_json::from_value(json!({
            "symbol": "ETHUSDT",
            "lastPrice": "not-a-number",
            "volume": null
        }))
        .unwrap();

        let t = ticker_from_dto(&dto, 99).unwrap();
        assert_eq!(t.last_price, 0.0);
        assert_eq!(t.volume, 0.0);
        assert_eq!(t.high_price, 0.0);
        assert_eq!(t.updated_at, 99, "missing closeTime uses fallback timestamp");
    }

    #[test]
    fn ticker_without_symbol_is_dropped() {
        let dto: TickerDto = serde_json::from_value(json!({ "lastPrice": "1" })).unwrap();
        assert!(ticker_from_dto(&dto, 0).is_none());
    }

    #[test]
    fn kline_row_maps_positionally() {
        let row = json!([
            1_499_040_000_000i64, "0.0163", "0.8000", "0.0157", "0.0158", "148976.11",
            1_499_644_799_999i64, "2434.19", 308, "1756.87", "28.46", "0"
        ]);
        let c = candle_from_row("bnbbtc", CandleInterval::OneHour, row.as_array().unwrap()).unwrap();
        assert_eq!(c.symbol, "BNBBTC");
        assert_eq!(c.interval, "1h");
        assert_eq!(c.open_time, 1_499_040_000_000);
        assert_eq!(c.open, 0.0163);
        assert_eq!(c.high, 0.8);
        assert_eq!(c.low, 0.0157);
        assert_eq!(c.close, 0.0158);
        assert_eq!(c.volume, 148976.11);
        assert_eq!(c.close_time, 1_499_644_799_999);
    }

    #[test]
    fn short_kline_row_is_rejected() {
        let row = json!([1, "2", "3"]);
        assert!(candle_from_row("X", CandleInterval::OneDay, row.as_array().unwrap()).is_none());
    }

    #[test]
    fn coin_dto_null_numbers_become_zero() {
        let dto: CoinMarketDto = serde_json::from_value(json!({
            "id": "bitcoin",
            "symbol": "btc",
            "name": "Bitcoin",
            "image": "https://img/btc.png",
            "current_price": 64000.5,
            "market_cap": null,
            "market_cap_rank": 1,
            "price_change_percentage_24h": -2.5,
            "total_volume": null
        }))
        .unwrap();

        let c = coin_from_dto(&dto, 5);
        assert_eq!(c.id, "bitcoin");
        assert_eq!(c.symbol, "BTC");
        assert_eq!(c.current_price, 64000.5);
        assert_eq!(c.market_cap, 0.0);
        assert_eq!(c.total_volume, 0.0);
        assert_eq!(c.market_cap_rank, Some(1));
        assert_eq!(c.price_change_percentage_24h, -2.5);
        assert_eq!(c.updated_at, 5);
    }

    #[test]
    fn search_envelope_without_coins_is_empty() {
        let dto: SearchResponseDto = serde_json::from_value(json!({ "exchanges": [] })).unwrap();
        assert!(dto.coins.is_empty());
    }
}
