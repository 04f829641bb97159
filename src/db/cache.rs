use crate::error::Result;
use crate::types::{normalize_symbol, Candle, CandleInterval, CoinInfo, Ticker};

/// Local mirror of remote market data. Every write is replace-on-conflict on the
/// record's primary key; nothing is ever evicted.
#[derive(Clone)]
pub struct TickerCache {
    pool: sqlx::SqlitePool,
}

impl TickerCache {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_tickers(&self, tickers: &[Ticker]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for t in tickers {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO tickers (
                    symbol, last_price, price_change, price_change_percent,
                    high_price, low_price, volume, quote_volume, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&t.symbol)
            .bind(t.last_price)
            .bind(t.price_change)
            .bind(t.price_change_percent)
            .bind(t.high_price)
            .bind(t.low_price)
            .bind(t.volume)
            .bind(t.quote_volume)
            .bind(t.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(tickers.len())
    }

    /// All cached tickers, most traded first.
    pub async fn load_tickers(&self) -> Result<Vec<Ticker>> {
        let rows = sqlx::query_as::<_, Ticker>(
            r#"
            SELECT symbol, last_price, price_change, price_change_percent,
                   high_price, low_price, volume, quote_volume, updated_at
            FROM tickers
            ORDER BY quote_volume DESC, symbol ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>> {
        let row = sqlx::query_as::<_, Ticker>(
            r#"
            SELECT symbol, last_price, price_change, price_change_percent,
                   high_price, low_price, volume, quote_volume, updated_at
            FROM tickers
            WHERE symbol = ?
            "#,
        )
        .bind(normalize_symbol(symbol))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn ticker_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickers")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn upsert_coins(&self, coins: &[CoinInfo]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for c in coins {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO coins (
                    id, symbol, name, image, current_price, market_cap,
                    market_cap_rank, price_change_percentage_24h, total_volume, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.id)
            .bind(&c.symbol)
            .bind(&c.name)
            .bind(&c.image)
            .bind(c.current_price)
            .bind(c.market_cap)
            .bind(c.market_cap_rank)
            .bind(c.price_change_percentage_24h)
            .bind(c.total_volume)
            .bind(c.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(coins.len())
    }

    /// Cached coins by market cap rank; unranked coins last.
    pub async fn load_coins(&self) -> Result<Vec<CoinInfo>> {
        let rows = sqlx::query_as::<_, CoinInfo>(
            r#"
            SELECT id, symbol, name, image, current_price, market_cap,
                   market_cap_rank, price_change_percentage_24h, total_volume, updated_at
            FROM coins
            ORDER BY market_cap_rank IS NULL, market_cap_rank ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for c in candles {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO candles (
                    symbol, interval, open_time, open, high, low, close, volume, close_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.symbol)
            .bind(&c.interval)
            .bind(c.open_time)
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .bind(c.volume)
            .bind(c.close_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(candles.len())
    }

    /// The `limit` most recent cached candles, returned oldest first.
    pub async fn load_candles(&self, symbol: &str, interval: CandleInterval, limit: u32) -> Result<Vec<Candle>> {
        let rows = sqlx::query_as::<_, Candle>(
            r#"
            SELECT * FROM (
                SELECT symbol, interval, open_time, open, high, low, close, volume, close_time
                FROM candles
                WHERE symbol = ? AND interval = ?
                ORDER BY open_time DESC
                LIMIT ?
            )
            ORDER BY open_time ASC
            "#,
        )
        .bind(normalize_symbol(symbol))
        .bind(interval.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) fn sample_ticker(symbol: &str, price: f64, quote_volume: f64) -> Ticker {
    Ticker {
        symbol: symbol.to_string(),
        last_price: price,
        price_change: 0.0,
        price_change_percent: 0.0,
        high_price: price,
        low_price: price,
        volume: 1.0,
        quote_volume,
        updated_at: 1,
    }
}
