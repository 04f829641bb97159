//! Per-user documents: watchlist, price alerts, preferences, conversion and search
//! history.
//!
//! Every mutation publishes a [`UserChange`] on a broadcast channel. The `watch_*`
//! methods turn that into listener streams: the current snapshot first, then a fresh
//! snapshot after each change to the same user's collection.

use std::future::Future;

use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::config::{HISTORY_LIMIT, LISTENER_CAPACITY};
use crate::db::models::{AlertRow, PreferencesRow};
use crate::error::{AppError, Result};
use crate::types::{
    normalize_symbol, now_ms, AlertCondition, ConversionRecord, PriceAlert, SearchRecord,
    UserPreferences, WatchlistEntry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Watchlist,
    Alerts,
    Preferences,
    Conversions,
    Searches,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChange {
    pub user_id: String,
    pub kind: ChangeKind,
}

#[derive(Clone)]
pub struct UserStore {
    pool: sqlx::SqlitePool,
    changes: broadcast::Sender<UserChange>,
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(AppError::InvalidInput("user id must not be empty".to_string()));
    }
    Ok(())
}

fn validate_symbol(symbol: &str) -> Result<String> {
    let symbol = normalize_symbol(symbol);
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidInput(format!("invalid symbol {symbol:?}")));
    }
    Ok(symbol)
}

impl UserStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(LISTENER_CAPACITY);
        Self { pool, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserChange> {
        self.changes.subscribe()
    }

    fn publish(&self, user_id: &str, kind: ChangeKind) {
        // No listeners is fine.
        let _ = self.changes.send(UserChange { user_id: user_id.to_string(), kind });
    }

    // -----------------------------------------------------------------------
    // Watchlist
    // -----------------------------------------------------------------------

    /// Idempotent: re-adding keeps the original `added_at`.
    pub async fn add_to_watchlist(&self, user_id: &str, symbol: &str) -> Result<WatchlistEntry> {
        validate_user(user_id)?;
        let symbol = validate_symbol(symbol)?;
        sqlx::query("INSERT OR IGNORE INTO watchlist (user_id, symbol, added_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(&symbol)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        let entry = sqlx::query_as::<_, WatchlistEntry>(
            "SELECT user_id, symbol, added_at FROM watchlist WHERE user_id = ? AND symbol = ?",
        )
        .bind(user_id)
        .bind(&symbol)
        .fetch_one(&self.pool)
        .await?;
        self.publish(user_id, ChangeKind::Watchlist);
        Ok(entry)
    }

    /// Returns false if the symbol was not on the list.
    pub async fn remove_from_watchlist(&self, user_id: &str, symbol: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM watchlist WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(normalize_symbol(symbol))
            .execute(&self.pool)
            .await?;
        let removed = res.rows_affected() > 0;
        if removed {
            self.publish(user_id, ChangeKind::Watchlist);
        }
        Ok(removed)
    }

    /// Oldest entry first.
    pub async fn watchlist(&self, user_id: &str) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query_as::<_, WatchlistEntry>(
            "SELECT user_id, symbol, added_at FROM watchlist WHERE user_id = ? ORDER BY added_at ASC, symbol ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn is_watched(&self, user_id: &str, symbol: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watchlist WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(normalize_symbol(symbol))
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn create_alert(
        &self,
        user_id: &str,
        symbol: &str,
        condition: AlertCondition,
        target_price: f64,
    ) -> Result<PriceAlert> {
        validate_user(user_id)?;
        let symbol = validate_symbol(symbol)?;
        if !target_price.is_finite() || target_price <= 0.0 {
            return Err(AppError::InvalidInput("target price must be a positive number".to_string()));
        }
        let created_at = now_ms();
        let res = sqlx::query(
            r#"
            INSERT INTO price_alerts (user_id, symbol, condition, target_price, created_at, triggered)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(user_id)
        .bind(&symbol)
        .bind(condition.to_string())
        .bind(target_price)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let alert = PriceAlert {
            id: res.last_insert_rowid(),
            user_id: user_id.to_string(),
            symbol,
            condition,
            target_price,
            created_at,
            triggered: false,
            triggered_at: None,
        };
        debug!(alert_id = alert.id, user = user_id, symbol = %alert.symbol, "alert created");
        self.publish(user_id, ChangeKind::Alerts);
        Ok(alert)
    }

    pub async fn delete_alert(&self, user_id: &str, alert_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM price_alerts WHERE id = ? AND user_id = ?")
            .bind(alert_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        let deleted = res.rows_affected() > 0;
        if deleted {
            self.publish(user_id, ChangeKind::Alerts);
        }
        Ok(deleted)
    }

    /// Newest first.
    pub async fn alerts(&self, user_id: &str) -> Result<Vec<PriceAlert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, user_id, symbol, condition, target_price, created_at, triggered, triggered_at
            FROM price_alerts
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_alerts(rows))
    }

    /// Untriggered alerts across all users.
    pub async fn active_alerts(&self) -> Result<Vec<PriceAlert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, user_id, symbol, condition, target_price, created_at, triggered, triggered_at
            FROM price_alerts
            WHERE triggered = 0
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_alerts(rows))
    }

    /// Returns false if the alert was already triggered or no longer exists.
    pub async fn mark_alert_triggered(&self, alert: &PriceAlert, at: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE price_alerts SET triggered = 1, triggered_at = ? WHERE id = ? AND triggered = 0",
        )
        .bind(at)
        .bind(alert.id)
        .execute(&self.pool)
        .await?;
        let updated = res.rows_affected() > 0;
        if updated {
            self.publish(&alert.user_id, ChangeKind::Alerts);
        }
        Ok(updated)
    }

    /// Re-arm a triggered alert.
    pub async fn reset_alert(&self, user_id: &str, alert_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE price_alerts SET triggered = 0, triggered_at = NULL WHERE id = ? AND user_id = ?",
        )
        .bind(alert_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        let updated = res.rows_affected() > 0;
        if updated {
            self.publish(user_id, ChangeKind::Alerts);
        }
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Preferences
    // -----------------------------------------------------------------------

    /// Stored preferences, or defaults when the user never saved any.
    pub async fn preferences(&self, user_id: &str) -> Result<UserPreferences> {
        let row = sqlx::query_as::<_, PreferencesRow>(
            r#"
            SELECT user_id, base_currency, favorite_view, refresh_interval_secs, notifications_enabled
            FROM user_preferences
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserPreferences::from).unwrap_or_else(|| UserPreferences::defaults_for(user_id)))
    }

    pub async fn save_preferences(&self, prefs: &UserPreferences) -> Result<UserPreferences> {
        validate_user(&prefs.user_id)?;
        let base_currency = prefs.base_currency.trim().to_uppercase();
        if base_currency.is_empty() {
            return Err(AppError::InvalidInput("base currency must not be empty".to_string()));
        }
        if prefs.refresh_interval_secs < 1 {
            return Err(AppError::InvalidInput("refresh interval must be at least 1 second".to_string()));
        }
        let saved = UserPreferences { base_currency, ..prefs.clone() };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO user_preferences (
                user_id, base_currency, favorite_view, refresh_interval_secs, notifications_enabled
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&saved.user_id)
        .bind(&saved.base_currency)
        .bind(&saved.favorite_view)
        .bind(saved.refresh_interval_secs)
        .bind(i64::from(saved.notifications_enabled))
        .execute(&self.pool)
        .await?;
        self.publish(&saved.user_id, ChangeKind::Preferences);
        Ok(saved)
    }

    // -----------------------------------------------------------------------
    // Conversion history
    // -----------------------------------------------------------------------

    pub async fn record_conversion(
        &self,
        user_id: &str,
        from_currency: &str,
        to_currency: &str,
        amount: f64,
        result: f64,
        rate: f64,
    ) -> Result<ConversionRecord> {
        validate_user(user_id)?;
        let created_at = now_ms();
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            INSERT INTO conversion_history (user_id, from_currency, to_currency, amount, result, rate, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(from_currency)
        .bind(to_currency)
        .bind(amount)
        .bind(result)
        .bind(rate)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM conversion_history
            WHERE user_id = ? AND id NOT IN (
                SELECT id FROM conversion_history WHERE user_id = ? ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(HISTORY_LIMIT)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.publish(user_id, ChangeKind::Conversions);
        Ok(ConversionRecord {
            id: res.last_insert_rowid(),
            user_id: user_id.to_string(),
            from_currency: from_currency.to_string(),
            to_currency: to_currency.to_string(),
            amount,
            result,
            rate,
            created_at,
        })
    }

    /// Newest first.
    pub async fn conversion_history(&self, user_id: &str, limit: i64) -> Result<Vec<ConversionRecord>> {
        let rows = sqlx::query_as::<_, ConversionRecord>(
            r#"
            SELECT id, user_id, from_currency, to_currency, amount, result, rate, created_at
            FROM conversion_history
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, HISTORY_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear_conversion_history(&self, user_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM conversion_history WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.publish(user_id, ChangeKind::Conversions);
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Search history
    // -----------------------------------------------------------------------

    pub async fn record_search(&self, user_id: &str, query: &str) -> Result<SearchRecord> {
        self.record_search_at(user_id, query, now_ms()).await
    }

    /// Repeating a query moves it to the top instead of adding a duplicate.
    pub(crate) async fn record_search_at(&self, user_id: &str, query: &str, at: i64) -> Result<SearchRecord> {
        validate_user(user_id)?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Err(AppError::InvalidInput("search query must not be empty".to_string()));
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO search_history (user_id, query, searched_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id, query) DO UPDATE SET searched_at = excluded.searched_at
            "#,
        )
        .bind(user_id)
        .bind(&query)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM search_history
            WHERE user_id = ? AND query NOT IN (
                SELECT query FROM search_history WHERE user_id = ? ORDER BY searched_at DESC LIMIT ?
            )
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(HISTORY_LIMIT)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.publish(user_id, ChangeKind::Searches);
        Ok(SearchRecord { user_id: user_id.to_string(), query, searched_at: at })
    }

    /// Most recent first.
    pub async fn search_history(&self, user_id: &str, limit: i64) -> Result<Vec<SearchRecord>> {
        let rows = sqlx::query_as::<_, SearchRecord>(
            r#"
            SELECT user_id, query, searched_at
            FROM search_history
            WHERE user_id = ?
            ORDER BY searched_at DESC, query ASC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, HISTORY_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear_search_history(&self, user_id: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM search_history WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.publish(user_id, ChangeKind::Searches);
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Listener streams
    // -----------------------------------------------------------------------

    pub fn watch_watchlist(&self, user_id: &str) -> impl Stream<Item = Result<Vec<WatchlistEntry>>> + Send + 'static {
        self.watch(user_id, ChangeKind::Watchlist, |store: UserStore, user: String| async move {
            store.watchlist(&user).await
        })
    }

    pub fn watch_alerts(&self, user_id: &str) -> impl Stream<Item = Result<Vec<PriceAlert>>> + Send + 'static {
        self.watch(user_id, ChangeKind::Alerts, |store: UserStore, user: String| async move {
            store.alerts(&user).await
        })
    }

    fn watch<T, F, Fut>(&self, user_id: &str, kind: ChangeKind, load: F) -> impl Stream<Item = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn(UserStore, String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        // Subscribe before the first snapshot so no change slips between the two.
        let rx = self.subscribe();
        let store = self.clone();
        let user_id = user_id.to_string();

        futures_util::stream::unfold((rx, true), move |(mut rx, first)| {
            let store = store.clone();
            let user_id = user_id.clone();
            let load = load.clone();
            async move {
                if !first {
                    loop {
                        match rx.recv().await {
                            Ok(change) if change.user_id == user_id && change.kind == kind => break,
                            Ok(_) => continue,
                            Err(RecvError::Lagged(n)) => {
                                debug!(skipped = n, "listener lagged, re-reading snapshot");
                                break;
                            }
                            Err(RecvError::Closed) => return None,
                        }
                    }
                }
                let snapshot = load(store, user_id).await;
                Some((snapshot, (rx, false)))
            }
        })
    }
}

fn rows_to_alerts(rows: Vec<AlertRow>) -> Vec<PriceAlert> {
    rows.into_iter()
        .filter_map(|r| {
            let id = r.id;
            let alert = r.into_alert();
            if alert.is_none() {
                warn!(alert_id = id, "skipping alert with unknown condition");
            }
            alert
        })
        .collect()
}
