//! Row types for tables whose columns don't map 1:1 onto domain records.
//! Tickers, candles, coins and history rows decode straight into `crate::types`.

use crate::types::{AlertCondition, PriceAlert, UserPreferences};

#[derive(Debug, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub condition: String,
    pub target_price: f64,
    pub created_at: i64,
    pub triggered: i64,
    pub triggered_at: Option<i64>,
}

impl AlertRow {
    /// None if the stored condition is not recognized.
    pub fn into_alert(self) -> Option<PriceAlert> {
        let condition = AlertCondition::parse(&self.condition)?;
        Some(PriceAlert {
            id: self.id,
            user_id: self.user_id,
            symbol: self.symbol,
            condition,
            target_price: self.target_price,
            created_at: self.created_at,
            triggered: self.triggered != 0,
            triggered_at: self.triggered_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PreferencesRow {
    pub user_id: String,
    pub base_currency: String,
    pub favorite_view: String,
    pub refresh_interval_secs: i64,
    pub notifications_enabled: i64,
}

impl From<PreferencesRow> for UserPreferences {
    fn from(r: PreferencesRow) -> Self {
        Self {
            user_id: r.user_id,
            base_currency: r.base_currency,
            favorite_view: r.favorite_view,
            refresh_interval_secs: r.refresh_interval_secs,
            notifications_enabled: r.notifications_enabled != 0,
        }
    }
}
