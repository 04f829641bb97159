use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::alerts::evaluate;
use crate::db::UserStore;
use crate::error::Result;
use crate::state::TickerStore;
use crate::types::{now_ms, AlertTriggered};

/// Evaluates active alerts whenever the ticker store receives fresh prices and marks
/// fired alerts triggered. Fired alerts are forwarded to `alert_tx`.
pub struct AlertMonitor {
    store: Arc<TickerStore>,
    users: UserStore,
    alert_tx: mpsc::Sender<AlertTriggered>,
}

impl AlertMonitor {
    pub fn new(store: Arc<TickerStore>, users: UserStore, alert_tx: mpsc::Sender<AlertTriggered>) -> Self {
        Self { store, users, alert_tx }
    }

    pub async fn run(self) {
        let mut rx = self.store.subscribe();
        loop {
            let touched = match rx.recv().await {
                Ok(symbols) => Some(symbols),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "alert monitor lagged, checking every symbol");
                    None
                }
                Err(RecvError::Closed) => return,
            };
            if let Err(e) = self.check(touched.as_deref()).await {
                error!("Alert check failed: {e}");
            }
        }
    }

    /// Check active alerts against current prices. `touched` limits the check to
    /// those symbols; `None` checks every alert.
    pub async fn check(&self, touched: Option<&[String]>) -> Result<Vec<AlertTriggered>> {
        let touched: Option<HashSet<&str>> = touched.map(|s| s.iter().map(String::as_str).collect());
        let mut fired = Vec::new();

        for alert in self.users.active_alerts().await? {
            if let Some(ref set) = touched {
                if !set.contains(alert.symbol.as_str()) {
                    continue;
                }
            }
            let Some(price) = self.store.price_of(&alert.symbol) else { continue };
            if !evaluate(&alert, price) {
                continue;
            }
            let at = now_ms();
            // Another check may have claimed it first.
            if !self.users.mark_alert_triggered(&alert, at).await? {
                continue;
            }
            debug!(
                alert_id = alert.id,
                symbol = %alert.symbol,
                price,
                previous = ?self.store.previous_price(&alert.symbol),
                "alert fired"
            );
            let event = AlertTriggered { alert: alert.clone(), price, triggered_at: at };
            if let Err(e) = self.alert_tx.try_send(event.clone()) {
                warn!("Alert channel full: {e}");
            }
            fired.push(event);
        }
        Ok(fired)
    }
}
