use crate::types::{AlertCondition, PriceAlert};

/// Decide whether an alert fires at `price`.
/// Alerts are one-shot: a triggered alert never fires again until it is reset.
/// A non-positive price means "no quote" and never fires.
pub fn evaluate(alert: &PriceAlert, price: f64) -> bool {
    if alert.triggered || !price.is_finite() || price <= 0.0 {
        return false;
    }
    match alert.condition {
        AlertCondition::Above => price >= alert.target_price,
        AlertCondition::Below => price <= alert.target_price,
    }
}
