//! Shared health state for the /health endpoint.
//! Updated by the repository refresh path and the live ticker stream.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Shared health metrics. Updated by tracker components, read by API.
#[derive(Default)]
pub struct HealthState {
    /// True while the live ticker stream is connected.
    pub live_connected: AtomicBool,
    /// Millisecond timestamp of the last successful ticker refresh (0 = none).
    pub last_refresh_at_ms: AtomicI64,
    /// Refresh failures since the last success.
    pub consecutive_failures: AtomicU64,
    /// Successful refreshes since process start.
    pub refreshes_ok: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live_connected(&self, v: bool) {
        self.live_connected.store(v, Ordering::Relaxed);
    }

    pub fn record_refresh_ok(&self, at_ms: i64) {
        self.last_refresh_at_ms.store(at_ms, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.refreshes_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_connected(&self) -> bool {
        self.live_connected.load(Ordering::Relaxed)
    }

    pub fn last_refresh_at_ms(&self) -> i64 {
        self.last_refresh_at_ms.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn refreshes_ok(&self) -> u64 {
        self.refreshes_ok.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_failure_streak() {
        let h = HealthState::new();
        h.record_refresh_failure();
        h.record_refresh_failure();
        assert_eq!(h.consecutive_failures(), 2);

        h.record_refresh_ok(42);
        assert_eq!(h.consecutive_failures(), 0);
        assert_eq!(h.last_refresh_at_ms(), 42);
        assert_eq!(h.refreshes_ok(), 1);
    }
}
