use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::{Config, RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS};
use crate::error::Result;
use crate::state::TickerStore;
use crate::types::{now_ms, Ticker};
use crate::ws::messages::parse_ws_frame;

/// Holds the single persistent connection to the exchange's mini-ticker stream and
/// pushes tracked symbols into the ticker store as they arrive.
pub struct LiveTickerStream {
    cfg: Config,
    store: Arc<TickerStore>,
    health: Arc<HealthState>,
    /// Total frames received since process start.
    frames_received: AtomicU64,
    /// Total tickers applied to the store.
    tickers_applied: AtomicU64,
}

impl LiveTickerStream {
    pub fn new(cfg: Config, store: Arc<TickerStore>, health: Arc<HealthState>) -> Self {
        Self {
            cfg,
            store,
            health,
            frames_received: AtomicU64::new(0),
            tickers_applied: AtomicU64::new(0),
        }
    }

    pub async fn run(self) {
        let mut backoff_idx = 0usize;

        loop {
            info!("WS connecting to {}", self.cfg.exchange_ws_url);
            match self.connect_once().await {
                Ok(()) => {
                    info!("WS connection closed cleanly");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("WS connection error: {e}");
                }
            }
            self.health.set_live_connected(false);

            let delay_ms = backoff_delay_ms(backoff_idx);
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

            warn!("WS reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.cfg.exchange_ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        self.health.set_live_connected(true);
        info!("WS connected");

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("WS ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let total_frames = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;

        let tracked = self.tracked(parse_ws_frame(text, now_ms()));
        if !tracked.is_empty() {
            let applied = self.store.upsert_many(tracked).len() as u64;
            self.tickers_applied.fetch_add(applied, Ordering::Relaxed);
        }

        if total_frames % 500 == 0 {
            let applied = self.tickers_applied.load(Ordering::Relaxed);
            info!(
                frames = total_frames,
                applied,
                "[WS] {total_frames} frames | applied={applied}"
            );
        }
    }

    fn tracked(&self, tickers: Vec<Ticker>) -> Vec<Ticker> {
        tickers.into_iter().filter(|t| self.cfg.tracks(&t.symbol)).collect()
    }
}

/// Reconnect delay for the given attempt; the last rung repeats forever.
fn backoff_delay_ms(attempt: usize) -> u64 {
    RECONNECT_BACKOFF_MS
        .get(attempt)
        .or_else(|| RECONNECT_BACKOFF_MS.last())
        .copied()
        .unwrap_or(1_000)
}
