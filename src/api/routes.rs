use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_CANDLE_LIMIT, HISTORY_LIMIT, MAX_CANDLE_LIMIT};
use crate::convert::ConversionService;
use crate::db::UserStore;
use crate::error::{AppError, Result};
use crate::repository::MarketRepository;
use crate::types::{
    normalize_symbol, AlertCondition, Candle, CandleInterval, CoinInfo, CoinSearchHit,
    ConversionRecord, PriceAlert, SearchRecord, Ticker, UserPreferences, WatchlistEntry,
};

#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<MarketRepository>,
    pub users: UserStore,
    pub conversions: Arc<ConversionService>,
    /// When set, `/users/*` requires `Authorization: Bearer <token>`.
    pub api_token: Option<Arc<str>>,
}

pub fn router(state: ApiState) -> Router {
    let users = Router::new()
        .route("/users/:user/watchlist", get(get_watchlist).post(add_watchlist))
        .route("/users/:user/watchlist/:symbol", get(get_watched).delete(remove_watchlist))
        .route("/users/:user/alerts", get(get_alerts).post(create_alert))
        .route("/users/:user/alerts/:id", delete(delete_alert))
        .route("/users/:user/alerts/:id/reset", post(reset_alert))
        .route("/users/:user/preferences", get(get_preferences).put(put_preferences))
        .route("/users/:user/search", get(search_for_user))
        .route("/users/:user/convert", post(convert))
        .route("/users/:user/conversions", get(get_conversions).delete(clear_conversions))
        .route("/users/:user/searches", get(get_searches).delete(clear_searches))
        .route("/users/:user/streams/watchlist", get(stream_watchlist))
        .route("/users/:user/streams/alerts", get(stream_alerts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/tickers", get(get_tickers))
        .route("/tickers/:symbol", get(get_ticker))
        .route("/tickers/:symbol/candles", get(get_candles))
        .route("/coins", get(get_coins))
        .route("/search", get(search))
        .route("/currencies", get(get_currencies))
        .merge(users)
        .with_state(state)
}

async fn require_token(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> std::result::Result<Response, AppError> {
    if let Some(token) = state.api_token.as_deref() {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token) {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

// ---------------------------------------------------------------------------
// Query param / body structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CandlesQuery {
    pub interval: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchlistBody {
    pub symbol: String,
}

#[derive(Deserialize)]
pub struct AlertBody {
    pub symbol: String,
    pub condition: String,
    pub target_price: f64,
}

/// Partial update; absent fields keep their stored value.
#[derive(Deserialize)]
pub struct PreferencesBody {
    pub base_currency: Option<String>,
    pub favorite_view: Option<String>,
    pub refresh_interval_secs: Option<i64>,
    pub notifications_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct ConvertBody {
    pub amount: f64,
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub live_connected: bool,
    pub last_refresh_at_ms: Option<i64>,
    pub consecutive_failures: u64,
    pub refreshes_ok: u64,
    pub tickers_in_memory: usize,
    pub tickers_cached: i64,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct Watched {
    pub symbol: String,
    pub watched: bool,
}

#[derive(Serialize)]
pub struct Removed {
    pub removed: u64,
}

// ---------------------------------------------------------------------------
// Market handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>> {
    let health = state.repo.health();
    let failures = health.consecutive_failures();
    let last = health.last_refresh_at_ms();
    Ok(Json(HealthResponse {
        status: if failures == 0 { "ok" } else { "degraded" },
        live_connected: health.live_connected(),
        last_refresh_at_ms: (last > 0).then_some(last),
        consecutive_failures: failures,
        refreshes_ok: health.refreshes_ok(),
        tickers_in_memory: state.repo.store().len(),
        tickers_cached: state.repo.cache().ticker_count().await?,
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let latency = state.repo.latency();
    let (p50_ms, p95_ms, p99_ms) = latency.percentiles();
    Json(LatencyResponse { samples: latency.len(), p50_ms, p95_ms, p99_ms })
}

async fn get_tickers(State(state): State<ApiState>) -> Result<Json<Vec<Ticker>>> {
    Ok(Json(state.repo.tickers().await?))
}

async fn get_ticker(State(state): State<ApiState>, Path(symbol): Path<String>) -> Result<Json<Ticker>> {
    Ok(Json(state.repo.ticker(&symbol).await?))
}

async fn get_candles(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(params): Query<CandlesQuery>,
) -> Result<Json<Vec<Candle>>> {
    let raw = params.interval.as_deref().unwrap_or("1h");
    let interval = CandleInterval::parse(raw)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown interval {raw:?}")))?;
    let limit = params.limit.unwrap_or(DEFAULT_CANDLE_LIMIT).clamp(1, MAX_CANDLE_LIMIT);
    Ok(Json(state.repo.candles(&symbol, interval, limit).await?))
}

async fn get_coins(State(state): State<ApiState>) -> Result<Json<Vec<CoinInfo>>> {
    Ok(Json(state.repo.coins().await?))
}

/// Anonymous search; nothing is recorded. `/users/:user/search` keeps history.
async fn search(
    State(state): State<ApiState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<CoinSearchHit>>> {
    let q = params.q.trim();
    if q.is_empty() {
        return Ok(Json(Vec::new()));
    }
    Ok(Json(state.repo.search(None, q).await?))
}

/// Every currency the converter can price right now, in the pivot's table.
async fn get_currencies(State(state): State<ApiState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.conversions.rate_table().await?.currencies()))
}

// ---------------------------------------------------------------------------
// User handlers
// ---------------------------------------------------------------------------

async fn get_watchlist(State(state): State<ApiState>, Path(user): Path<String>) -> Result<Json<Vec<WatchlistEntry>>> {
    Ok(Json(state.users.watchlist(&user).await?))
}

async fn add_watchlist(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Json(body): Json<WatchlistBody>,
) -> Result<(StatusCode, Json<WatchlistEntry>)> {
    let entry = state.users.add_to_watchlist(&user, &body.symbol).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_watched(
    State(state): State<ApiState>,
    Path((user, symbol)): Path<(String, String)>,
) -> Result<Json<Watched>> {
    let watched = state.users.is_watched(&user, &symbol).await?;
    Ok(Json(Watched { symbol: normalize_symbol(&symbol), watched }))
}

async fn remove_watchlist(
    State(state): State<ApiState>,
    Path((user, symbol)): Path<(String, String)>,
) -> Result<StatusCode> {
    if state.users.remove_from_watchlist(&user, &symbol).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("{symbol} is not on the watchlist")))
    }
}

async fn get_alerts(State(state): State<ApiState>, Path(user): Path<String>) -> Result<Json<Vec<PriceAlert>>> {
    Ok(Json(state.users.alerts(&user).await?))
}

async fn create_alert(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Json(body): Json<AlertBody>,
) -> Result<(StatusCode, Json<PriceAlert>)> {
    let condition = AlertCondition::parse(&body.condition)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown condition {:?}", body.condition)))?;
    let alert = state
        .users
        .create_alert(&user, &body.symbol, condition, body.target_price)
        .await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn delete_alert(
    State(state): State<ApiState>,
    Path((user, id)): Path<(String, i64)>,
) -> Result<StatusCode> {
    if state.users.delete_alert(&user, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("alert {id}")))
    }
}

async fn reset_alert(
    State(state): State<ApiState>,
    Path((user, id)): Path<(String, i64)>,
) -> Result<StatusCode> {
    if state.users.reset_alert(&user, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("alert {id}")))
    }
}

async fn get_preferences(State(state): State<ApiState>, Path(user): Path<String>) -> Result<Json<UserPreferences>> {
    Ok(Json(state.users.preferences(&user).await?))
}

async fn put_preferences(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Json(body): Json<PreferencesBody>,
) -> Result<Json<UserPreferences>> {
    let current = state.users.preferences(&user).await?;
    let updated = UserPreferences {
        user_id: user,
        base_currency: body.base_currency.unwrap_or(current.base_currency),
        favorite_view: body.favorite_view.unwrap_or(current.favorite_view),
        refresh_interval_secs: body.refresh_interval_secs.unwrap_or(current.refresh_interval_secs),
        notifications_enabled: body.notifications_enabled.unwrap_or(current.notifications_enabled),
    };
    Ok(Json(state.users.save_preferences(&updated).await?))
}

async fn convert(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Json(body): Json<ConvertBody>,
) -> Result<Json<ConversionRecord>> {
    Ok(Json(state.conversions.convert_for(&user, body.amount, &body.from, &body.to).await?))
}

fn history_limit(q: &HistoryQuery) -> i64 {
    q.limit.unwrap_or(HISTORY_LIMIT).clamp(1, HISTORY_LIMIT)
}

async fn get_conversions(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<ConversionRecord>>> {
    Ok(Json(state.users.conversion_history(&user, history_limit(&q)).await?))
}

async fn clear_conversions(State(state): State<ApiState>, Path(user): Path<String>) -> Result<Json<Removed>> {
    let removed = state.users.clear_conversion_history(&user).await?;
    Ok(Json(Removed { removed }))
}

async fn search_for_user(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<CoinSearchHit>>> {
    let q = params.q.trim();
    if q.is_empty() {
        return Ok(Json(Vec::new()));
    }
    Ok(Json(state.repo.search(Some(&user), q).await?))
}

async fn get_searches(
    State(state): State<ApiState>,
    Path(user): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<SearchRecord>>> {
    Ok(Json(state.users.search_history(&user, history_limit(&q)).await?))
}

async fn clear_searches(State(state): State<ApiState>, Path(user): Path<String>) -> Result<Json<Removed>> {
    let removed = state.users.clear_search_history(&user).await?;
    Ok(Json(Removed { removed }))
}

// ---------------------------------------------------------------------------
// Listener streams (server-sent events)
// ---------------------------------------------------------------------------

/// One SSE event per snapshot. A failed read is reported in-band and the stream
/// keeps going; the next change produces a fresh snapshot.
fn snapshot_event<T: Serialize>(snapshot: Result<T>) -> std::result::Result<Event, Infallible> {
    let event = snapshot
        .map_err(|e| e.to_string())
        .and_then(|v| Event::default().event("snapshot").json_data(v).map_err(|e| e.to_string()));
    Ok(event.unwrap_or_else(|msg| Event::default().event("error").data(msg)))
}

async fn stream_watchlist(
    State(state): State<ApiState>,
    Path(user): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(state.users.watch_watchlist(&user).map(snapshot_event)).keep_alive(KeepAlive::default())
}

async fn stream_alerts(
    State(state): State<ApiState>,
    Path(user): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(state.users.watch_alerts(&user).map(snapshot_event)).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::serve_fake;
    use crate::repository::tests::{healthy_upstream, repo_with};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn spawn_api(token: Option<&str>) -> String {
        let (repo, _pool) = repo_with(healthy_upstream()).await;
        repo.refresh_tickers().await.unwrap();
        repo.refresh_coins().await.unwrap();
        let users = repo.users().clone();
        let conversions = Arc::new(ConversionService::new(Arc::clone(&repo), users.clone()));
        let state = ApiState { repo, users, conversions, api_token: token.map(Arc::from) };
        serve_fake(router(state)).await
    }

    #[tokio::test]
    async fn health_and_tickers() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["tickers_in_memory"], 2);
        assert_eq!(health["live_connected"], false);

        let tickers: Vec<Ticker> = client.get(format!("{base}/tickers")).send().await.unwrap().json().await.unwrap();
        assert_eq!(tickers[0].symbol, "BTCUSDT");

        let one: Ticker = client.get(format!("{base}/tickers/ethusdt")).send().await.unwrap().json().await.unwrap();
        assert_eq!(one.last_price, 3000.0);

        let latency: Value = client.get(format!("{base}/stats/latency")).send().await.unwrap().json().await.unwrap();
        assert_eq!(latency["samples"], 2);
    }

    #[tokio::test]
    async fn candles_validate_interval() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/tickers/BTCUSDT/candles?interval=7m")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("7m"));

        let resp = client
            .get(format!("{base}/tickers/BTCUSDT/candles?interval=1h&limit=99999"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let candles: Vec<Candle> = resp.json().await.unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[tokio::test]
    async fn user_routes_require_token_when_configured() {
        let base = spawn_api(Some("secret")).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/users/alice/watchlist");

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = client.get(&url).bearer_auth("wrong").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = client.get(&url).bearer_auth("secret").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Market routes stay open.
        let resp = client.get(format!("{base}/tickers")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn watchlist_and_alert_lifecycle() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/users/alice/watchlist"))
            .json(&json!({ "symbol": "btcusdt" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let list: Vec<WatchlistEntry> = client
            .get(format!("{base}/users/alice/watchlist"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].symbol, "BTCUSDT");

        let watched: Value = client
            .get(format!("{base}/users/alice/watchlist/btcusdt"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(watched, json!({ "symbol": "BTCUSDT", "watched": true }));

        let resp = client.delete(format!("{base}/users/alice/watchlist/BTCUSDT")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = client.delete(format!("{base}/users/alice/watchlist/BTCUSDT")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client
            .post(format!("{base}/users/alice/alerts"))
            .json(&json!({ "symbol": "BTCUSDT", "condition": "sideways", "target_price": 1.0 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let alert: PriceAlert = client
            .post(format!("{base}/users/alice/alerts"))
            .json(&json!({ "symbol": "BTCUSDT", "condition": "above", "target_price": 70000.0 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!alert.triggered);

        let resp = client
            .post(format!("{base}/users/alice/alerts/{}/reset", alert.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = client.delete(format!("{base}/users/bob/alerts/{}", alert.id)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "other users cannot delete it");
        let resp = client.delete(format!("{base}/users/alice/alerts/{}", alert.id)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn preferences_partial_update() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/users/alice/preferences");

        let prefs: UserPreferences = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(prefs, UserPreferences::defaults_for("alice"));

        let prefs: UserPreferences = client
            .put(&url)
            .json(&json!({ "base_currency": "eur", "notifications_enabled": false }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(prefs.base_currency, "EUR");
        assert!(!prefs.notifications_enabled);
        assert_eq!(prefs.favorite_view, "tickers");

        let resp = client.put(&url).json(&json!({ "refresh_interval_secs": 0 })).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn convert_records_history() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let record: ConversionRecord = client
            .post(format!("{base}/users/alice/convert"))
            .json(&json!({ "amount": 2.0, "from": "BTC", "to": "USDT" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!((record.result - 128_000.0).abs() < 1e-6);

        let currencies: Vec<String> = client.get(format!("{base}/currencies")).send().await.unwrap().json().await.unwrap();
        assert!(currencies.contains(&"BTC".to_string()));
        assert!(currencies.contains(&"USD".to_string()));

        let resp = client
            .post(format!("{base}/users/alice/convert"))
            .json(&json!({ "amount": 1.0, "from": "BTC", "to": "NOPE" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let history: Vec<ConversionRecord> = client
            .get(format!("{base}/users/alice/conversions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.len(), 1);

        let removed: Value = client
            .delete(format!("{base}/users/alice/conversions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(removed["removed"], 1);
    }

    #[tokio::test]
    async fn search_records_user_history() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let hits: Vec<CoinSearchHit> = client
            .get(format!("{base}/users/alice/search?q=Bitcoin"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hits[0].id, "bitcoin");

        let history: Vec<SearchRecord> = client
            .get(format!("{base}/users/alice/searches"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history[0].query, "bitcoin");
    }

    #[tokio::test]
    async fn search_history_requires_token() {
        let base = spawn_api(Some("secret")).await;
        let client = reqwest::Client::new();

        // Open search works but never touches a user's history.
        let resp = client.get(format!("{base}/search?q=pwned&user=alice")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = client.get(format!("{base}/users/alice/search?q=pwned")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let history: Vec<SearchRecord> = client
            .get(format!("{base}/users/alice/searches"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(history.is_empty(), "got {history:?}");
    }

    async fn next_event(resp: &mut reqwest::Response) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .expect("event should arrive")
            .unwrap()
            .expect("stream open");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn watchlist_stream_pushes_snapshots() {
        let base = spawn_api(None).await;
        let client = reqwest::Client::new();

        let mut resp = client.get(format!("{base}/users/alice/streams/watchlist")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let first = next_event(&mut resp).await;
        assert!(first.contains("event: snapshot"));
        assert!(first.contains("data: []"));

        client
            .post(format!("{base}/users/alice/watchlist"))
            .json(&json!({ "symbol": "ETHUSDT" }))
            .send()
            .await
            .unwrap();
        let second = next_event(&mut resp).await;
        assert!(second.contains("ETHUSDT"), "got {second}");
    }
}
