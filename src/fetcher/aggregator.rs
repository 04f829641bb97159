use std::collections::HashMap;

use tracing::debug;

use crate::error::Result;
use crate::fetcher::dto::{coin_from_dto, search_hit_from_dto, CoinMarketDto, SearchResponseDto};
use crate::fetcher::{build_http_client, get_json};
use crate::types::{now_ms, CoinInfo, CoinSearchHit};

/// Coin id → (vs currency → price).
pub type SimplePrices = HashMap<String, HashMap<String, f64>>;

/// REST client for the market-data aggregator (coin rankings, fiat prices, search).
#[derive(Clone)]
pub struct AggregatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl AggregatorClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// One page of coins ordered by market cap, priced in `vs_currency`.
    pub async fn fetch_markets(&self, vs_currency: &str, page: u32, per_page: u32) -> Result<Vec<CoinInfo>> {
        let url = format!("{}/coins/markets", self.base_url);
        let query = [
            ("vs_currency", vs_currency.to_lowercase()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", page.max(1).to_string()),
        ];
        let items: Vec<CoinMarketDto> = get_json(&self.client, &url, &query).await?;
        let now = now_ms();
        debug!(count = items.len(), page, "aggregator markets fetched");
        Ok(items.iter().map(|d| coin_from_dto(d, now)).collect())
    }

    /// Spot prices for coin ids in each of `vs_currencies`. Ids the aggregator does not
    /// know are simply absent from the result.
    pub async fn fetch_simple_prices(&self, ids: &[String], vs_currencies: &[String]) -> Result<SimplePrices> {
        if ids.is_empty() || vs_currencies.is_empty() {
            return Ok(SimplePrices::new());
        }
        let url = format!("{}/simple/price", self.base_url);
        let query = [
            ("ids", ids.join(",")),
            ("vs_currencies", vs_currencies.join(",").to_lowercase()),
        ];
        let raw: HashMap<String, HashMap<String, Option<f64>>> = get_json(&self.client, &url, &query).await?;
        Ok(raw
            .into_iter()
            .map(|(id, prices)| {
                let prices = prices
                    .into_iter()
                    .filter_map(|(cur, p)| p.filter(|v| v.is_finite()).map(|v| (cur, v)))
                    .collect();
                (id, prices)
            })
            .collect())
    }

    pub async fn search(&self, query: &str) -> Result<Vec<CoinSearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/search", self.base_url);
        let resp: SearchResponseDto = get_json(&self.client, &url, &[("query", query.to_string())]).await?;
        Ok(resp.coins.iter().map(search_hit_from_dto).collect())
    }
}
