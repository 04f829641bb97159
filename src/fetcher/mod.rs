pub mod aggregator;
pub mod dto;
pub mod exchange;

pub use aggregator::AggregatorClient;
pub use exchange::ExchangeClient;

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};

pub(crate) fn build_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .user_agent(concat!("coin-tracker/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// GET `url` and decode the JSON body. Non-2xx responses become `AppError::Upstream`
/// carrying the status and a truncated body.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<T> {
    let resp = client.get(url).query(query).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
        debug!(url, status = status.as_u16(), "upstream request failed");
        return Err(AppError::Upstream { status: status.as_u16(), body });
    }
    Ok(resp.json::<T>().await?)
}

/// Serve a fixed router on an ephemeral local port and return its base URL.
#[cfg(test)]
pub(crate) async fn serve_fake(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
