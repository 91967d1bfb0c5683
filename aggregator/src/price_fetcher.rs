use std::time::Duration;

use log::{debug, warn};
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{error::FetchError, ttl_cache::TtlCell};

#[derive(Debug, Clone)]
pub struct PriceFetcherConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub ttl: Duration,
}

impl Default for PriceFetcherConfig {
    fn default() -> Self {
        PriceFetcherConfig {
            url: None,
            api_key: None,
            ttl: PriceFetcher::DEFAULT_TTL,
        }
    }
}

/// Token price from a market-data API, cached for `ttl`.
///
/// The price is optional data: every failure falls back to the last price seen, or
/// `None` if there never was one.
pub struct PriceFetcher {
    config: PriceFetcherConfig,
    http: reqwest::Client,
    cache: TtlCell<f64>,
    refresh_lock: Mutex<()>,
}

impl PriceFetcher {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(config: PriceFetcherConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(Self::TIMEOUT).build()?;
        Ok(PriceFetcher {
            cache: TtlCell::new(config.ttl),
            config,
            http,
            refresh_lock: Mutex::new(()),
        })
    }

    pub async fn get_price(&self) -> Option<f64> {
        if let Some(price) = self.cache.get() {
            return Some(*price);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(price) = self.cache.get() {
            return Some(*price);
        }

        match self.fetch().await {
            Ok(price) => {
                debug!("fetched token price {price}");
                Some(*self.cache.set(price))
            }
            Err(e) => {
                let last = self.cache.last().map(|price| *price);
                warn!(
                    "price fetch failed ({}): {e}; serving {}",
                    e.kind(),
                    last.map_or("no price".to_string(), |p| format!("last price {p}"))
                );
                last
            }
        }
    }

    async fn fetch(&self) -> Result<f64, FetchError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(FetchError::NotConfigured("price API key"))?;
        let url = self
            .config
            .url
            .as_deref()
            .ok_or(FetchError::NotConfigured("price API URL"))?;

        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .header("X-Api-Key", api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        parse_price(&body).ok_or(FetchError::MissingField("data.price"))
    }
}

/// `data.price` as a number or a numeric string.
fn parse_price(body: &Value) -> Option<f64> {
    match body.pointer("/data/price")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|price| price.is_finite())
}
