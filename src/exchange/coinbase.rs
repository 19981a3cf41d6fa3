use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::exchange::PriceSource;

const API_HOST: &str = "api.coinbase.com";
const TOKEN_TTL_SECS: u64 = 120;
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// CDP key claims; the token is bound to one request line.
#[derive(Debug, Serialize)]
struct RequestClaims<'a> {
    sub: &'a str,
    iss: &'static str,
    nbf: u64,
    exp: u64,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    trades: Vec<TickerTrade>,
}

#[derive(Debug, Deserialize)]
struct TickerTrade {
    price: String,
}

/// Last-trade prices from the Coinbase Advanced Trade market endpoints.
pub struct CoinbaseTicker {
    client: Client,
    api_key: String,
    api_secret: String,
    last_request: Mutex<Option<Instant>>,
    cache: Mutex<HashMap<String, (Instant, f64)>>,
    cache_ttl: Duration,
}

/// `BTC/USDT:USDT` -> `BTC-USDT`.
pub fn product_id(pair: &str) -> String {
    let base = pair.split(':').next().unwrap_or(pair);
    base.replace('/', "-").to_uppercase()
}

impl CoinbaseTicker {
    pub fn new(cfg: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: cfg.coinbase_api_key.clone(),
            api_secret: cfg.coinbase_api_secret.clone(),
            last_request: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(2),
        }
    }

    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Bearer token for `GET path`, or None for anonymous market data.
    fn bearer_token(&self, path: &str) -> Result<Option<String>> {
        if !self.has_credentials() {
            return Ok(None);
        }
        let issued = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = RequestClaims {
            sub: &self.api_key,
            iss: "cdp",
            nbf: issued,
            exp: issued + TOKEN_TTL_SECS,
            uri: format!("GET {}{}", API_HOST, path),
        };
        let header = Header {
            kid: Some(self.api_key.clone()),
            ..Header::new(Algorithm::ES256)
        };
        let key = EncodingKey::from_ec_pem(self.api_secret.as_bytes())
            .context("COINBASE_API_SECRET is not an EC private key")?;
        let token = encode(&header, &claims, &key).context("Failed to sign ticker request")?;
        Ok(Some(token))
    }

    /// Space requests at least `MIN_REQUEST_INTERVAL` apart.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        let wait = (*last)
            .map(|prev| MIN_REQUEST_INTERVAL.saturating_sub(prev.elapsed()))
            .unwrap_or_default();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        *last = Some(Instant::now());
    }

    fn cached(&self, cache: &HashMap<String, (Instant, f64)>, product: &str) -> Option<f64> {
        cache
            .get(product)
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, price)| *price)
    }

    pub async fn get_current_price(&self, pair: &str) -> Result<f64> {
        let product = product_id(pair);
        if let Some(price) = self.cached(&*self.cache.lock().await, &product) {
            return Ok(price);
        }

        self.throttle().await;

        let path = format!("/api/v3/brokerage/market/products/{}/ticker", product);
        let mut request = self
            .client
            .get(format!("https://{}{}", API_HOST, path))
            .query(&[("limit", "1")]);
        if let Some(token) = self.bearer_token(&path)? {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("ticker request for {}", product))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ticker {} returned {}: {}", product, status, body);
        }

        let ticker: TickerResponse = resp
            .json()
            .await
            .with_context(|| format!("ticker body for {}", product))?;
        let price = ticker
            .trades
            .iter()
            .find_map(|t| t.price.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
            .with_context(|| format!("no usable trade price for {}", product))?;

        self.cache
            .lock()
            .await
            .insert(product, (Instant::now(), price));
        Ok(price)
    }
}

#[async_trait]
impl PriceSource for CoinbaseTicker {
    async fn current_price(&self, pair: &str) -> Result<f64> {
        self.get_current_price(pair).await
    }
}
