use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::ExchangeClient;
use crate::config::ExchangeConfig;
use crate::error::{BotError, FetchRange, Result};
use crate::models::{Account, HistoricRate, OrderInfo, OrderStatus, OrderType, Side};

pub const COINBASE_API_BASE: &str = "https://api.exchange.coinbase.com";
const MAX_RETRIES: u32 = 3;

type HmacSha256 = Hmac<Sha256>;

type CoinbaseRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
struct Credentials {
    api_key: String,
    /// Base64-decoded API secret
    secret: Vec<u8>,
    passphrase: String,
}

/// Why a request did not produce a 2xx body
#[derive(Debug)]
enum HttpFailure {
    NotFound(String),
    Status(StatusCode, String),
    Network(String),
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpFailure::NotFound(body) => write!(f, "not found: {}", body),
            HttpFailure::Status(status, body) => write!(f, "HTTP {}: {}", status, body),
            HttpFailure::Network(e) => write!(f, "network error: {}", e),
        }
    }
}

/// Coinbase Exchange REST client
///
/// Cloneable; all clones share one rate limiter. Requests are signed with the
/// CB-ACCESS-* headers when credentials are configured, which the order and
/// account endpoints require. Candles and server time are public.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<CoinbaseRateLimiter>,
    retry_backoff: Duration,
    price_decimals: usize,
}

impl CoinbaseClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let credentials = match (&config.api_key, &config.api_secret, &config.passphrase) {
            (Some(api_key), Some(secret), Some(passphrase)) => {
                let secret = BASE64.decode(secret.trim()).map_err(|e| {
                    BotError::Configuration(format!("API secret is not valid base64: {}", e))
                })?;
                Some(Credentials {
                    api_key: api_key.clone(),
                    secret,
                    passphrase: passphrase.clone(),
                })
            }
            _ => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("coinbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BotError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
            retry_backoff: Duration::from_secs(1),
            price_decimals: config.price_decimals,
        })
    }

    /// Client for the public endpoints only
    pub fn public(base_url: &str) -> Result<Self> {
        Self::new(&ExchangeConfig {
            base_url: base_url.to_string(),
            ..ExchangeConfig::default()
        })
    }

    /// Base delay of the exponential backoff between retries
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// base64(HMAC-SHA256(secret, timestamp + method + path + body))
    fn sign(secret: &[u8], timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| BotError::Configuration(format!("Invalid API secret: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Rate-limited request with retries on 429, 5xx and network errors
    ///
    /// POSTs are sent once: a retried order submission could open a second order.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> std::result::Result<String, HttpFailure> {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let url = format!("{}{}", self.base_url, path);

        let max_attempts = if method == Method::POST { 1 } else { MAX_RETRIES };
        let mut last_failure = HttpFailure::Network("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            self.rate_limiter.until_ready().await;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Content-Type", "application/json");

            if let Some(creds) = &self.credentials {
                let timestamp = Utc::now().timestamp().to_string();
                let signature = Self::sign(&creds.secret, &timestamp, method.as_str(), path, &body)
                    .map_err(|e| HttpFailure::Network(e.to_string()))?;
                request = request
                    .header("CB-ACCESS-KEY", &creds.api_key)
                    .header("CB-ACCESS-SIGN", signature)
                    .header("CB-ACCESS-TIMESTAMP", timestamp)
                    .header("CB-ACCESS-PASSPHRASE", &creds.passphrase);
            }

            if !body.is_empty() {
                request = request.body(body.clone());
            }

            let backoff = self.retry_backoff * 2u32.pow(attempt - 1);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        return Ok(text);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        tracing::warn!(
                            "Coinbase returned {} for {} {}, retrying in {:?} (attempt {}/{})",
                            status,
                            method,
                            path,
                            backoff,
                            attempt,
                            max_attempts
                        );
                        last_failure = HttpFailure::Status(status, text);
                        if attempt < max_attempts {
                            tokio::time::sleep(backoff).await;
                        }
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    if status == StatusCode::NOT_FOUND {
                        return Err(HttpFailure::NotFound(text));
                    }
                    return Err(HttpFailure::Status(status, text));
                }
                Err(e) => {
                    tracing::warn!(
                        "Network error on {} {}: {}, retrying in {:?} (attempt {}/{})",
                        method,
                        path,
                        e,
                        backoff,
                        attempt,
                        max_attempts
                    );
                    last_failure = HttpFailure::Network(e.to_string());
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_failure)
    }

    fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_decimals, price)
    }

    /// Sizes are floored so rounding never asks for more than is available
    fn format_size(size: f64) -> String {
        format!("{:.8}", (size * 1e8).floor() / 1e8)
    }

    async fn submit_order(&self, body: serde_json::Value) -> Result<OrderInfo> {
        tracing::debug!(order = %body, "Submitting order to Coinbase");

        let text = self
            .request(Method::POST, "/orders", Some(&body))
            .await
            .map_err(|e| BotError::OrderSubmission(e.to_string()))?;

        let order: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| BotError::OrderSubmission(format!("Malformed order response: {}", e)))?;
        Ok(order.into())
    }
}

#[async_trait]
impl ExchangeClient for CoinbaseClient {
    async fn get_time(&self) -> Result<DateTime<Utc>> {
        let text = self
            .request(Method::GET, "/time", None)
            .await
            .map_err(|e| BotError::Exchange(format!("Failed to get server time: {}", e)))?;

        let time: TimeResponse = serde_json::from_str(&text)?;
        let secs = time.epoch.floor() as i64;
        let nanos = ((time.epoch - time.epoch.floor()) * 1e9) as u32;

        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| BotError::Decode(format!("Invalid server epoch {}", time.epoch)))
    }

    async fn get_historic_rates(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity_secs: u32,
    ) -> Result<Vec<HistoricRate>> {
        let range = FetchRange { start, end };
        let path = format!(
            "/products/{}/candles?start={}&end={}&granularity={}",
            product_id,
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true),
            granularity_secs
        );

        let text = self
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| BotError::Fetch {
                range,
                reason: e.to_string(),
            })?;

        // [time, low, high, open, close, volume]
        let rows: Vec<[f64; 6]> = serde_json::from_str(&text).map_err(|e| BotError::Fetch {
            range,
            reason: format!("Malformed candle rows: {}", e),
        })?;

        Ok(rows
            .into_iter()
            .map(|[time, low, high, open, close, volume]| HistoricRate {
                time: time as i64,
                low,
                high,
                open,
                close,
                volume,
            })
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo> {
        let path = format!("/orders/{}", order_id);
        let text = self
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| match e {
                HttpFailure::NotFound(_) => BotError::OrderNotFound(order_id.to_string()),
                other => BotError::OrderQuery {
                    order_id: order_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let order: OrderResponse =
            serde_json::from_str(&text).map_err(|e| BotError::OrderQuery {
                order_id: order_id.to_string(),
                reason: format!("Malformed order response: {}", e),
            })?;
        Ok(order.into())
    }

    async fn place_limit_order(
        &self,
        product_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<OrderInfo> {
        self.submit_order(json!({
            "client_oid": uuid::Uuid::new_v4().to_string(),
            "product_id": product_id,
            "side": side.as_str(),
            "type": "limit",
            "price": self.format_price(price),
            "size": Self::format_size(size),
            "time_in_force": "GTC",
        }))
        .await
    }

    async fn place_market_order(
        &self,
        product_id: &str,
        side: Side,
        size: f64,
    ) -> Result<OrderInfo> {
        self.submit_order(json!({
            "client_oid": uuid::Uuid::new_v4().to_string(),
            "product_id": product_id,
            "side": side.as_str(),
            "type": "market",
            "size": Self::format_size(size),
        }))
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = format!("/orders/{}", order_id);
        self.request(Method::DELETE, &path, None)
            .await
            .map_err(|e| BotError::OrderCancel {
                order_id: order_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn get_accounts(&self) -> Result<Vec<Account>> {
        let text = self
            .request(Method::GET, "/accounts", None)
            .await
            .map_err(|e| BotError::Exchange(format!("Failed to list accounts: {}", e)))?;

        let accounts: Vec<AccountResponse> = serde_json::from_str(&text)?;
        Ok(accounts
            .into_iter()
            .map(|a| Account {
                currency: a.currency,
                balance: a.balance,
                available: a.available,
            })
            .collect())
    }
}

/// Coinbase encodes most decimals as strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Text(String),
    Float(f64),
}

impl Number {
    fn parse<E: serde::de::Error>(self) -> std::result::Result<f64, E> {
        match self {
            Number::Float(f) => Ok(f),
            Number::Text(s) => s.parse().map_err(E::custom),
        }
    }
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    Number::deserialize(deserializer)?.parse()
}

fn de_opt_f64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error> {
    Option::<Number>::deserialize(deserializer)?
        .map(Number::parse)
        .transpose()
}

#[derive(Debug, Deserialize)]
struct TimeResponse {
    epoch: f64,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    currency: String,
    #[serde(deserialize_with = "de_f64")]
    balance: f64,
    #[serde(deserialize_with = "de_f64")]
    available: f64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    product_id: String,
    side: Side,
    #[serde(rename = "type")]
    order_type: OrderType,
    status: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_f64")]
    size: f64,
    #[serde(default, deserialize_with = "de_f64")]
    filled_size: f64,
    #[serde(default, deserialize_with = "de_f64")]
    fill_fees: f64,
    #[serde(default, deserialize_with = "de_f64")]
    executed_value: f64,
    created_at: DateTime<Utc>,
}

impl OrderResponse {
    fn order_status(&self) -> OrderStatus {
        match (self.status.as_str(), self.done_reason.as_deref()) {
            ("done" | "settled", Some("canceled")) | ("rejected", _) => OrderStatus::Canceled,
            ("done" | "settled", _) => OrderStatus::Filled,
            _ => OrderStatus::Open,
        }
    }
}

impl From<OrderResponse> for OrderInfo {
    fn from(order: OrderResponse) -> Self {
        let status = order.order_status();
        OrderInfo {
            id: order.id,
            product_id: order.product_id,
            side: order.side,
            order_type: order.order_type,
            status,
            price: order.price,
            size: order.size,
            filled_size: order.filled_size,
            fill_fees: order.fill_fees,
            executed_value: order.executed_value,
            created_at: order.created_at,
        }
    }
}
