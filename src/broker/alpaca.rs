//! Alpaca Trading API client
//!
//! REST client for the Alpaca brokerage with:
//! - Automatic retry with exponential backoff for transient failures
//! - Per-service call budgeting through the shared rate limiter
//! - Circuit breaker so a failing API is not hammered
//!
//! Trading endpoints live on the account host (`base_url`), market data on
//! the data host. Credentials come from the environment only.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::types::{
    Account, BrokerPosition, Clock, OrderReport, OrderRequest, OrderStatus,
};
use super::BrokerClient;
use crate::common::{CircuitBreaker, RateLimiter};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ConfigError};
use crate::types::{Bar, Quote, Symbol, Timeframe};

/// Default host for market-data endpoints
pub const DATA_BASE_URL: &str = "https://data.alpaca.markets";

/// API credentials, loaded from the environment at startup
#[derive(Debug, Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Expects `ALPACA_API_KEY` and `ALPACA_SECRET_KEY`
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            std::env::var("ALPACA_API_KEY").map_err(|_| ConfigError::MissingEnv("ALPACA_API_KEY"))?;
        let api_secret = std::env::var("ALPACA_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnv("ALPACA_SECRET_KEY"))?;
        Ok(Self::new(api_key, api_secret))
    }
}

/// Alpaca REST client
#[derive(Clone)]
pub struct AlpacaClient {
    credentials: Credentials,
    http_client: Client,
    base_url: String,
    data_url: String,
    rate_limiter: RateLimiter,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    max_retries: u32,
}

impl AlpacaClient {
    /// Create a client budgeted to `budget_per_min` broker calls per minute
    pub fn new(credentials: Credentials, config: &BrokerConfig, budget_per_min: u32) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            credentials,
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            data_url: DATA_BASE_URL.to_string(),
            rate_limiter: RateLimiter::per_minute(budget_per_min),
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::with_defaults())),
            max_retries: config.max_retries,
        }
    }

    /// Build a client from config + environment and verify connectivity.
    /// A dead API key or unreachable broker aborts the service here.
    pub async fn connect(config: &BrokerConfig, budget_per_min: u32) -> Result<Self, ConfigError> {
        let credentials = match (&config.api_key, &config.api_secret) {
            (Some(k), Some(s)) => Credentials::new(k.clone(), s.clone()),
            _ => Credentials::from_env()?,
        };

        let client = Self::new(credentials, config, budget_per_min);
        client
            .get_account()
            .await
            .map_err(|e| ConfigError::ConnectionTest(e.to_string()))?;

        debug!("Broker connection verified ({})", client.base_url);
        Ok(client)
    }

    /// Execute a request with rate limiting, circuit breaker, and
    /// exponential-backoff retry for transient failures
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(BrokerError::Transient(
                    "circuit breaker open, rejecting request".to_string(),
                ));
            }
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                debug!("Retrying broker call after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            self.rate_limiter.acquire().await;

            match operation().await {
                Ok(result) => {
                    let mut cb = self.circuit_breaker.lock().await;
                    cb.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Broker call failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    // Permanent errors are not the broker's health failing
                    return Err(e);
                }
            }
        }

        {
            let mut cb = self.circuit_breaker.lock().await;
            cb.record_failure();
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Transient("request failed after retries".to_string())))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, BrokerError> {
        let response = self
            .http_client
            .get(url)
            .header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(BrokerError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Permanent(format!("malformed broker response: {e}")))
    }
}

// ==================== wire formats ====================
// Alpaca reports monetary quantities as decimal strings.

fn parse_decimal(s: &str, field: &str) -> Result<f64, BrokerError> {
    s.parse::<f64>()
        .map_err(|_| BrokerError::Permanent(format!("unparseable {field}: {s:?}")))
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    equity: String,
    cash: String,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
}

#[derive(Debug, Deserialize)]
struct WireQuoteEnvelope {
    quote: WireQuote,
}

#[derive(Debug, Deserialize)]
struct WireBarsEnvelope {
    #[serde(default)]
    bars: Option<Vec<Bar>>,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    status: OrderStatus,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
}

impl WireOrder {
    fn into_report(self) -> Result<OrderReport, BrokerError> {
        let filled_qty = match self.filled_qty.as_deref() {
            Some(s) => parse_decimal(s, "filled_qty")? as i64,
            None => 0,
        };
        let filled_avg_price = match self.filled_avg_price.as_deref() {
            Some(s) => Some(parse_decimal(s, "filled_avg_price")?),
            None => None,
        };
        Ok(OrderReport {
            id: self.id,
            status: self.status,
            filled_qty,
            filled_avg_price,
        })
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    async fn get_clock(&self) -> Result<Clock, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!("{}/v2/clock", self.base_url);
            async move { self.get_json::<Clock>(&url).await }
        })
        .await
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!("{}/v2/account", self.base_url);
            async move {
                let wire: WireAccount = self.get_json(&url).await?;
                Ok(Account {
                    equity: parse_decimal(&wire.equity, "equity")?,
                    cash: parse_decimal(&wire.cash, "cash")?,
                })
            }
        })
        .await
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!("{}/v2/positions", self.base_url);
            async move {
                let wire: Vec<WirePosition> = self.get_json(&url).await?;
                let mut positions = Vec::with_capacity(wire.len());
                for p in wire {
                    positions.push(BrokerPosition {
                        symbol: Symbol::new(p.symbol),
                        qty: parse_decimal(&p.qty, "qty")? as i64,
                        avg_entry_price: parse_decimal(&p.avg_entry_price, "avg_entry_price")?,
                    });
                }
                Ok(positions)
            }
        })
        .await
    }

    async fn get_latest_quote(&self, symbol: &Symbol) -> Result<Quote, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!(
                "{}/v2/stocks/{}/quotes/latest",
                self.data_url,
                symbol.as_str()
            );
            async move {
                let wire: WireQuoteEnvelope = self.get_json(&url).await?;
                Ok(Quote {
                    bid: wire.quote.bid_price,
                    ask: wire.quote.ask_price,
                })
            }
        })
        .await
    }

    async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!(
                "{}/v2/stocks/{}/bars?timeframe={}&limit={}",
                self.data_url,
                symbol.as_str(),
                timeframe.as_str(),
                limit
            );
            async move {
                let wire: WireBarsEnvelope = self.get_json(&url).await?;
                Ok(wire.bars.unwrap_or_default())
            }
        })
        .await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderReport, BrokerError> {
        // No retry: resubmitting an order that may have been accepted
        // would violate the one-in-flight-order invariant.
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(BrokerError::Transient(
                    "circuit breaker open, rejecting order".to_string(),
                ));
            }
        }
        self.rate_limiter.acquire().await;

        let mut body = serde_json::json!({
            "symbol": request.symbol.as_str(),
            "qty": request.qty.to_string(),
            "side": request.side,
            "type": request.order_type,
            "time_in_force": request.time_in_force,
        });
        if let Some(limit_price) = request.limit_price {
            body["limit_price"] = serde_json::json!(format!("{limit_price:.2}"));
        }

        let url = format!("{}/v2/orders", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let err = BrokerError::from_status(status, &text);
            let mut cb = self.circuit_breaker.lock().await;
            if err.is_transient() {
                cb.record_failure();
            }
            return Err(err);
        }

        let wire: WireOrder = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Permanent(format!("malformed order response: {e}")))?;
        let mut cb = self.circuit_breaker.lock().await;
        cb.record_success();
        drop(cb);
        wire.into_report()
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderReport, BrokerError> {
        self.execute_with_retry(|| {
            let url = format!("{}/v2/orders/{}", self.base_url, order_id);
            async move {
                let wire: WireOrder = self.get_json(&url).await?;
                wire.into_report()
            }
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self
            .http_client
            .delete(&url)
            .header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret)
            .send()
            .await?;

        let status = response.status();
        // 404: already gone; treat cancel as settled either way
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }

        let text = response.text().await?;
        Err(BrokerError::from_status(status, &text))
    }
}
