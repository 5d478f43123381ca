// =============================================================================
// Venue B adapter (§4.4) — equities-style broker reached over a bearer-token
// REST API.
// =============================================================================
//
// No native plan-order support: `place_protection_orders` and friends return
// `BrokerError::Unsupported` rather than a venue rejection, forcing callers
// to branch on the capability set instead of probing for the method (§9).
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, instrument, warn};

use super::{floor_to_step, is_retryable_transport, BrokerPort, Candle, Capabilities, OrderRequest, OrderResult, ProtectionOrders, RetryPolicy};
use crate::error::BrokerError;
use crate::rate_limiter::RateLimiter;
use crate::types::{AccountState, OrderStatus, Position, Side};

/// `place_order` is non-idempotent: see the matching constant in
/// `venue_a.rs`.
const MAX_PLACE_ORDER_AMBIGUITY_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct SymbolRules {
    qty_step: f64,
    price_step: f64,
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self { qty_step: 1.0, price_step: 0.01 }
    }
}

pub struct VenueBAdapter {
    name: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    symbol_rules: RwLock<HashMap<String, SymbolRules>>,
}

impl VenueBAdapter {
    pub fn new(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let token = token.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(reqwest::header::AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: "venue_b".to_string(),
            base_url: base_url.into(),
            token,
            client,
            limiter: RateLimiter::new(5.0, 10.0, 4),
            retry: RetryPolicy::default(),
            symbol_rules: RwLock::new(HashMap::new()),
        }
    }

    fn is_rate_limited_message(status: reqwest::StatusCode, body: &str) -> bool {
        if status.as_u16() == 429 {
            return true;
        }
        let lower = body.to_lowercase();
        ["too many", "rate", "frequency", "busy"].iter().any(|needle| lower.contains(needle))
    }

    /// Single attempt: acquire a rate-limiter slot, issue the request,
    /// classify the outcome. Does not retry.
    async fn send_once(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, BrokerError> {
        let _guard = self.limiter.acquire(1.0).await;

        let resp = builder.send().await.map_err(|e| BrokerError::Transport(e.to_string()))?;
        let status = resp.status();
        let retry_after_ms = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0).round() as u64);
        let text = resp.text().await.map_err(|e| BrokerError::Protocol(e.to_string()))?;

        if Self::is_rate_limited_message(status, &text) {
            return Err(BrokerError::RateLimited { message: text, retry_after_ms });
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Protocol(format!("non-JSON response: {e}: {text}")))?;

        if status.is_server_error() {
            return Err(BrokerError::Transport(format!("venue_b returned {status}: {body}")));
        }
        if !status.is_success() {
            return Err(BrokerError::VenueLogical(format!("venue_b returned {status}: {body}")));
        }

        Ok(body)
    }

    /// `send_once` wrapped in capped-exponential-jitter retry on transport
    /// errors and rate limiting (§4.4).
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, BrokerError> {
        let mut attempt = 0;
        loop {
            let this_attempt =
                builder.try_clone().expect("venue_b requests carry no streaming body and must be retry-clonable");
            match self.send_once(this_attempt).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.retry.max_retries && is_retryable_transport(&e) => {
                    let retry_after_ms = match &e {
                        BrokerError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
                        _ => None,
                    };
                    let delay = self.retry.backoff(attempt, retry_after_ms);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying venue_b request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Venue B has no generic plan-sub-order lookup (`get_plan_sub_order`
    /// always returns `None`, §4.4), but it does let orders be found by the
    /// client-assigned id directly — the only lookup `place_order` needs
    /// before retrying a submission whose outcome is ambiguous.
    async fn find_order_by_client_id(&self, client_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        let url = format!("{}/v2/orders:by_client_order_id?client_order_id={client_id}", self.base_url);
        match self.send(self.client.get(&url)).await {
            Ok(body) if !body["id"].is_null() => Ok(Some(OrderResult {
                order_id: body["id"].as_str().unwrap_or_default().to_string(),
                client_id: Some(client_id.to_string()),
                status: body["status"].as_str().and_then(|s| s.parse().ok()).unwrap_or(OrderStatus::Pending),
                price: body["filled_avg_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                quantity: body["filled_qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })),
            Ok(_) => Ok(None),
            Err(BrokerError::VenueLogical(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn rules_for(&self, symbol: &str) -> SymbolRules {
        self.symbol_rules.read().get(symbol).copied().unwrap_or_default()
    }
}

#[async_trait]
impl BrokerPort for VenueBAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_native_protections: false,
            supports_plan_suborders: false,
            supports_cancel_plan: false,
            signed_quantities: false,
        }
    }

    #[instrument(skip(self), name = "venue_b::initialize")]
    async fn initialize(&self) -> Result<(), BrokerError> {
        debug!(token = "<redacted>", "venue_b adapter initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    #[instrument(skip(self), name = "venue_b::get_historical_klines")]
    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        let url = format!("{}/v2/bars/{symbol}?timeframe={interval}&start={start}&end={end}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let raw = body["bars"].as_array().ok_or_else(|| BrokerError::Protocol("missing 'bars' array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for bar in raw {
            candles.push(Candle {
                open_time: bar["t"].as_i64().unwrap_or(0),
                open: bar["o"].as_f64().unwrap_or(0.0),
                high: bar["h"].as_f64().unwrap_or(0.0),
                low: bar["l"].as_f64().unwrap_or(0.0),
                close: bar["c"].as_f64().unwrap_or(0.0),
                volume: bar["v"].as_f64().unwrap_or(0.0),
            });
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "venue_b::get_current_price")]
    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let url = format!("{}/v2/quotes/{symbol}/latest", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let price = body["quote"]["ap"]
            .as_f64()
            .or_else(|| body["quote"]["bp"].as_f64())
            .ok_or_else(|| BrokerError::Protocol("missing quote price".into()))?;
        if price <= 0.0 {
            return Err(BrokerError::VenueLogical(format!("non-positive price for {symbol}")));
        }
        Ok(price)
    }

    #[instrument(skip(self), name = "venue_b::get_account_state")]
    async fn get_account_state(&self) -> Result<AccountState, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let equity = body["equity"].as_str().and_then(|s| s.parse().ok()).or_else(|| body["equity"].as_f64()).unwrap_or(0.0);
        let cash = body["cash"].as_str().and_then(|s| s.parse().ok()).or_else(|| body["cash"].as_f64()).unwrap_or(0.0);
        Ok(AccountState {
            equity,
            balance: cash,
            currency: "USD".to_string(),
            margin_used: (equity - cash).max(0.0),
            broker: self.name.clone(),
        })
    }

    #[instrument(skip(self), name = "venue_b::list_open_positions")]
    async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let url = format!("{}/v2/positions", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let raw = body.as_array().cloned().unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter_map(|p| {
                let symbol = p["symbol"].as_str()?.to_string();
                let quantity: f64 = p["qty"].as_str().and_then(|s| s.parse().ok())?;
                let avg_price: f64 = p["avg_entry_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                Some(Position {
                    symbol,
                    quantity: quantity.abs(),
                    avg_price,
                    last_price: p["current_price"].as_str().and_then(|s| s.parse().ok()),
                    unrealized_pnl: p["unrealized_pl"].as_str().and_then(|s| s.parse().ok()),
                    broker: self.name.clone(),
                })
            })
            .collect())
    }

    #[instrument(skip(self, request), name = "venue_b::place_order")]
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, BrokerError> {
        if let Some(client_id) = &request.client_id {
            if let Ok(Some(existing)) = self.find_order_by_client_id(client_id).await {
                debug!(client_id, "existing order found by client_id, skipping re-submission");
                return Ok(existing);
            }
        }

        let mut payload = serde_json::json!({
            "symbol": request.symbol,
            "qty": request.quantity.to_string(),
            "side": match request.side { Side::Buy => "buy", Side::Sell => "sell" },
            "type": match request.order_type { crate::types::OrderType::Market => "market", crate::types::OrderType::Limit => "limit" },
            "time_in_force": "day",
        });
        if let Some(p) = request.price {
            payload["limit_price"] = serde_json::json!(p.to_string());
        }
        if let Some(coid) = &request.client_id {
            payload["client_order_id"] = serde_json::json!(coid);
        }

        let url = format!("{}/v2/orders", self.base_url);
        let mut attempt = 0;
        loop {
            match self.send(self.client.post(&url).json(&payload)).await {
                Ok(body) => {
                    return Ok(OrderResult {
                        order_id: body["id"].as_str().unwrap_or_default().to_string(),
                        client_id: request.client_id,
                        status: body["status"].as_str().and_then(|s| s.parse().ok()).unwrap_or(OrderStatus::Pending),
                        price: body["filled_avg_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        quantity: request.quantity,
                    });
                }
                Err(e) if is_retryable_transport(&e) => {
                    if let Some(client_id) = &request.client_id {
                        if let Ok(Some(existing)) = self.find_order_by_client_id(client_id).await {
                            warn!(client_id, "place_order outcome was ambiguous, resolved existing order via client_id lookup");
                            return Ok(existing);
                        }
                    }
                    if attempt >= MAX_PLACE_ORDER_AMBIGUITY_RETRIES {
                        return Err(BrokerError::Ambiguous(format!(
                            "place_order outcome unknown after {attempt} retries with no matching order by client_id: {e}"
                        )));
                    }
                    attempt += 1;
                    warn!(attempt, error = %e, "place_order ambiguous, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self), name = "venue_b::wait_for_order_final")]
    async fn wait_for_order_final(
        &self,
        order_id: Option<&str>,
        _client_id: Option<&str>,
        _symbol: &str,
        timeout: Duration,
    ) -> Result<OrderResult, BrokerError> {
        let Some(order_id) = order_id else {
            return Err(BrokerError::Protocol("wait_for_order_final requires an order_id for venue_b".into()));
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let url = format!("{}/v2/orders/{order_id}", self.base_url);
            let body = self.send(self.client.get(&url)).await?;
            let status: OrderStatus = body["status"].as_str().and_then(|s| s.parse().ok()).unwrap_or(OrderStatus::Pending);

            if status.is_terminal() {
                return Ok(OrderResult {
                    order_id: order_id.to_string(),
                    client_id: body["client_order_id"].as_str().map(str::to_string),
                    status,
                    price: body["filled_avg_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    quantity: body["filled_qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(OrderResult { order_id: order_id.to_string(), client_id: None, status, price: 0.0, quantity: 0.0 });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    #[instrument(skip(self), name = "venue_b::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderResult>, BrokerError> {
        let url = format!("{}/v2/orders?status=open&symbols={symbol}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let raw = body.as_array().cloned().unwrap_or_default();
        Ok(raw
            .into_iter()
            .map(|o| OrderResult {
                order_id: o["id"].as_str().unwrap_or_default().to_string(),
                client_id: o["client_order_id"].as_str().map(str::to_string),
                status: o["status"].as_str().and_then(|s| s.parse().ok()).unwrap_or(OrderStatus::Pending),
                price: o["limit_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                quantity: o["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })
            .collect())
    }

    #[instrument(skip(self), name = "venue_b::cancel_order")]
    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn place_protection_orders(
        &self,
        _symbol: &str,
        _qty: f64,
        _sl_price: Option<f64>,
        _tp_price: Option<f64>,
        _sl_client_oid: Option<&str>,
        _tp_client_oid: Option<&str>,
    ) -> Result<ProtectionOrders, BrokerError> {
        Err(BrokerError::Unsupported("venue_b has no native plan orders; use synthetic protections".into()))
    }

    async fn cancel_plan_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("venue_b has no native plan orders".into()))
    }

    async fn get_plan_sub_order(&self, _plan_order_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        Ok(None)
    }

    #[instrument(skip(self), name = "venue_b::close_position")]
    async fn close_position(&self, symbol: &str, reason: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/positions/{symbol}", self.base_url);
        match self.send(self.client.delete(&url)).await {
            Ok(_) => {
                debug!(symbol, reason, "venue_b position closed");
                Ok(())
            }
            Err(BrokerError::VenueLogical(msg)) if msg.contains("404") => {
                warn!(symbol, reason, "close_position: no open venue_b position");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn normalize_qty(&self, symbol: &str, qty: f64) -> f64 {
        floor_to_step(qty, self.rules_for(symbol).qty_step)
    }

    fn normalize_price(&self, symbol: &str, price: f64) -> f64 {
        floor_to_step(price, self.rules_for(symbol).price_step)
    }
}

impl std::fmt::Debug for VenueBAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueBAdapter")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_report_no_native_support() {
        let adapter = VenueBAdapter::new("token", "https://example.invalid");
        let caps = adapter.capabilities();
        assert!(!caps.supports_native_protections);
        assert!(!caps.supports_plan_suborders);
        assert!(!caps.supports_cancel_plan);
    }

    #[test]
    fn rate_limited_detection_matches_status_and_message() {
        assert!(VenueBAdapter::is_rate_limited_message(reqwest::StatusCode::TOO_MANY_REQUESTS, "ignored"));
        assert!(VenueBAdapter::is_rate_limited_message(reqwest::StatusCode::OK, "busy, try later"));
        assert!(!VenueBAdapter::is_rate_limited_message(reqwest::StatusCode::OK, "order rejected"));
    }
}
