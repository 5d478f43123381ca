// =============================================================================
// Venue A adapter (§4.4, §6) — spot-style exchange reached over signed REST.
// =============================================================================
//
// Grounded in the teacher's `binance/client.rs`: HMAC-SHA256 request signing,
// an API-key header, and a recv-window tolerance for clock drift. Unsigned
// quantities with a separate `side` (§9 Open Question), native plan-order
// support.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{floor_to_step, is_retryable_transport, BrokerPort, Candle, Capabilities, OrderRequest, OrderResult, ProtectionOrders, RetryPolicy};
use crate::error::BrokerError;
use crate::rate_limiter::RateLimiter;
use crate::types::{AccountState, OrderStatus, Position, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// `place_order` is non-idempotent: a transport/rate-limit failure after
/// `send`'s own retries are exhausted means the submission outcome is
/// unknown, not rejected. This bounds how many times we re-check by
/// `client_id` before giving up and returning `BrokerError::Ambiguous`.
const MAX_PLACE_ORDER_AMBIGUITY_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct SymbolRules {
    qty_step: f64,
    price_step: f64,
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self { qty_step: 0.000001, price_step: 0.01 }
    }
}

pub struct VenueAAdapter {
    name: String,
    base_url: String,
    api_key: String,
    secret: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    symbol_rules: RwLock<HashMap<String, SymbolRules>>,
}

impl VenueAAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-VENUE-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: "venue_a".to_string(),
            base_url: base_url.into(),
            api_key,
            secret,
            client,
            limiter: RateLimiter::new(10.0, 20.0, 8),
            retry: RetryPolicy::default(),
            symbol_rules: RwLock::new(HashMap::new()),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
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
            return Err(BrokerError::Transport(format!("venue_a returned {status}: {body}")));
        }
        if !status.is_success() {
            return Err(BrokerError::VenueLogical(format!("venue_a returned {status}: {body}")));
        }

        Ok(body)
    }

    /// `send_once` wrapped in capped-exponential-jitter retry on transport
    /// errors and rate limiting (§4.4). `builder` must not carry a streaming
    /// body, since each retry re-clones it with a fresh signature timestamp.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, BrokerError> {
        let mut attempt = 0;
        loop {
            let this_attempt =
                builder.try_clone().expect("venue_a requests carry no streaming body and must be retry-clonable");
            match self.send_once(this_attempt).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.retry.max_retries && is_retryable_transport(&e) => {
                    let retry_after_ms = match &e {
                        BrokerError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
                        _ => None,
                    };
                    let delay = self.retry.backoff(attempt, retry_after_ms);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying venue_a request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn rules_for(&self, symbol: &str) -> SymbolRules {
        self.symbol_rules.read().get(symbol).copied().unwrap_or_default()
    }
}

#[async_trait]
impl BrokerPort for VenueAAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_native_protections: true,
            supports_plan_suborders: true,
            supports_cancel_plan: true,
            signed_quantities: false,
        }
    }

    #[instrument(skip(self), name = "venue_a::initialize")]
    async fn initialize(&self) -> Result<(), BrokerError> {
        debug!(api_key = "<redacted>", "venue_a adapter initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    #[instrument(skip(self), name = "venue_a::get_historical_klines")]
    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        let url = format!(
            "{}/api/v3/klines?symbol={symbol}&interval={interval}&startTime={start}&endTime={end}",
            self.base_url
        );
        let body = self.send(self.client.get(&url)).await?;
        let raw = body.as_array().ok_or_else(|| BrokerError::Protocol("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_numeric(&arr[1])?,
                high: parse_numeric(&arr[2])?,
                low: parse_numeric(&arr[3])?,
                close: parse_numeric(&arr[4])?,
                volume: parse_numeric(&arr[5])?,
            });
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "venue_a::get_current_price")]
    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let price = body["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| body["price"].as_f64())
            .ok_or_else(|| BrokerError::Protocol("missing 'price' in ticker response".into()))?;
        if price <= 0.0 {
            return Err(BrokerError::VenueLogical(format!("non-positive price for {symbol}")));
        }
        Ok(price)
    }

    #[instrument(skip(self), name = "venue_a::get_account_state")]
    async fn get_account_state(&self) -> Result<AccountState, BrokerError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{qs}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;

        let balances = body["balances"].as_array().ok_or_else(|| BrokerError::Protocol("missing balances".into()))?;
        let mut equity = 0.0;
        for b in balances {
            let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            equity += free;
        }

        Ok(AccountState {
            equity,
            balance: equity,
            currency: "USDT".to_string(),
            margin_used: 0.0,
            broker: self.name.clone(),
        })
    }

    #[instrument(skip(self), name = "venue_a::list_open_positions")]
    async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{qs}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;

        let balances = body["balances"].as_array().ok_or_else(|| BrokerError::Protocol("missing balances".into()))?;
        let mut positions = Vec::new();
        for b in balances {
            let asset = b["asset"].as_str().unwrap_or_default();
            let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            if free > 0.0 && asset != "USDT" {
                positions.push(Position {
                    symbol: format!("{asset}USDT"),
                    quantity: free,
                    avg_price: 0.0,
                    last_price: None,
                    unrealized_pnl: None,
                    broker: self.name.clone(),
                });
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self, request), name = "venue_a::place_order")]
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, BrokerError> {
        if let Some(client_id) = &request.client_id {
            if let Ok(Some(existing)) = self.get_plan_sub_order(client_id).await {
                debug!(client_id, "existing order found by client_id, skipping re-submission");
                return Ok(existing);
            }
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            request.symbol,
            match request.side {
                Side::Buy => "BUY",
                Side::Sell => "SELL",
            },
            match request.order_type {
                crate::types::OrderType::Market => "MARKET",
                crate::types::OrderType::Limit => "LIMIT",
            },
            request.quantity
        );
        if let Some(p) = request.price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(coid) = &request.client_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let mut attempt = 0;
        loop {
            let qs = self.signed_query(&params);
            let url = format!("{}/api/v3/order?{qs}", self.base_url);

            match self.send(self.client.post(&url)).await {
                Ok(body) => {
                    return Ok(OrderResult {
                        order_id: body["orderId"].to_string(),
                        client_id: request.client_id,
                        status: body["status"]
                            .as_str()
                            .and_then(|s| s.to_lowercase().parse().ok())
                            .unwrap_or(OrderStatus::Pending),
                        price: body["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(request.price.unwrap_or(0.0)),
                        quantity: request.quantity,
                    });
                }
                Err(e) if is_retryable_transport(&e) => {
                    // `send` already exhausted its own retry budget: this
                    // submission's outcome on the venue is unknown, so we
                    // must look it up by client_id before ever resubmitting.
                    if let Some(client_id) = &request.client_id {
                        if let Ok(Some(existing)) = self.get_plan_sub_order(client_id).await {
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
                    warn!(attempt, error = %e, "place_order ambiguous, retrying with a fresh signature");
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self), name = "venue_a::wait_for_order_final")]
    async fn wait_for_order_final(
        &self,
        order_id: Option<&str>,
        client_id: Option<&str>,
        symbol: &str,
        timeout: Duration,
    ) -> Result<OrderResult, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut params = format!("symbol={symbol}");
            if let Some(oid) = order_id {
                params.push_str(&format!("&orderId={oid}"));
            } else if let Some(coid) = client_id {
                params.push_str(&format!("&origClientOrderId={coid}"));
            }
            let qs = self.signed_query(&params);
            let url = format!("{}/api/v3/order?{qs}", self.base_url);
            let body = self.send(self.client.get(&url)).await?;

            let status: OrderStatus = body["status"].as_str().and_then(|s| s.to_lowercase().parse().ok()).unwrap_or(OrderStatus::Pending);
            if status.is_terminal() {
                return Ok(OrderResult {
                    order_id: body["orderId"].to_string(),
                    client_id: client_id.map(str::to_string),
                    status,
                    price: body["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    quantity: body["origQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(OrderResult {
                    order_id: body["orderId"].to_string(),
                    client_id: client_id.map(str::to_string),
                    status,
                    price: 0.0,
                    quantity: 0.0,
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    #[instrument(skip(self), name = "venue_a::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderResult>, BrokerError> {
        let qs = self.signed_query(&format!("symbol={symbol}"));
        let url = format!("{}/api/v3/openOrders?{qs}", self.base_url);
        let body = self.send(self.client.get(&url)).await?;
        let orders = body.as_array().cloned().unwrap_or_default();
        Ok(orders
            .into_iter()
            .map(|o| OrderResult {
                order_id: o["orderId"].to_string(),
                client_id: o["clientOrderId"].as_str().map(str::to_string),
                status: o["status"].as_str().and_then(|s| s.to_lowercase().parse().ok()).unwrap_or(OrderStatus::Pending),
                price: o["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                quantity: o["origQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })
            .collect())
    }

    #[instrument(skip(self), name = "venue_a::cancel_order")]
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), BrokerError> {
        let qs = self.signed_query(&format!("symbol={symbol}&orderId={order_id}"));
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "venue_a::place_protection_orders")]
    async fn place_protection_orders(
        &self,
        symbol: &str,
        qty: f64,
        sl_price: Option<f64>,
        tp_price: Option<f64>,
        sl_client_oid: Option<&str>,
        tp_client_oid: Option<&str>,
    ) -> Result<ProtectionOrders, BrokerError> {
        let mut result = ProtectionOrders::default();

        if let Some(sl) = sl_price {
            let mut params = format!("symbol={symbol}&side=SELL&type=STOP_LOSS&quantity={qty}&stopPrice={sl}");
            if let Some(coid) = sl_client_oid {
                params.push_str(&format!("&newClientOrderId={coid}"));
            }
            let qs = self.signed_query(&params);
            let url = format!("{}/api/v3/order?{qs}", self.base_url);
            let body = self.send(self.client.post(&url)).await?;
            let order_id = body["orderId"].to_string();
            if order_id.is_empty() || order_id == "null" {
                return Err(BrokerError::Protocol("venue_a returned empty SL order id".into()));
            }
            result.sl_order_id = Some(order_id);
        }

        if let Some(tp) = tp_price {
            let mut params = format!("symbol={symbol}&side=SELL&type=TAKE_PROFIT&quantity={qty}&stopPrice={tp}");
            if let Some(coid) = tp_client_oid {
                params.push_str(&format!("&newClientOrderId={coid}"));
            }
            let qs = self.signed_query(&params);
            let url = format!("{}/api/v3/order?{qs}", self.base_url);
            let body = self.send(self.client.post(&url)).await?;
            let order_id = body["orderId"].to_string();
            if order_id.is_empty() || order_id == "null" {
                return Err(BrokerError::Protocol("venue_a returned empty TP order id".into()));
            }
            result.tp_order_id = Some(order_id);
        }

        Ok(result)
    }

    #[instrument(skip(self), name = "venue_a::cancel_plan_order")]
    async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let qs = self.signed_query(&format!("orderId={order_id}"));
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn get_plan_sub_order(&self, plan_order_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        let qs = self.signed_query(&format!("origClientOrderId={plan_order_id}"));
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        match self.send(self.client.get(&url)).await {
            Ok(body) if !body["orderId"].is_null() => Ok(Some(OrderResult {
                order_id: body["orderId"].to_string(),
                client_id: Some(plan_order_id.to_string()),
                status: body["status"].as_str().and_then(|s| s.to_lowercase().parse().ok()).unwrap_or(OrderStatus::Pending),
                price: body["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                quantity: body["origQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })),
            Ok(_) => Ok(None),
            Err(BrokerError::VenueLogical(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "venue_a::close_position")]
    async fn close_position(&self, symbol: &str, reason: &str) -> Result<(), BrokerError> {
        let positions = self.list_open_positions().await?;
        let Some(pos) = positions.into_iter().find(|p| p.symbol == symbol) else {
            warn!(symbol, reason, "close_position: no open venue_a position");
            return Ok(());
        };

        self.place_order(OrderRequest {
            symbol: symbol.to_string(),
            side: Side::Sell,
            quantity: pos.quantity,
            order_type: crate::types::OrderType::Market,
            price: None,
            client_id: None,
        })
        .await?;
        Ok(())
    }

    fn normalize_qty(&self, symbol: &str, qty: f64) -> f64 {
        floor_to_step(qty, self.rules_for(symbol).qty_step)
    }

    fn normalize_price(&self, symbol: &str, price: f64) -> f64 {
        floor_to_step(price, self.rules_for(symbol).price_step)
    }
}

fn parse_numeric(value: &serde_json::Value) -> Result<f64, BrokerError> {
    if let Some(s) = value.as_str() {
        s.parse().map_err(|_| BrokerError::Protocol(format!("expected numeric string, got {s}")))
    } else if let Some(n) = value.as_f64() {
        Ok(n)
    } else {
        Err(BrokerError::Protocol(format!("expected number or numeric string, got {value}")))
    }
}

impl std::fmt::Debug for VenueAAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueAAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_same_payload() {
        let adapter = VenueAAdapter::new("key", "secret", "https://example.invalid");
        assert_eq!(adapter.sign("foo=bar"), adapter.sign("foo=bar"));
        assert_ne!(adapter.sign("foo=bar"), adapter.sign("foo=baz"));
    }

    #[test]
    fn capabilities_report_native_protection_support() {
        let adapter = VenueAAdapter::new("key", "secret", "https://example.invalid");
        let caps = adapter.capabilities();
        assert!(caps.supports_native_protections);
        assert!(caps.supports_plan_suborders);
        assert!(!caps.signed_quantities);
    }

    #[test]
    fn rate_limited_detection_matches_status_and_message() {
        assert!(VenueAAdapter::is_rate_limited_message(reqwest::StatusCode::TOO_MANY_REQUESTS, "ignored"));
        assert!(VenueAAdapter::is_rate_limited_message(reqwest::StatusCode::OK, "Too Many requests, slow down"));
        assert!(!VenueAAdapter::is_rate_limited_message(reqwest::StatusCode::OK, "insufficient balance"));
    }
}
