// =============================================================================
// Broker Port (C4) — uniform asynchronous contract consumed by the router.
// =============================================================================

pub mod simulator;
pub mod venue_a;
pub mod venue_b;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::{AccountState, OrderType, Position, Side};

/// What an adapter actually supports, populated once at `initialize` —
/// replaces runtime `hasattr`-style reflection (§9 Design Notes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub supports_native_protections: bool,
    pub supports_plan_suborders: bool,
    pub supports_cancel_plan: bool,
    /// Whether `Position::quantity` is signed (futures-like) or always
    /// non-negative with direction tracked separately (spot/equities-like).
    pub signed_quantities: bool,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_id: Option<String>,
    pub status: crate::types::OrderStatus,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ProtectionOrders {
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The uniform contract every venue adapter (and the simulator) implements.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    fn name(&self) -> &str;

    /// Capability set, valid only after `initialize` has returned `Ok`.
    fn capabilities(&self) -> Capabilities;

    async fn initialize(&self) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    async fn get_account_state(&self) -> Result<AccountState, BrokerError>;

    async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, BrokerError>;

    async fn wait_for_order_final(
        &self,
        order_id: Option<&str>,
        client_id: Option<&str>,
        symbol: &str,
        timeout: Duration,
    ) -> Result<OrderResult, BrokerError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderResult>, BrokerError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), BrokerError>;

    async fn place_protection_orders(
        &self,
        symbol: &str,
        qty: f64,
        sl_price: Option<f64>,
        tp_price: Option<f64>,
        sl_client_oid: Option<&str>,
        tp_client_oid: Option<&str>,
    ) -> Result<ProtectionOrders, BrokerError>;

    async fn cancel_plan_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn get_plan_sub_order(&self, plan_order_id: &str) -> Result<Option<OrderResult>, BrokerError>;

    async fn close_position(&self, symbol: &str, reason: &str) -> Result<(), BrokerError>;

    fn normalize_qty(&self, symbol: &str, qty: f64) -> f64;
    fn normalize_price(&self, symbol: &str, price: f64) -> f64;
}

/// Floor `value` to `step` precision, rounding toward zero, per §4.4
/// Normalization.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

/// Capped exponential backoff with full jitter, shared by every venue
/// adapter's `send` retry loop (§4.4): on HTTP 429 or a rate-like API
/// message, and on transport errors, retry up to `max_retries` times,
/// honoring `Retry-After` when the venue provides one.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_s: f64,
    pub backoff_cap_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 4, backoff_base_s: 0.5, backoff_cap_s: 5.0 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        if let Some(ms) = retry_after_ms {
            if ms > 0 {
                return Duration::from_secs_f64((ms as f64 / 1000.0).min(self.backoff_cap_s));
            }
        }
        let exp = self.backoff_base_s * 2f64.powi(attempt as i32);
        let jitter = 0.5 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64((exp * jitter).min(self.backoff_cap_s))
    }
}

/// Transport hiccups and rate limiting are retryable by `send`; venue
/// rejections and protocol errors are not.
pub fn is_retryable_transport(e: &BrokerError) -> bool {
    matches!(e, BrokerError::Transport(_) | BrokerError::RateLimited { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_to_step_truncates_toward_zero() {
        assert!((floor_to_step(1.23456, 0.001) - 1.234).abs() < 1e-9);
        assert!((floor_to_step(0.0, 0.001) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn floor_to_step_with_zero_step_is_identity() {
        assert_eq!(floor_to_step(1.23456, 0.0), 1.23456);
    }
}
