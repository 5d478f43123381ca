// =============================================================================
// Execution Router (C5) — owns the broker map, enforces the daily-drawdown
// guard, and fans out best-effort "every venue" operations.
// =============================================================================
//
// Best-effort fan-out (`cancel_all_orders`, `close_all_positions`,
// `get_global_account_state`, `list_all_positions`) never raises: a broker
// that errors just logs and is skipped, unlike the ledger, which fails
// loudly (§4.5).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::broker::{BrokerPort, OrderRequest, OrderResult};
use crate::error::{BrokerError, PolicyError};
use crate::types::{ExecutionMode, GlobalAccountState, Position, Side};

struct DrawdownAnchor {
    day: NaiveDate,
    equity: f64,
}

/// Routes orders to the broker assigned to a symbol, and enforces the
/// portfolio-wide daily-drawdown guard (§4.5, scenario 6).
pub struct ExecutionRouter {
    brokers: HashMap<String, Arc<dyn BrokerPort>>,
    asset_routing: HashMap<String, String>,
    default_broker: String,
    max_daily_drawdown: f64,
    execution_mode: ExecutionMode,
    order_confirm_timeout: Duration,
    anchors: Mutex<HashMap<String, DrawdownAnchor>>,
}

impl ExecutionRouter {
    pub fn new(
        brokers: HashMap<String, Arc<dyn BrokerPort>>,
        asset_routing: HashMap<String, String>,
        default_broker: String,
        max_daily_drawdown: f64,
        execution_mode: ExecutionMode,
        order_confirm_timeout: Duration,
    ) -> Self {
        Self {
            brokers,
            asset_routing,
            default_broker,
            max_daily_drawdown,
            execution_mode,
            order_confirm_timeout,
            anchors: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker_for(&self, symbol: &str) -> Result<Arc<dyn BrokerPort>, BrokerError> {
        let name = self.asset_routing.get(symbol).unwrap_or(&self.default_broker);
        self.brokers
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::Other(anyhow::anyhow!("no broker registered under name {name}")))
    }

    pub fn broker_by_name(&self, name: &str) -> Option<Arc<dyn BrokerPort>> {
        self.brokers.get(name).cloned()
    }

    pub fn broker_names(&self) -> Vec<String> {
        self.brokers.keys().cloned().collect()
    }

    /// Snapshot today's anchor equity for `broker` the first time it's asked
    /// for on a new UTC day.
    fn anchor_for(&self, broker: &str, current_equity: f64) -> f64 {
        let today = Utc::now().date_naive();
        let mut anchors = self.anchors.lock();
        let anchor = anchors.entry(broker.to_string()).or_insert(DrawdownAnchor { day: today, equity: current_equity });
        if anchor.day != today {
            anchor.day = today;
            anchor.equity = current_equity;
        }
        anchor.equity
    }

    /// Refuse a `buy` if today's drawdown from the per-broker (or global
    /// fallback) anchor equity exceeds `max_daily_drawdown`. Sells always
    /// proceed — the guard exists to stop adding risk, not to block exits.
    pub async fn check_daily_drawdown(&self, broker_name: &str, side: Side) -> Result<(), PolicyError> {
        if self.max_daily_drawdown <= 0.0 || side == Side::Sell {
            return Ok(());
        }

        let current_equity = match self.broker_by_name(broker_name) {
            Some(broker) => match broker.get_account_state().await {
                Ok(state) => state.equity,
                Err(_) => {
                    let global = self.get_global_account_state().await;
                    global.equity
                }
            },
            None => self.get_global_account_state().await.equity,
        };

        let anchor = self.anchor_for(broker_name, current_equity);
        if anchor <= 0.0 {
            return Ok(());
        }

        let drawdown = (anchor - current_equity) / anchor;
        if drawdown >= self.max_daily_drawdown {
            return Err(PolicyError::DrawdownBreached(format!(
                "{broker_name}: anchor={anchor:.2} current={current_equity:.2} drawdown={drawdown:.4}"
            )));
        }
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Places the order and confirms it, per §4.5: risk-increasing `buy`
    /// orders are guarded by the daily-drawdown check before dispatch;
    /// exits are never blocked. Returns the final-status `OrderResult` via
    /// `wait_for_order_final` when the initial submission doesn't already
    /// come back terminal — on timeout that returns the last-known
    /// (non-terminal) state rather than failing, leaving pending-entry
    /// handling to the caller.
    pub async fn execute_order(&self, broker_name: &str, request: OrderRequest) -> Result<OrderResult, BrokerError> {
        self.check_daily_drawdown(broker_name, request.side)
            .await
            .map_err(|e| BrokerError::Other(anyhow::anyhow!(e)))?;

        let broker = self
            .broker_by_name(broker_name)
            .ok_or_else(|| BrokerError::Other(anyhow::anyhow!("no broker registered under name {broker_name}")))?;

        let symbol = request.symbol.clone();
        let client_id = request.client_id.clone();
        let result = broker.place_order(request).await?;
        if result.status.is_terminal() {
            return Ok(result);
        }

        broker
            .wait_for_order_final(Some(&result.order_id), client_id.as_deref(), &symbol, self.order_confirm_timeout)
            .await
    }

    /// Aggregate equity across every broker; a broker that fails to report
    /// is skipped, not fatal to the aggregate.
    pub async fn get_global_account_state(&self) -> GlobalAccountState {
        let mut global = GlobalAccountState::default();
        for (name, broker) in &self.brokers {
            match broker.get_account_state().await {
                Ok(state) => {
                    global.equity += state.equity;
                    global.balance += state.balance;
                    global.details.insert(name.clone(), state);
                }
                Err(e) => warn!(broker = name, error = %e, "get_global_account_state: broker unreachable, skipping"),
            }
        }
        global
    }

    pub async fn list_all_positions(&self) -> Vec<Position> {
        let mut all = Vec::new();
        for (name, broker) in &self.brokers {
            match broker.list_open_positions().await {
                Ok(mut positions) => all.append(&mut positions),
                Err(e) => warn!(broker = name, error = %e, "list_all_positions: broker unreachable, skipping"),
            }
        }
        all
    }

    /// Best-effort cancel-everything across every broker; used by the kill
    /// switch. Never returns an error — failures are logged per broker.
    pub async fn cancel_all_orders(&self) {
        for (name, broker) in &self.brokers {
            let symbols: Vec<String> = match broker.list_open_positions().await {
                Ok(positions) => positions.into_iter().map(|p| p.symbol).collect(),
                Err(e) => {
                    warn!(broker = name, error = %e, "cancel_all_orders: could not list positions, skipping");
                    continue;
                }
            };
            for symbol in symbols {
                match broker.get_open_orders(&symbol).await {
                    Ok(orders) => {
                        for order in orders {
                            if let Err(e) = broker.cancel_order(&order.order_id, &symbol).await {
                                error!(broker = name, symbol, order_id = order.order_id, error = %e, "failed to cancel order");
                            }
                        }
                    }
                    Err(e) => warn!(broker = name, symbol, error = %e, "cancel_all_orders: could not list open orders"),
                }
            }
        }
    }

    /// Best-effort market-close of every reported open position across
    /// every broker. Used by the kill switch.
    pub async fn close_all_positions(&self, reason: &str) {
        for (name, broker) in &self.brokers {
            let positions = match broker.list_open_positions().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(broker = name, error = %e, "close_all_positions: could not list positions, skipping");
                    continue;
                }
            };
            for position in positions {
                if let Err(e) = broker.close_position(&position.symbol, reason).await {
                    error!(broker = name, symbol = position.symbol, error = %e, "failed to close position");
                } else {
                    info!(broker = name, symbol = position.symbol, reason, "position closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Candle, Capabilities, ProtectionOrders};
    use crate::types::{AccountState, OrderStatus};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeBroker {
        equity: std::sync::atomic::AtomicU64,
        /// When set, `place_order` returns this status instead of `Filled`,
        /// so tests can exercise the `wait_for_order_final` confirmation path.
        initial_status: Option<OrderStatus>,
    }

    impl FakeBroker {
        fn new(equity: f64) -> Self {
            Self { equity: std::sync::atomic::AtomicU64::new(equity.to_bits()), initial_status: None }
        }

        fn new_pending(equity: f64) -> Self {
            Self { equity: std::sync::atomic::AtomicU64::new(equity.to_bits()), initial_status: Some(OrderStatus::Pending) }
        }

        fn set_equity(&self, equity: f64) {
            self.equity.store(equity.to_bits(), std::sync::atomic::Ordering::SeqCst);
        }

        fn equity(&self) -> f64 {
            f64::from_bits(self.equity.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl BrokerPort for FakeBroker {
        fn name(&self) -> &str {
            "fake"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn initialize(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_historical_klines(&self, _: &str, _: &str, _: i64, _: i64) -> Result<Vec<Candle>, BrokerError> {
            Ok(vec![])
        }
        async fn get_current_price(&self, _: &str) -> Result<f64, BrokerError> {
            Ok(100.0)
        }
        async fn get_account_state(&self) -> Result<AccountState, BrokerError> {
            Ok(AccountState { equity: self.equity(), balance: self.equity(), currency: "USD".into(), margin_used: 0.0, broker: "fake".into() })
        }
        async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError> {
            Ok(vec![])
        }
        async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult {
                order_id: "1".into(),
                client_id: request.client_id,
                status: self.initial_status.unwrap_or(OrderStatus::Filled),
                price: 100.0,
                quantity: request.quantity,
            })
        }
        async fn wait_for_order_final(&self, order_id: Option<&str>, client_id: Option<&str>, _: &str, _: Duration) -> Result<OrderResult, BrokerError> {
            Ok(OrderResult {
                order_id: order_id.unwrap_or_default().to_string(),
                client_id: client_id.map(str::to_string),
                status: OrderStatus::Filled,
                price: 100.0,
                quantity: 1.0,
            })
        }
        async fn get_open_orders(&self, _: &str) -> Result<Vec<OrderResult>, BrokerError> {
            Ok(vec![])
        }
        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn place_protection_orders(&self, _: &str, _: f64, _: Option<f64>, _: Option<f64>, _: Option<&str>, _: Option<&str>) -> Result<ProtectionOrders, BrokerError> {
            Ok(ProtectionOrders::default())
        }
        async fn cancel_plan_order(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn get_plan_sub_order(&self, _: &str) -> Result<Option<OrderResult>, BrokerError> {
            Ok(None)
        }
        async fn close_position(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        fn normalize_qty(&self, _: &str, qty: f64) -> f64 {
            qty
        }
        fn normalize_price(&self, _: &str, price: f64) -> f64 {
            price
        }
    }

    fn router_with(equity: f64, max_daily_drawdown: f64) -> (ExecutionRouter, Arc<FakeBroker>) {
        router_with_broker(Arc::new(FakeBroker::new(equity)), max_daily_drawdown)
    }

    fn router_with_broker(fake: Arc<FakeBroker>, max_daily_drawdown: f64) -> (ExecutionRouter, Arc<FakeBroker>) {
        let mut brokers: HashMap<String, Arc<dyn BrokerPort>> = HashMap::new();
        brokers.insert("fake".into(), fake.clone());
        let router = ExecutionRouter::new(
            brokers,
            HashMap::new(),
            "fake".into(),
            max_daily_drawdown,
            ExecutionMode::Paper,
            Duration::from_secs(5),
        );
        (router, fake)
    }

    #[tokio::test]
    async fn buy_refused_past_daily_drawdown_sell_still_allowed() {
        let (router, fake) = router_with(10_000.0, 0.05);
        router.check_daily_drawdown("fake", Side::Buy).await.unwrap();

        fake.set_equity(9_490.0);
        let err = router.check_daily_drawdown("fake", Side::Buy).await.unwrap_err();
        assert!(matches!(err, PolicyError::DrawdownBreached(_)));

        router.check_daily_drawdown("fake", Side::Sell).await.unwrap();
    }

    #[tokio::test]
    async fn guard_disabled_when_max_daily_drawdown_is_zero() {
        let (router, fake) = router_with(10_000.0, 0.0);
        router.check_daily_drawdown("fake", Side::Buy).await.unwrap();
        fake.set_equity(1.0);
        router.check_daily_drawdown("fake", Side::Buy).await.unwrap();
    }

    #[tokio::test]
    async fn execute_order_returns_result_unchanged_when_already_terminal() {
        let (router, _fake) = router_with(10_000.0, 0.0);
        let result = router
            .execute_order("fake", OrderRequest { symbol: "BTCUSDT".into(), side: Side::Buy, quantity: 1.0, order_type: crate::types::OrderType::Market, price: None, client_id: None })
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn execute_order_confirms_a_non_terminal_submission_via_wait_for_order_final() {
        let (router, _fake) = router_with_broker(Arc::new(FakeBroker::new_pending(10_000.0)), 0.0);
        let result = router
            .execute_order("fake", OrderRequest { symbol: "BTCUSDT".into(), side: Side::Buy, quantity: 1.0, order_type: crate::types::OrderType::Market, price: None, client_id: None })
            .await
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn global_account_state_aggregates_across_brokers() {
        let (router, _fake) = router_with(5_000.0, 0.0);
        let global = router.get_global_account_state().await;
        assert!((global.equity - 5_000.0).abs() < 1e-9);
        assert!(global.details.contains_key("fake"));
    }
}
