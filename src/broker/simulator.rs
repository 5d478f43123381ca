// =============================================================================
// Simulated Broker (§4.4) — a first-class BrokerPort, not a test mock.
// =============================================================================
//
// Persists its book to the same state-directory convention as the rest of
// §4.2 so restarts resume from the last snapshot, and exercises the exact
// router/runner/protection code paths a real venue would.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{BrokerPort, Candle, Capabilities, OrderRequest, OrderResult, ProtectionOrders};
use crate::error::BrokerError;
use crate::state_store;
use crate::types::{AccountState, OrderStatus, Position, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPosition {
    symbol: String,
    quantity: f64,
    avg_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimBook {
    equity: f64,
    cash: f64,
    positions: Vec<SimPosition>,
}

impl Default for SimBook {
    fn default() -> Self {
        Self { equity: 10_000.0, cash: 10_000.0, positions: Vec::new() }
    }
}

/// Latency and slippage knobs; kept separate from `SimBook` so tests can
/// construct a deterministic simulator without touching persisted state.
#[derive(Debug, Clone, Copy)]
pub struct SimulatorParams {
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub slippage_bps: f64,
}

impl Default for SimulatorParams {
    fn default() -> Self {
        Self { latency_min_ms: 50, latency_max_ms: 300, slippage_bps: 10.0 }
    }
}

pub struct SimulatorBroker {
    name: String,
    state_path: PathBuf,
    params: SimulatorParams,
    book: Mutex<SimBook>,
    last_price: Mutex<std::collections::HashMap<String, f64>>,
}

impl SimulatorBroker {
    pub fn new(name: impl Into<String>, state_path: PathBuf, params: SimulatorParams) -> Self {
        let book = state_store::read_json(&state_path, SimBook::default());
        Self {
            name: name.into(),
            state_path,
            params,
            book: Mutex::new(book),
            last_price: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn persist(&self) -> Result<(), BrokerError> {
        let book = self.book.lock();
        state_store::write_json(&self.state_path, &*book)
            .map_err(|e| BrokerError::Other(e))
    }

    async fn simulated_latency(&self) {
        let ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.params.latency_min_ms..=self.params.latency_max_ms)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn fill_price(&self, reference: f64, side: Side) -> f64 {
        let mut rng = rand::thread_rng();
        // Slippage is asymmetric: it always works against the taker.
        let bps = self.params.slippage_bps * rng.gen_range(0.0..=1.0);
        let adj = reference * (bps / 10_000.0);
        match side {
            Side::Buy => reference + adj,
            Side::Sell => reference - adj,
        }
    }

    fn current_price_for(&self, symbol: &str) -> f64 {
        *self.last_price.lock().get(symbol).unwrap_or(&0.0)
    }

    /// Apply a fill to the book: averages into an existing same-direction
    /// position, reduces/closes/reverses against an opposite one.
    fn apply_fill(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<(), BrokerError> {
        let mut book = self.book.lock();
        let signed_delta = if side.is_buy() { qty } else { -qty };

        let idx = book.positions.iter().position(|p| p.symbol == symbol);
        match idx {
            None => {
                book.cash -= signed_delta * price;
                book.positions.push(SimPosition { symbol: symbol.to_string(), quantity: signed_delta, avg_price: price });
            }
            Some(i) => {
                let pos = &mut book.positions[i];
                let same_direction = (pos.quantity >= 0.0 && signed_delta >= 0.0) || (pos.quantity < 0.0 && signed_delta < 0.0);
                book.cash -= signed_delta * price;
                if same_direction {
                    let new_qty = pos.quantity + signed_delta;
                    pos.avg_price = (pos.avg_price * pos.quantity.abs() + price * signed_delta.abs()) / new_qty.abs().max(1e-12);
                    pos.quantity = new_qty;
                } else {
                    // Reduce, close, or reverse.
                    let closing_qty = signed_delta.abs().min(pos.quantity.abs());
                    let realized = closing_qty * (price - pos.avg_price) * pos.quantity.signum();
                    book.cash += realized;
                    pos.quantity += signed_delta;
                    if pos.quantity.abs() < 1e-12 {
                        book.positions.remove(i);
                    } else if signed_delta.abs() > closing_qty {
                        // Reversal: remaining delta opens the new side at this fill price.
                        pos.avg_price = price;
                    }
                }
            }
        }

        book.positions.retain(|p| p.quantity.abs() > 1e-12);
        book.equity = book.cash
            + book
                .positions
                .iter()
                .map(|p| p.quantity * self.current_price_for(&p.symbol).max(p.avg_price))
                .sum::<f64>();

        if book.equity < 0.0 {
            return Err(BrokerError::Other(anyhow::anyhow!(
                "simulator margin call: equity went negative ({:.2}) on {}",
                book.equity,
                symbol
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerPort for SimulatorBroker {
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

    #[instrument(skip(self), name = "simulator::initialize")]
    async fn initialize(&self) -> Result<(), BrokerError> {
        debug!(broker = %self.name, "simulator initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.persist()
    }

    async fn get_historical_klines(
        &self,
        _symbol: &str,
        _interval: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        Err(BrokerError::Unsupported("simulator does not serve historical klines".into()))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let price = self.current_price_for(symbol);
        if price <= 0.0 {
            return Err(BrokerError::VenueLogical(format!("no simulated ticker for {symbol}")));
        }
        Ok(price)
    }

    async fn get_account_state(&self) -> Result<AccountState, BrokerError> {
        let book = self.book.lock();
        Ok(AccountState {
            equity: book.equity,
            balance: book.cash,
            currency: "USD".to_string(),
            margin_used: 0.0,
            broker: self.name.clone(),
        })
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let book = self.book.lock();
        Ok(book
            .positions
            .iter()
            .map(|p| Position {
                symbol: p.symbol.clone(),
                quantity: p.quantity.abs(),
                avg_price: p.avg_price,
                last_price: Some(self.current_price_for(&p.symbol)),
                unrealized_pnl: None,
                broker: self.name.clone(),
            })
            .collect())
    }

    #[instrument(skip(self), name = "simulator::place_order")]
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, BrokerError> {
        self.simulated_latency().await;

        let reference = request.price.unwrap_or_else(|| self.current_price_for(&request.symbol));
        if reference <= 0.0 {
            return Err(BrokerError::VenueLogical(format!("no price reference for {}", request.symbol)));
        }
        let fill_price = self.fill_price(reference, request.side);
        self.last_price.lock().insert(request.symbol.clone(), fill_price);

        self.apply_fill(&request.symbol, request.side, request.quantity, fill_price)?;
        self.persist()?;

        Ok(OrderResult {
            order_id: uuid::Uuid::new_v4().to_string(),
            client_id: request.client_id,
            status: OrderStatus::Filled,
            price: fill_price,
            quantity: request.quantity,
        })
    }

    async fn wait_for_order_final(
        &self,
        _order_id: Option<&str>,
        _client_id: Option<&str>,
        _symbol: &str,
        _timeout: Duration,
    ) -> Result<OrderResult, BrokerError> {
        Err(BrokerError::Unsupported("simulator fills are synchronous; nothing to wait on".into()))
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OrderResult>, BrokerError> {
        Ok(Vec::new())
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<(), BrokerError> {
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
        Err(BrokerError::Unsupported("simulator has no native plan orders".into()))
    }

    async fn cancel_plan_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("simulator has no native plan orders".into()))
    }

    async fn get_plan_sub_order(&self, _plan_order_id: &str) -> Result<Option<OrderResult>, BrokerError> {
        Ok(None)
    }

    #[instrument(skip(self), name = "simulator::close_position")]
    async fn close_position(&self, symbol: &str, reason: &str) -> Result<(), BrokerError> {
        let quantity = {
            let book = self.book.lock();
            book.positions.iter().find(|p| p.symbol == symbol).map(|p| p.quantity)
        };
        let Some(quantity) = quantity else {
            warn!(symbol, reason, "close_position: no open simulated position");
            return Ok(());
        };

        let side = if quantity > 0.0 { Side::Sell } else { Side::Buy };
        let reference = self.current_price_for(symbol);
        let fill_price = self.fill_price(reference, side);
        self.apply_fill(symbol, side, quantity.abs(), fill_price)?;
        self.persist()?;
        debug!(symbol, reason, "simulated position closed");
        Ok(())
    }

    fn normalize_qty(&self, _symbol: &str, qty: f64) -> f64 {
        super::floor_to_step(qty, 0.0001)
    }

    fn normalize_price(&self, _symbol: &str, price: f64) -> f64 {
        super::floor_to_step(price, 0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_state_path(label: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("execution-core-sim-test-{label}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[tokio::test]
    async fn buy_then_sell_round_trip_restores_cash() {
        let path = tmp_state_path("roundtrip");
        let sim = SimulatorBroker::new("sim", path.clone(), SimulatorParams { slippage_bps: 0.0, ..Default::default() });
        sim.last_price.lock().insert("BTCUSDT".into(), 100.0);

        sim.place_order(OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 1.0,
            order_type: crate::types::OrderType::Market,
            price: Some(100.0),
            client_id: None,
        })
        .await
        .unwrap();

        let positions = sim.list_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].quantity - 1.0).abs() < 1e-9);

        sim.place_order(OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            quantity: 1.0,
            order_type: crate::types::OrderType::Market,
            price: Some(100.0),
            client_id: None,
        })
        .await
        .unwrap();

        let positions = sim.list_open_positions().await.unwrap();
        assert!(positions.is_empty());

        let account = sim.get_account_state().await.unwrap();
        assert!((account.equity - 10_000.0).abs() < 1e-6);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn state_persists_across_instances() {
        let path = tmp_state_path("persist");
        {
            let sim = SimulatorBroker::new("sim", path.clone(), SimulatorParams { slippage_bps: 0.0, ..Default::default() });
            sim.last_price.lock().insert("AAPL".into(), 50.0);
            sim.place_order(OrderRequest {
                symbol: "AAPL".into(),
                side: Side::Buy,
                quantity: 2.0,
                order_type: crate::types::OrderType::Market,
                price: Some(50.0),
                client_id: None,
            })
            .await
            .unwrap();
        }

        let reopened = SimulatorBroker::new("sim", path.clone(), SimulatorParams::default());
        let positions = reopened.list_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].quantity - 2.0).abs() < 1e-9);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn simulator_capabilities_have_no_native_support() {
        let path = tmp_state_path("caps");
        let sim = SimulatorBroker::new("sim", path.clone(), SimulatorParams::default());
        let caps = sim.capabilities();
        assert!(!caps.supports_native_protections);
        assert!(!caps.signed_quantities);
        let _ = std::fs::remove_file(&path);
    }
}
