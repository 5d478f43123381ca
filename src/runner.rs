// =============================================================================
// Strategy Runner (C7) — the single-writer cycle loop: reload signals, check
// protective exits, size and dispatch new trades, persist state, heartbeat.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::alerter::Alerter;
use crate::config::RunnerConfig;
use crate::error::{PolicyError, RunnerError};
use crate::ledger::Ledger;
use crate::protection::{ArmParams, ProtectionEngine};
use crate::router::ExecutionRouter;
use crate::state_store;
use crate::types::{
    make_client_id, make_trade_id, signal_fingerprint, OrderRole, OrderStatus, OrderType, PositionSide, Side,
    SignalRow,
};

/// What survives a restart: the last signal fingerprint seen per symbol and
/// the timestamp of the last fully processed cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunnerState {
    pub last_seen: HashMap<String, String>,
    pub last_processed_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    ts: i64,
    status: String,
    reason: Option<String>,
}

/// Confidence threshold above which a signal is actionable. Not exposed as a
/// config knob in the distilled spec; kept as an internal constant alongside
/// the risk-scaling formula it feeds.
const SIGNAL_THRESHOLD: f64 = 0.55;

pub struct StrategyRunner {
    config: RunnerConfig,
    router: Arc<ExecutionRouter>,
    ledger: Arc<Ledger>,
    protections: Arc<ProtectionEngine>,
    alerter: Arc<dyn Alerter>,
    state: AsyncMutex<RunnerState>,
    trading_lock: AsyncMutex<()>,
    kill_switch: AtomicBool,
}

impl StrategyRunner {
    pub fn new(
        config: RunnerConfig,
        router: Arc<ExecutionRouter>,
        ledger: Arc<Ledger>,
        protections: Arc<ProtectionEngine>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let state = state_store::read_json(&config.runner_state_file, RunnerState::default());
        Self {
            config,
            router,
            ledger,
            protections,
            alerter,
            state: AsyncMutex::new(state),
            trading_lock: AsyncMutex::new(()),
            kill_switch: AtomicBool::new(false),
        }
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst) || state_store::read_json(&self.config.kill_switch_file, false)
    }

    // -------------------------------------------------------------------
    // Start-up reconciliation (§4.7)
    // -------------------------------------------------------------------

    /// Must succeed before the first cycle runs: a broker that can't be
    /// reached here means position truth is unknown, which is fatal.
    pub async fn reconcile_at_startup(&self) -> Result<(), RunnerError> {
        for broker_name in self.router.broker_names() {
            let broker = self
                .router
                .broker_by_name(&broker_name)
                .expect("broker_names() only returns registered brokers");

            let positions = broker.list_open_positions().await.map_err(RunnerError::Broker)?;

            for symbol in self.protections.symbols() {
                let Some(protection) = self.protections.get(&symbol) else { continue };
                if protection.broker != broker_name {
                    continue;
                }
                match positions.iter().find(|p| p.symbol == symbol) {
                    None => {
                        self.ledger.close_trade(&protection.trade_id, protection.last_price, "reconcile_protection_orphaned")?;
                        self.protections.drop_protection(&symbol)?;
                        warn!(symbol, "reconciliation: dropped orphaned protection, closed trade");
                    }
                    Some(position) => {
                        if let Err(e) = self.ledger.set_trade_entry(&protection.trade_id, position.avg_price, position.quantity) {
                            warn!(symbol, error = %e, "reconciliation: failed to sync trade entry to broker truth");
                        }
                    }
                }
            }

            for position in &positions {
                if !self.ledger.has_open_trade(&broker_name, &position.symbol)? {
                    let trade_id = make_trade_id(&broker_name, &position.symbol, "reconcile_orphan_position");
                    let side = if position.quantity >= 0.0 { Side::Buy } else { Side::Sell };
                    self.ledger.upsert_trade(
                        &trade_id,
                        "reconcile",
                        &broker_name,
                        &position.symbol,
                        side,
                        "reconcile_orphan_position",
                        "",
                    )?;
                    self.ledger.set_trade_entry(&trade_id, position.avg_price, position.quantity)?;
                    warn!(symbol = position.symbol, broker_name, "reconciliation: created orphan trade for untracked live position");
                }
                if self.protections.get(&position.symbol).is_none() {
                    warn!(symbol = position.symbol, broker_name, "reconciliation: live position has no protection armed");
                }
            }

            for trade in self.ledger.list_open_trades(Some(&broker_name))? {
                if !positions.iter().any(|p| p.symbol == trade.symbol) {
                    let price = broker.get_current_price(&trade.symbol).await.unwrap_or(trade.entry_price.unwrap_or(0.0));
                    self.ledger.close_trade(&trade.trade_id, price, "reconcile_missing_position")?;
                    warn!(symbol = trade.symbol, broker_name, "reconciliation: closed trade with no matching live position");
                }
            }
        }

        info!("start-up reconciliation complete");
        Ok(())
    }

    // -------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------

    pub async fn run_cycle(&self, signals: &HashMap<String, SignalRow>) -> Result<(), RunnerError> {
        let _lock = self.trading_lock.lock().await;

        if self.kill_switch_engaged() {
            return Err(RunnerError::Policy(PolicyError::KillSwitchActive));
        }

        self.check_protective_exits(signals).await?;

        let mut state = self.state.lock().await;
        for symbol in &self.config.assets {
            let Some(signal) = signals.get(symbol) else { continue };
            let fingerprint = signal_fingerprint(symbol, signal.timestamp, signal.p_long, signal.p_short);
            if state.last_seen.get(symbol) == Some(&fingerprint) {
                continue;
            }
            state.last_seen.insert(symbol.clone(), fingerprint);
            drop(state);
            self.handle_signal(symbol, signal).await?;
            state = self.state.lock().await;
        }

        state.last_processed_ts = Some(Utc::now().timestamp());
        state_store::write_json(&self.config.runner_state_file, &*state).map_err(RunnerError::Store)?;
        drop(state);

        self.touch_heartbeat("running", None)?;
        Ok(())
    }

    async fn check_protective_exits(&self, signals: &HashMap<String, SignalRow>) -> Result<(), RunnerError> {
        for symbol in self.protections.symbols() {
            let Some(protection) = self.protections.get(&symbol) else { continue };
            let broker = self.router.broker_by_name(&protection.broker).ok_or_else(|| {
                RunnerError::Broker(crate::error::BrokerError::Other(anyhow::anyhow!("unknown broker {}", protection.broker)))
            })?;

            if protection.pending.is_some() {
                self.protections.resolve_pending_entry(&symbol, &self.ledger, broker.as_ref(), self.config.strict_protections_live).await?;
                continue;
            }

            let price = match broker.get_current_price(&symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol, error = %e, "could not fetch current price for protective exit check");
                    continue;
                }
            };

            self.protections.check_and_trigger(&symbol, price, &self.ledger, broker.as_ref()).await?;
            let signal = signals.get(&symbol);
            self.protections
                .update_trailing(&symbol, price, signal, &self.ledger, broker.as_ref(), self.config.strict_protections_live)
                .await?;
        }
        Ok(())
    }

    async fn handle_signal(&self, symbol: &str, signal: &SignalRow) -> Result<(), RunnerError> {
        let broker_name = self.config.asset_routing.get(symbol).cloned().unwrap_or_else(|| self.config.default_broker.clone());
        let broker = self.router.broker_by_name(&broker_name).ok_or_else(|| {
            RunnerError::Broker(crate::error::BrokerError::Other(anyhow::anyhow!("unknown broker {broker_name}")))
        })?;

        let has_open_trade = self.ledger.has_open_trade(&broker_name, symbol)?;
        let open_trade_count = self.ledger.list_open_trades(None)?.len() as u32;

        if signal.p_long > SIGNAL_THRESHOLD && !has_open_trade {
            if self.config.max_open_positions > 0 && open_trade_count >= self.config.max_open_positions {
                warn!(symbol, "max open positions reached, skipping buy signal");
                return Ok(());
            }
            self.execute_trade(symbol, &broker_name, broker.as_ref(), Side::Buy, signal).await?;
        } else if signal.p_short > SIGNAL_THRESHOLD && has_open_trade {
            if let Some(trade) = self.ledger.get_open_trade(&broker_name, symbol)? {
                if trade.side == Side::Buy {
                    self.execute_trade(symbol, &broker_name, broker.as_ref(), Side::Sell, signal).await?;
                }
            }
        }
        Ok(())
    }

    fn position_size(&self, equity: f64, risk: f64, atr: f64, sl_mult: f64, price: f64) -> f64 {
        let risk_based = if atr > 0.0 && sl_mult > 0.0 { risk * equity / (atr * sl_mult) } else { 0.0 };
        if self.config.max_position_notional > 0.0 && price > 0.0 {
            risk_based.min(self.config.max_position_notional / price)
        } else {
            risk_based
        }
    }

    fn scaled_risk(&self, confidence: f64) -> f64 {
        let base = self.config.risk_per_trade;
        let max = self.config.max_risk_per_trade;
        if confidence <= SIGNAL_THRESHOLD || max <= base {
            return base;
        }
        let scaled = base + (max - base) * (confidence - SIGNAL_THRESHOLD) / (1.0 - SIGNAL_THRESHOLD);
        scaled.clamp(base, max)
    }

    async fn execute_trade(
        &self,
        symbol: &str,
        broker_name: &str,
        broker: &dyn crate::broker::BrokerPort,
        side: Side,
        signal: &SignalRow,
    ) -> Result<(), RunnerError> {
        if self.config.execution_mode == crate::types::ExecutionMode::Live && !self.config.allow_live {
            return Err(RunnerError::Policy(PolicyError::LiveDisarmed));
        }

        match side {
            Side::Buy => self.execute_buy(symbol, broker_name, broker, signal).await,
            Side::Sell => self.execute_sell(symbol, broker_name, broker, signal).await,
        }
    }

    async fn execute_buy(
        &self,
        symbol: &str,
        broker_name: &str,
        broker: &dyn crate::broker::BrokerPort,
        signal: &SignalRow,
    ) -> Result<(), RunnerError> {
        let price = broker.get_current_price(symbol).await?;

        if self.config.pullback_mult > 0.0 && signal.atr > 0.0 {
            let max_entry = signal.close - signal.atr * self.config.pullback_mult;
            if price > max_entry {
                info!(symbol, price, max_entry, "price has not pulled back far enough, skipping buy signal");
                return Ok(());
            }
        }

        let confidence = signal.p_long.max(signal.p_short);
        let risk = self.scaled_risk(confidence);

        let account = broker.get_account_state().await?;
        let qty = self.position_size(account.equity, risk, signal.atr, 2.0, price);
        let qty = broker.normalize_qty(symbol, qty);
        if qty <= 0.0 {
            warn!(symbol, "computed position size is non-positive, skipping buy");
            return Ok(());
        }

        let signal_id = signal_fingerprint(symbol, signal.timestamp, signal.p_long, signal.p_short);
        let trade_id = make_trade_id(broker_name, symbol, &signal_id);
        let entry_client_id = make_client_id(broker_name, symbol, OrderRole::Entry, &signal_id);

        if !self
            .ledger
            .reserve_order(&entry_client_id, broker_name, symbol, OrderRole::Entry, Side::Buy, serde_json::json!({"qty": qty}))?
        {
            info!(symbol, "entry order already reserved, skipping duplicate submission");
            return Ok(());
        }

        self.ledger.upsert_trade(&trade_id, "default", broker_name, symbol, Side::Buy, &signal_id, &entry_client_id)?;

        let result = self
            .router
            .execute_order(
                broker_name,
                crate::broker::OrderRequest {
                    symbol: symbol.to_string(),
                    side: Side::Buy,
                    quantity: qty,
                    order_type: OrderType::Market,
                    price: None,
                    client_id: Some(entry_client_id.clone()),
                },
            )
            .await?;

        if result.status.is_terminal() {
            if result.status == OrderStatus::Filled {
                self.ledger.mark_order_final(&entry_client_id, result.status, serde_json::json!({"price": result.price}))?;
                self.ledger.set_trade_entry(&trade_id, result.price, result.quantity)?;

                let params = ArmParams {
                    broker: broker_name.to_string(),
                    trade_id: trade_id.clone(),
                    signal_id: signal_id.clone(),
                    side: PositionSide::Long,
                    qty: result.quantity,
                    entry_price: result.price,
                    atr: signal.atr,
                    sl_mult: 2.0,
                    tp_mult: 4.0,
                    use_native: self.config.use_native_protections,
                };
                self.protections.arm_after_entry(symbol, broker, params, self.config.strict_protections_live).await?;
                info!(symbol, price = result.price, qty = result.quantity, "buy executed and protections armed");
            } else {
                self.ledger.mark_order_final(&entry_client_id, result.status, serde_json::json!({}))?;
                self.ledger.abort_trade(&trade_id, &format!("entry_not_filled:{}", result.status))?;
                warn!(symbol, status = %result.status, "entry order reached a non-filled terminal status; trade aborted");
            }
        } else {
            self.ledger.mark_order_submitted(&entry_client_id, &result.order_id, serde_json::json!({}))?;
            let params = ArmParams {
                broker: broker_name.to_string(),
                trade_id: trade_id.clone(),
                signal_id: signal_id.clone(),
                side: PositionSide::Long,
                qty,
                entry_price: price,
                atr: signal.atr,
                sl_mult: 2.0,
                tp_mult: 4.0,
                use_native: self.config.use_native_protections,
            };
            self.protections.arm_pending(symbol, &params, entry_client_id, qty)?;
            info!(symbol, status = %result.status, "entry order non-final; pending-entry protection recorded");
        }
        Ok(())
    }

    async fn execute_sell(
        &self,
        symbol: &str,
        broker_name: &str,
        broker: &dyn crate::broker::BrokerPort,
        signal: &SignalRow,
    ) -> Result<(), RunnerError> {
        let positions = broker.list_open_positions().await?;
        let Some(position) = positions.into_iter().find(|p| p.symbol == symbol && p.quantity > 0.0) else {
            warn!(symbol, "sell signal received but venue reports no open position");
            return Ok(());
        };

        if self.config.pullback_mult > 0.0 && signal.atr > 0.0 {
            let price = broker.get_current_price(symbol).await?;
            let min_exit = signal.close + signal.atr * self.config.pullback_mult;
            if price < min_exit {
                info!(symbol, price, min_exit, "price has not pulled back far enough, skipping sell signal");
                return Ok(());
            }
        }

        let Some(trade) = self.ledger.get_open_trade(broker_name, symbol)? else {
            warn!(symbol, "sell signal received but ledger has no open trade");
            return Ok(());
        };

        let signal_id = trade.signal_id.clone();
        let exit_client_id = make_client_id(broker_name, symbol, OrderRole::Exit, &signal_id);
        if !self
            .ledger
            .reserve_order(&exit_client_id, broker_name, symbol, OrderRole::Exit, Side::Sell, serde_json::json!({"qty": position.quantity}))?
        {
            return Ok(());
        }

        let result = self
            .router
            .execute_order(
                broker_name,
                crate::broker::OrderRequest {
                    symbol: symbol.to_string(),
                    side: Side::Sell,
                    quantity: position.quantity,
                    order_type: OrderType::Market,
                    price: None,
                    client_id: Some(exit_client_id.clone()),
                },
            )
            .await?;

        self.ledger.mark_order_final(&exit_client_id, result.status, serde_json::json!({"price": result.price}))?;

        if result.status == OrderStatus::Filled {
            self.ledger.close_trade(&trade.trade_id, result.price, "signal_exit")?;
            if let Some(protection) = self.protections.get(symbol) {
                if let Some(native) = &protection.native {
                    for leg in [&native.sl, &native.tp].into_iter().flatten() {
                        if let Some(order_id) = &leg.order_id {
                            let _ = broker.cancel_plan_order(order_id).await;
                        }
                    }
                }
            }
            self.protections.drop_protection(symbol)?;
            info!(symbol, price = result.price, "sell executed, trade closed on signal");
        } else {
            warn!(symbol, status = %result.status, "exit order did not fill; trade left open, not recorded as closed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Heartbeat & kill switch
    // -------------------------------------------------------------------

    fn touch_heartbeat(&self, status: &str, reason: Option<String>) -> Result<(), RunnerError> {
        let heartbeat = Heartbeat { ts: Utc::now().timestamp(), status: status.to_string(), reason };
        state_store::write_json(&self.config.heartbeat_file, &heartbeat).map_err(RunnerError::Store)
    }

    pub async fn engage_kill_switch(&self, reason: &str) -> Result<(), RunnerError> {
        let _lock = self.trading_lock.lock().await;
        self.kill_switch.store(true, Ordering::SeqCst);
        state_store::write_json(&self.config.kill_switch_file, &true).map_err(RunnerError::Store)?;

        for symbol in self.protections.symbols() {
            let Some(protection) = self.protections.get(&symbol) else { continue };
            if let Some(native) = &protection.native {
                if let Some(broker) = self.router.broker_by_name(&protection.broker) {
                    for leg in [&native.sl, &native.tp].into_iter().flatten() {
                        if let Some(order_id) = &leg.order_id {
                            if let Err(e) = broker.cancel_plan_order(order_id).await {
                                if !e.is_unsupported() {
                                    error!(symbol, order_id, error = %e, "kill switch: failed to cancel native protection leg");
                                }
                            }
                        }
                    }
                }
            }
        }

        self.router.close_all_positions(reason).await;

        for symbol in self.protections.symbols() {
            self.protections.drop_protection(&symbol)?;
        }

        self.touch_heartbeat("stopped", Some(reason.to_string()))?;
        self.alerter.send(&format!("kill switch engaged: {reason}")).await;
        error!(reason, "kill switch engaged");
        Ok(())
    }

    /// Runs cycles forever at `config.sleep_interval`, engaging the kill
    /// switch after `runner_max_consecutive_errors` consecutive failures.
    pub async fn run_forever(&self, mut load_signals: impl FnMut() -> HashMap<String, SignalRow>) -> Result<(), RunnerError> {
        let mut consecutive_errors: u32 = 0;
        loop {
            if self.kill_switch_engaged() {
                info!("kill switch active, stopping runner");
                return Ok(());
            }

            let signals = load_signals();
            match self.run_cycle(&signals).await {
                Ok(()) => consecutive_errors = 0,
                Err(RunnerError::Policy(PolicyError::KillSwitchActive)) => {
                    info!("kill switch active, stopping runner");
                    return Ok(());
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, consecutive_errors, "cycle failed");
                    if consecutive_errors >= self.config.runner_max_consecutive_errors {
                        self.engage_kill_switch(&format!("{consecutive_errors} consecutive cycle failures: {e}")).await?;
                        return Ok(());
                    }
                }
            }

            tokio::time::sleep(self.config.sleep_interval).await;
        }
    }

    pub fn account_state_file(&self) -> PathBuf {
        self.config.state_dir.clone()
    }
}
